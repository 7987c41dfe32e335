//! Reference interpreter.
//!
//! Executes laid-out program blocks straight from image memory, the same way the
//! injected runtime does: the header is found through a stub's relative field, the
//! image base is recovered from `self_rva`, and instructions are fetched through
//! the offset table. Flag results follow x86 semantics so a virtualized function
//! can be compared against what its native body computes.

use std::collections::HashMap;

use thiserror::Error;

use super::{decode, AluOp, OpcodeMap, UnaryOp, VmInstruction, HEADER_SIZE};
use crate::isa::x86::REG_SP;
use crate::model::{Architecture, FixupTarget, Flags, OperandSize};

/// A fault raised while interpreting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Trap {
    #[error("access to unmapped address {address:#x}")]
    Unmapped { address: u64 },

    #[error("undefined opcode at {address:#x}")]
    BadOpcode { address: u64 },

    #[error("instruction index {index} out of range")]
    BadIndex { index: i64 },

    #[error("evaluation stack underflow")]
    StackUnderflow,

    #[error("step limit exceeded")]
    StepLimit,

    #[error("managed return inside a native program")]
    UnexpectedReturn,
}

/// Byte-addressed memory seen by the interpreter.
pub trait Memory {
    fn read_u8(&self, address: u64) -> Result<u8, Trap>;
    fn write_u8(&mut self, address: u64, value: u8) -> Result<(), Trap>;

    fn read(&self, address: u64, size: OperandSize) -> Result<u64, Trap> {
        let mut value = 0u64;
        for i in (0..size.bytes()).rev() {
            value = value << 8 | u64::from(self.read_u8(address.wrapping_add(i))?);
        }
        Ok(value)
    }

    fn write(&mut self, address: u64, size: OperandSize, value: u64) -> Result<(), Trap> {
        for i in 0..size.bytes() {
            self.write_u8(address.wrapping_add(i), (value >> (8 * i)) as u8)?;
        }
        Ok(())
    }
}

/// Memory made of explicitly mapped byte ranges.
#[derive(Debug, Default, Clone)]
pub struct SparseMemory {
    bytes: HashMap<u64, u8>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the file-backed bytes of every segment, zero-filling the rest of each.
    pub fn from_image(arch: &Architecture) -> Self {
        let mut memory = Self::new();
        for segment in &arch.segments {
            memory.map(segment.address, &segment.data);
            let tail = segment.size.saturating_sub(segment.data.len() as u64);
            memory.map_zeroed(segment.address + segment.data.len() as u64, tail);
        }
        memory
    }

    pub fn map(&mut self, address: u64, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.bytes.insert(address + i as u64, b);
        }
    }

    pub fn map_zeroed(&mut self, address: u64, len: u64) {
        for i in 0..len {
            self.bytes.insert(address + i, 0);
        }
    }
}

impl Memory for SparseMemory {
    fn read_u8(&self, address: u64) -> Result<u8, Trap> {
        self.bytes.get(&address).copied().ok_or(Trap::Unmapped { address })
    }

    fn write_u8(&mut self, address: u64, value: u8) -> Result<(), Trap> {
        match self.bytes.get_mut(&address) {
            Some(b) => {
                *b = value;
                Ok(())
            }
            None => Err(Trap::Unmapped { address }),
        }
    }
}

/// Register file and flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    pub regs: Vec<u64>,
    pub flags: Flags,
}

impl Cpu {
    /// General-purpose registers of a native machine.
    pub fn native() -> Self {
        Self {
            regs: vec![0; 16],
            flags: Flags::empty(),
        }
    }

    /// The 256 virtual registers of a managed program.
    pub fn managed(args: &[u64]) -> Self {
        let mut regs = vec![0; 256];
        for (reg, &arg) in regs.iter_mut().zip(args) {
            *reg = arg;
        }
        Self {
            regs,
            flags: Flags::empty(),
        }
    }
}

/// How a program left the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leave {
    Exit(u64),
    Ret(u64),
}

fn parity(value: u64) -> bool {
    (value as u8).count_ones() % 2 == 0
}

fn result_flags(result: u64, size: OperandSize) -> Flags {
    let mut flags = Flags::empty();
    flags.set(Flags::ZF, result & size.mask() == 0);
    flags.set(Flags::SF, result & size.sign_bit() != 0);
    flags.set(Flags::PF, parity(result));
    flags
}

/// Computes `a op b` at `size` with x86 flag semantics.
///
/// Shifts by a masked count of zero return `flags` unchanged.
pub fn alu(op: AluOp, size: OperandSize, a: u64, b: u64, flags: Flags) -> (u64, Flags) {
    let mask = size.mask();
    let sign = size.sign_bit();
    let bits = u64::from(size.bits());
    let (a, b) = (a & mask, b & mask);
    let mut out = Flags::empty();
    let result = match op {
        AluOp::Add => {
            let r = a.wrapping_add(b) & mask;
            out.set(Flags::CF, u128::from(a) + u128::from(b) > u128::from(mask));
            out.set(Flags::OF, (a ^ r) & (b ^ r) & sign != 0);
            out.set(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
            r
        }
        AluOp::Sub => {
            let r = a.wrapping_sub(b) & mask;
            out.set(Flags::CF, a < b);
            out.set(Flags::OF, (a ^ b) & (a ^ r) & sign != 0);
            out.set(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
            r
        }
        AluOp::And => a & b,
        AluOp::Or => a | b,
        AluOp::Xor => a ^ b,
        AluOp::Shl | AluOp::Shr | AluOp::Sar => {
            let count = b & if size == OperandSize::Qword { 0x3F } else { 0x1F };
            if count == 0 {
                return (a, flags);
            }
            let (r, carry, overflow) = match op {
                AluOp::Shl => {
                    let r = if count >= bits { 0 } else { (a << count) & mask };
                    let carry = count <= bits && (a >> (bits - count)) & 1 != 0;
                    (r, carry, (r & sign != 0) != carry)
                }
                AluOp::Shr => {
                    let r = if count >= bits { 0 } else { a >> count };
                    let carry = count <= bits && (a >> (count - 1)) & 1 != 0;
                    (r, carry, a & sign != 0)
                }
                _ => {
                    let signed = size.sign_extend(a) as i64;
                    let r = (signed >> count.min(bits - 1)) as u64 & mask;
                    let carry = (signed >> (count.min(bits) - 1)) & 1 != 0;
                    (r, carry, false)
                }
            };
            out.set(Flags::CF, carry);
            out.set(Flags::OF, overflow);
            r
        }
        AluOp::Imul => {
            let product = i128::from(size.sign_extend(a) as i64) * i128::from(size.sign_extend(b) as i64);
            let r = product as u64 & mask;
            let lossy = i128::from(size.sign_extend(r) as i64) != product;
            out.set(Flags::CF, lossy);
            out.set(Flags::OF, lossy);
            r
        }
    };
    (result, out | result_flags(result, size))
}

/// Computes a unary operation; `not` leaves the flags untouched.
pub fn unary(op: UnaryOp, size: OperandSize, a: u64, flags: Flags) -> (u64, Flags) {
    let a = a & size.mask();
    match op {
        UnaryOp::Not => (!a & size.mask(), flags),
        UnaryOp::Neg => {
            let r = a.wrapping_neg() & size.mask();
            let mut out = result_flags(r, size);
            out.set(Flags::CF, a != 0);
            out.set(Flags::OF, a == size.sign_bit());
            out.set(Flags::AF, (a ^ r) & 0x10 != 0);
            (r, out)
        }
    }
}

fn pop(stack: &mut Vec<u64>) -> Result<u64, Trap> {
    stack.pop().ok_or(Trap::StackUnderflow)
}

/// Return address pushed by [`Interpreter::call`]; reaching it ends the call.
pub const RETURN_SENTINEL: u64 = 0x5EED_0000;

/// Interprets VM programs out of a [`Memory`].
pub struct Interpreter<M: Memory> {
    pub memory: M,
    word: OperandSize,
    vm_entry: u64,
    map: OpcodeMap,
    pub step_limit: u64,
}

impl<M: Memory> Interpreter<M> {
    pub fn new(memory: M, word: OperandSize, vm_entry: u64, map: OpcodeMap) -> Self {
        Self {
            memory,
            word,
            vm_entry,
            map,
            step_limit: 1_000_000,
        }
    }

    fn u32_at(&self, address: u64) -> Result<u64, Trap> {
        self.memory.read(address, OperandSize::Dword)
    }

    /// Whether `address` holds an entry stub that calls the runtime.
    fn stub_field(&self, address: u64) -> Option<u64> {
        if self.memory.read_u8(address).ok()? != 0xE8 {
            return None;
        }
        let rel = self.u32_at(address + 1).ok()? as u32 as i32;
        let field = address + 5;
        (field.wrapping_add(rel as i64 as u64) == self.vm_entry).then_some(field)
    }

    /// Calls the native function at `function` with the register state in `cpu`.
    ///
    /// Code reached through a VM stub runs in the interpreter; any other address is
    /// handed to `native`, which emulates that function's body. The interpreter
    /// performs the native function's return.
    pub fn call(
        &mut self,
        cpu: &mut Cpu,
        function: u64,
        native: &mut dyn FnMut(u64, &mut Cpu, &mut M) -> Result<(), Trap>,
    ) -> Result<(), Trap> {
        let w = self.word;
        let sentinel = RETURN_SENTINEL & w.mask();
        let sp = usize::from(REG_SP);
        cpu.regs[sp] = cpu.regs[sp].wrapping_sub(w.bytes()) & w.mask();
        self.memory.write(cpu.regs[sp], w, sentinel)?;

        let mut pc = function;
        let mut steps = 0u64;
        while pc != sentinel {
            steps += 1;
            if steps > self.step_limit {
                return Err(Trap::StepLimit);
            }
            if let Some(field) = self.stub_field(pc) {
                let rel = self.u32_at(field)? as u32 as i32;
                let header = field.wrapping_add(rel as i64 as u64);
                let index = self.u32_at(field + 4)?;
                match self.run(cpu, header, index as i64)? {
                    Leave::Exit(target) => pc = target,
                    Leave::Ret(_) => return Err(Trap::UnexpectedReturn),
                }
            } else {
                native(pc, cpu, &mut self.memory)?;
                pc = self.memory.read(cpu.regs[sp], w)?;
                cpu.regs[sp] = cpu.regs[sp].wrapping_add(w.bytes()) & w.mask();
            }
        }
        Ok(())
    }

    /// Runs a managed program with the given argument values.
    pub fn call_managed(&mut self, header: u64, args: &[u64]) -> Result<u64, Trap> {
        let mut cpu = Cpu::managed(args);
        match self.run(&mut cpu, header, 0)? {
            Leave::Ret(value) => Ok(value),
            Leave::Exit(target) => Err(Trap::Unmapped { address: target }),
        }
    }

    /// Runs the program whose header is at `header`, starting at `index`.
    pub fn run(&mut self, cpu: &mut Cpu, header: u64, mut index: i64) -> Result<Leave, Trap> {
        let w = self.word;
        let base = header.wrapping_sub(self.u32_at(header)?);
        let count = self.u32_at(header + 8)? as i64;
        let table = header + u64::from(HEADER_SIZE);
        let code = table + count as u64 * 4;
        let mut stack: Vec<u64> = Vec::new();
        let mut steps = 0u64;

        loop {
            steps += 1;
            if steps > self.step_limit {
                return Err(Trap::StepLimit);
            }
            if index < 0 || index >= count {
                return Err(Trap::BadIndex { index });
            }
            let at = code + self.u32_at(table + index as u64 * 4)?;
            let mut raw = [0u8; 9];
            for (i, b) in raw.iter_mut().enumerate() {
                match self.memory.read_u8(at + i as u64) {
                    Ok(v) => *b = v,
                    Err(_) if i > 0 => break,
                    Err(e) => return Err(e),
                }
            }
            let (instruction, _) = decode(&raw, &self.map).ok_or(Trap::BadOpcode { address: at })?;

            let mut next = index + 1;
            match instruction {
                VmInstruction::Nop => {}
                VmInstruction::PushImm32(v) => stack.push(v as i64 as u64 & w.mask()),
                VmInstruction::PushImm64(v) => stack.push(v & w.mask()),
                VmInstruction::PushAddr(target) => {
                    let rva = match target {
                        FixupTarget::Address(rva) => rva,
                        _ => return Err(Trap::BadOpcode { address: at }),
                    };
                    stack.push(base.wrapping_add(rva) & w.mask());
                }
                VmInstruction::PushReg(r) => stack.push(cpu.regs[usize::from(r)]),
                VmInstruction::PopReg(r) => {
                    let v = pop(&mut stack)?;
                    cpu.regs[usize::from(r)] = v;
                }
                VmInstruction::Load(size) => {
                    let address = pop(&mut stack)?;
                    let v = self.memory.read(address, size)?;
                    stack.push(v);
                }
                VmInstruction::Store(size) => {
                    let v = pop(&mut stack)?;
                    let address = pop(&mut stack)?;
                    self.memory.write(address, size, v)?;
                }
                VmInstruction::Dup => {
                    let v = pop(&mut stack)?;
                    stack.extend([v, v]);
                }
                VmInstruction::Swap => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.extend([b, a]);
                }
                VmInstruction::Drop => {
                    pop(&mut stack)?;
                }
                VmInstruction::Zext(size) => {
                    let v = pop(&mut stack)?;
                    stack.push(v & size.mask());
                }
                VmInstruction::Sext(size) => {
                    let v = pop(&mut stack)?;
                    stack.push(size.sign_extend(v) & w.mask());
                }
                VmInstruction::Alu { op, size, flags } => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    let (r, f) = alu(op, size, a, b, cpu.flags);
                    cpu.flags = (cpu.flags - flags) | (f & flags);
                    stack.push(r);
                }
                VmInstruction::Unary { op, size, flags } => {
                    let a = pop(&mut stack)?;
                    let (r, f) = unary(op, size, a, cpu.flags);
                    cpu.flags = (cpu.flags - flags) | (f & flags);
                    stack.push(r);
                }
                VmInstruction::Cond(c) => stack.push(u64::from(c.eval(cpu.flags))),
                VmInstruction::Select => {
                    let c = pop(&mut stack)?;
                    let t = pop(&mut stack)?;
                    let f = pop(&mut stack)?;
                    stack.push(if c != 0 { t } else { f });
                }
                VmInstruction::Jmp(delta) => next = index + i64::from(delta),
                VmInstruction::Jcc(c, delta) => {
                    if c.eval(cpu.flags) {
                        next = index + i64::from(delta);
                    }
                }
                VmInstruction::Exit => {
                    let target = pop(&mut stack)?;
                    let sp = cpu.regs[usize::from(REG_SP)];
                    self.memory.write(sp.wrapping_sub(w.bytes()) & w.mask(), w, target)?;
                    return Ok(Leave::Exit(target));
                }
                VmInstruction::Ret => return Ok(Leave::Ret(pop(&mut stack)?)),
            }
            index = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProgramId;
    use crate::vm::encode;

    #[test]
    fn add_and_sub_flags() {
        let (r, f) = alu(AluOp::Add, OperandSize::Byte, 0x7F, 1, Flags::empty());
        assert_eq!(r, 0x80);
        assert!(f.contains(Flags::OF | Flags::SF | Flags::AF));
        assert!(!f.contains(Flags::CF));

        let (r, f) = alu(AluOp::Add, OperandSize::Dword, 0xFFFF_FFFF, 1, Flags::empty());
        assert_eq!(r, 0);
        assert!(f.contains(Flags::CF | Flags::ZF | Flags::PF));

        let (r, f) = alu(AluOp::Sub, OperandSize::Qword, 1, 2, Flags::empty());
        assert_eq!(r, u64::MAX);
        assert!(f.contains(Flags::CF | Flags::SF));
        assert!(!f.contains(Flags::OF));
    }

    #[test]
    fn shifts_and_multiply() {
        let (r, f) = alu(AluOp::Shl, OperandSize::Byte, 0x81, 1, Flags::empty());
        assert_eq!(r, 0x02);
        assert!(f.contains(Flags::CF | Flags::OF));

        let (r, f) = alu(AluOp::Sar, OperandSize::Word, 0x8000, 15, Flags::empty());
        assert_eq!(r, 0xFFFF);
        assert!(!f.contains(Flags::CF));

        let (r, f) = alu(AluOp::Shr, OperandSize::Qword, 5, 0, Flags::ZF);
        assert_eq!((r, f), (5, Flags::ZF));

        let (r, f) = alu(AluOp::Imul, OperandSize::Dword, 0x10000, 0x10000, Flags::empty());
        assert_eq!(r, 0);
        assert!(f.contains(Flags::CF | Flags::OF));

        let (r, f) = unary(UnaryOp::Neg, OperandSize::Dword, 1, Flags::empty());
        assert_eq!(r, 0xFFFF_FFFF);
        assert!(f.contains(Flags::CF | Flags::SF));
    }

    #[test]
    fn runs_a_managed_loop() {
        // sum = 0; while (n != 0) { sum += n; n -= 1 } return sum
        let program = [
            VmInstruction::PushImm32(0),
            VmInstruction::PopReg(1),
            VmInstruction::PushReg(0),
            VmInstruction::PushImm32(0),
            VmInstruction::Alu {
                op: AluOp::Sub,
                size: OperandSize::Dword,
                flags: Flags::ARITHMETIC,
            },
            VmInstruction::Drop,
            VmInstruction::Jcc(crate::model::Cond::E, 12),
            VmInstruction::PushReg(1),
            VmInstruction::PushReg(0),
            VmInstruction::Alu {
                op: AluOp::Add,
                size: OperandSize::Dword,
                flags: Flags::empty(),
            },
            VmInstruction::PopReg(1),
            VmInstruction::PushReg(0),
            VmInstruction::PushImm32(1),
            VmInstruction::Alu {
                op: AluOp::Sub,
                size: OperandSize::Dword,
                flags: Flags::empty(),
            },
            VmInstruction::PopReg(0),
            VmInstruction::Jmp(-13),
            VmInstruction::Nop,
            VmInstruction::Nop,
            VmInstruction::PushReg(1),
            VmInstruction::Ret,
        ];
        let map = OpcodeMap::new(3);
        let (mut bytes, _) = encode(ProgramId(0), &program, &[], true, &map).expect("encodes");
        let base = 0x10000u64;
        let header = base + 0x2000;
        bytes[..4].copy_from_slice(&0x2000u32.to_le_bytes());

        let mut memory = SparseMemory::new();
        memory.map(header, &bytes);
        let mut interp = Interpreter::new(memory, OperandSize::Qword, 0, map);
        assert_eq!(interp.call_managed(header, &[4]), Ok(10));
        assert_eq!(interp.call_managed(header, &[0]), Ok(0));
    }
}
