//! The native interpreter injected into protected images.
//!
//! The runtime block starts with a table of 256 `u32` handler offsets, indexed by
//! opcode byte and relative to the start of the block, followed by position
//! independent code. Opcodes the map leaves unassigned point at `ud2`.
//!
//! `vm_entry` is reached by the `call` at the start of an entry stub, so its return
//! address is the stub's header field. It moves the machine stack pointer
//! [`STACK_GAP`] bytes down, saves the registers and flags into a context there and
//! uses the rest of the machine stack as the evaluation stack. While a program
//! runs, the context pointer lives in `bx`, the current instruction in `si`, its
//! index in `di` and the runtime base in `bp`.
//!
//! Context layout, in words: saved registers by number, flags, header address,
//! instruction count, offset table address, code address, image base.

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};

use super::profile::STACK_GAP;
use super::{AluOp, OpcodeMap, UnaryOp, VmInstruction, HANDLER_COUNT};
use crate::model::{AddressSize, Cond, OperandSize};

/// Size of the handler table at the start of the runtime.
pub const TABLE_SIZE: u64 = 256 * 4;

/// An assembled runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
    pub bytes: Vec<u8>,
    /// Offset of `vm_entry` from the start of `bytes`.
    pub entry_offset: u64,
}

/// Assembles the runtime for images of the given address size.
pub fn build(address_size: AddressSize, map: &OpcodeMap) -> Result<Runtime, IcedError> {
    match address_size {
        AddressSize::U64 => build64(map),
        AddressSize::U32 => build32(map),
    }
}

fn sext32_64(a: &mut CodeAssembler, src: AsmMemoryOperand) -> Result<(), IcedError> {
    a.movsxd(rax, src)
}

fn sext32_32(a: &mut CodeAssembler, src: AsmMemoryOperand) -> Result<(), IcedError> {
    a.mov(eax, src)
}

/// `a op= b` on the accumulator and count registers at `size`.
fn alu_op(a: &mut CodeAssembler, op: AluOp, size: OperandSize) -> Result<(), IcedError> {
    macro_rules! sized {
        ($method:ident) => {
            match size {
                OperandSize::Byte => a.$method(al, cl),
                OperandSize::Word => a.$method(ax, cx),
                OperandSize::Dword => a.$method(eax, ecx),
                OperandSize::Qword => a.$method(rax, rcx),
            }
        };
    }
    macro_rules! shift {
        ($method:ident) => {
            match size {
                OperandSize::Byte => a.$method(al, cl),
                OperandSize::Word => a.$method(ax, cl),
                OperandSize::Dword => a.$method(eax, cl),
                OperandSize::Qword => a.$method(rax, cl),
            }
        };
    }
    match op {
        AluOp::Add => sized!(add),
        AluOp::Sub => sized!(sub),
        AluOp::And => sized!(and),
        AluOp::Or => sized!(or),
        AluOp::Xor => sized!(xor),
        AluOp::Shl => shift!(shl),
        AluOp::Shr => shift!(shr),
        AluOp::Sar => shift!(sar),
        AluOp::Imul => match size {
            OperandSize::Byte => a.imul(cl),
            OperandSize::Word => a.imul_2(ax, cx),
            OperandSize::Dword => a.imul_2(eax, ecx),
            OperandSize::Qword => a.imul_2(rax, rcx),
        },
    }
}

fn unary_op(a: &mut CodeAssembler, op: UnaryOp, size: OperandSize) -> Result<(), IcedError> {
    match (op, size) {
        (UnaryOp::Neg, OperandSize::Byte) => a.neg(al),
        (UnaryOp::Neg, OperandSize::Word) => a.neg(ax),
        (UnaryOp::Neg, OperandSize::Dword) => a.neg(eax),
        (UnaryOp::Neg, OperandSize::Qword) => a.neg(rax),
        (UnaryOp::Not, OperandSize::Byte) => a.not(al),
        (UnaryOp::Not, OperandSize::Word) => a.not(ax),
        (UnaryOp::Not, OperandSize::Dword) => a.not(eax),
        (UnaryOp::Not, OperandSize::Qword) => a.not(rax),
    }
}

/// Zero-extends the accumulator from `size`.
fn zero_extend(a: &mut CodeAssembler, size: OperandSize) -> Result<(), IcedError> {
    match size {
        OperandSize::Byte => a.movzx(eax, al),
        OperandSize::Word => a.movzx(eax, ax),
        OperandSize::Dword => a.mov(eax, eax),
        OperandSize::Qword => Ok(()),
    }
}

fn set_if(a: &mut CodeAssembler, cc: Cond) -> Result<(), IcedError> {
    match cc {
        Cond::O => a.seto(al),
        Cond::No => a.setno(al),
        Cond::B => a.setb(al),
        Cond::Ae => a.setae(al),
        Cond::E => a.sete(al),
        Cond::Ne => a.setne(al),
        Cond::Be => a.setbe(al),
        Cond::A => a.seta(al),
        Cond::S => a.sets(al),
        Cond::Ns => a.setns(al),
        Cond::P => a.setp(al),
        Cond::Np => a.setnp(al),
        Cond::L => a.setl(al),
        Cond::Ge => a.setge(al),
        Cond::Le => a.setle(al),
        Cond::G => a.setg(al),
    }
}

fn jump_if(a: &mut CodeAssembler, cc: Cond, label: CodeLabel) -> Result<(), IcedError> {
    match cc {
        Cond::O => a.jo(label),
        Cond::No => a.jno(label),
        Cond::B => a.jb(label),
        Cond::Ae => a.jae(label),
        Cond::E => a.je(label),
        Cond::Ne => a.jne(label),
        Cond::Be => a.jbe(label),
        Cond::A => a.ja(label),
        Cond::S => a.js(label),
        Cond::Ns => a.jns(label),
        Cond::P => a.jp(label),
        Cond::Np => a.jnp(label),
        Cond::L => a.jl(label),
        Cond::Ge => a.jge(label),
        Cond::Le => a.jle(label),
        Cond::G => a.jg(label),
    }
}

macro_rules! interpreter {
    (
        $name:ident, bits: $bits:expr, word: $w:expr,
        regs: [$($reg:ident),+],
        ax: $ax:ident, bx: $bx:ident, cx: $cx:ident, dx: $dx:ident,
        si: $si:ident, di: $di:ident, bp: $bp:ident, sp: $sp:ident,
        ptr: $wptr:ident, pushf: $pushf:ident, popf: $popf:ident, sext32: $sext32:ident
    ) => {
        fn $name(map: &OpcodeMap) -> Result<Runtime, IcedError> {
            let w: i32 = $w;
            let scale = $w as u32;
            let gap = STACK_GAP as i32;
            let regs = [$($reg),+];
            let flags = regs.len() as i32 * w;
            let header = flags + w;
            let count = header + w;
            let table = count + w;
            let code = table + w;
            let base = code + w;
            let frame = base + w;

            let mut a = CodeAssembler::new($bits)?;
            let mut entry = a.create_label();
            let mut dispatch = a.create_label();
            let mut next = a.create_label();
            let mut trap = a.create_label();
            let mut handlers: Vec<CodeLabel> = (0..HANDLER_COUNT).map(|_| a.create_label()).collect();

            // New flags in dx; replaces the masked VM flags.
            macro_rules! merge_flags {
                ($asm:ident) => {
                    $asm.movzx(ecx, word_ptr($si + 1))?;
                    $asm.and($dx, $cx)?;
                    $asm.not($cx)?;
                    $asm.and($wptr($bx + flags), $cx)?;
                    $asm.or($wptr($bx + flags), $dx)?;
                };
            }

            a.set_label(&mut entry)?;
            a.lea($sp, ptr($sp - gap))?;
            a.$pushf()?;
            a.sub($sp, frame)?;
            for (i, &reg) in regs.iter().enumerate() {
                if i != 4 {
                    a.mov($wptr($sp + i as i32 * w), reg)?;
                }
            }
            a.mov($bx, $sp)?;
            // The emulated stack pointer is the one the stub's caller left.
            a.lea($ax, ptr($bx + (frame + w + gap + w)))?;
            a.mov($wptr($bx + 4 * w), $ax)?;
            a.mov($ax, $wptr($bx + frame))?;
            a.mov($wptr($bx + flags), $ax)?;
            a.mov($cx, $wptr($bx + (frame + w + gap)))?;
            a.mov(edi, dword_ptr($cx + 4))?;
            $sext32(&mut a, dword_ptr($cx))?;
            a.add($cx, $ax)?;
            a.mov($wptr($bx + header), $cx)?;
            a.mov(eax, dword_ptr($cx))?;
            a.mov($dx, $cx)?;
            a.sub($dx, $ax)?;
            a.mov($wptr($bx + base), $dx)?;
            a.mov(eax, dword_ptr($cx + 4))?;
            a.lea($bp, ptr($dx + $ax * 1))?;
            a.mov(eax, dword_ptr($cx + 8))?;
            a.mov($wptr($bx + count), $ax)?;
            a.lea($dx, ptr($cx + 12))?;
            a.mov($wptr($bx + table), $dx)?;
            a.lea($dx, ptr($dx + $ax * 4))?;
            a.mov($wptr($bx + code), $dx)?;

            a.set_label(&mut dispatch)?;
            a.cmp($di, $wptr($bx + count))?;
            a.jae(trap)?;
            a.mov($dx, $wptr($bx + table))?;
            a.mov(esi, dword_ptr($dx + $di * 4))?;
            a.add($si, $wptr($bx + code))?;
            a.movzx(eax, byte_ptr($si))?;
            a.mov(eax, dword_ptr($bp + $ax * 4))?;
            a.add($ax, $bp)?;
            a.jmp($ax)?;

            a.set_label(&mut next)?;
            a.add($di, 1)?;
            a.jmp(dispatch)?;

            a.set_label(&mut trap)?;
            a.ud2()?;

            for (h, label) in handlers.iter_mut().enumerate() {
                let Some(shape) = VmInstruction::from_handler(h as u8) else {
                    continue;
                };
                a.set_label(label)?;
                match shape {
                    VmInstruction::Nop => {}
                    VmInstruction::PushImm32(_) => {
                        $sext32(&mut a, dword_ptr($si + 1))?;
                        a.push($ax)?;
                    }
                    VmInstruction::PushImm64(_) => a.push($wptr($si + 1))?,
                    VmInstruction::PushAddr(_) => {
                        a.mov(eax, dword_ptr($si + 1))?;
                        a.add($ax, $wptr($bx + base))?;
                        a.push($ax)?;
                    }
                    VmInstruction::PushReg(_) => {
                        a.movzx(eax, byte_ptr($si + 1))?;
                        a.push($wptr($bx + $ax * scale))?;
                    }
                    VmInstruction::PopReg(_) => {
                        a.movzx(eax, byte_ptr($si + 1))?;
                        a.pop($wptr($bx + $ax * scale))?;
                    }
                    VmInstruction::Load(OperandSize::Qword) | VmInstruction::Store(OperandSize::Qword)
                        if $w == 4 =>
                    {
                        a.jmp(trap)?;
                        continue;
                    }
                    VmInstruction::Load(size) => {
                        a.pop($ax)?;
                        match size {
                            OperandSize::Byte => a.movzx(eax, byte_ptr($ax))?,
                            OperandSize::Word => a.movzx(eax, word_ptr($ax))?,
                            OperandSize::Dword => a.mov(eax, dword_ptr($ax))?,
                            OperandSize::Qword => a.mov($ax, $wptr($ax))?,
                        }
                        a.push($ax)?;
                    }
                    VmInstruction::Store(size) => {
                        a.pop($cx)?;
                        a.pop($ax)?;
                        match size {
                            OperandSize::Byte => a.mov(byte_ptr($ax), cl)?,
                            OperandSize::Word => a.mov(word_ptr($ax), cx)?,
                            OperandSize::Dword => a.mov(dword_ptr($ax), ecx)?,
                            OperandSize::Qword => a.mov($wptr($ax), $cx)?,
                        }
                    }
                    VmInstruction::Dup => a.push($wptr($sp))?,
                    VmInstruction::Swap => {
                        a.pop($ax)?;
                        a.pop($cx)?;
                        a.push($ax)?;
                        a.push($cx)?;
                    }
                    VmInstruction::Drop => a.lea($sp, ptr($sp + w))?,
                    VmInstruction::Zext(size) => match size {
                        OperandSize::Qword => {}
                        OperandSize::Dword if $w == 4 => {}
                        _ => {
                            a.mov($ax, $wptr($sp))?;
                            zero_extend(&mut a, size)?;
                            a.mov($wptr($sp), $ax)?;
                        }
                    },
                    VmInstruction::Sext(size) => match size {
                        OperandSize::Qword => {}
                        OperandSize::Dword if $w == 4 => {}
                        OperandSize::Dword => {
                            $sext32(&mut a, dword_ptr($sp))?;
                            a.mov($wptr($sp), $ax)?;
                        }
                        OperandSize::Word => {
                            a.movsx($ax, word_ptr($sp))?;
                            a.mov($wptr($sp), $ax)?;
                        }
                        OperandSize::Byte => {
                            a.movsx($ax, byte_ptr($sp))?;
                            a.mov($wptr($sp), $ax)?;
                        }
                    },
                    VmInstruction::Alu { size: OperandSize::Qword, .. }
                    | VmInstruction::Unary { size: OperandSize::Qword, .. }
                        if $w == 4 =>
                    {
                        a.jmp(trap)?;
                        continue;
                    }
                    VmInstruction::Alu { op, size, .. } => {
                        a.pop($cx)?;
                        a.pop($ax)?;
                        a.push($wptr($bx + flags))?;
                        a.$popf()?;
                        alu_op(&mut a, op, size)?;
                        a.$pushf()?;
                        a.pop($dx)?;
                        zero_extend(&mut a, size)?;
                        merge_flags!(a);
                        a.push($ax)?;
                    }
                    VmInstruction::Unary { op, size, .. } => {
                        a.pop($ax)?;
                        a.push($wptr($bx + flags))?;
                        a.$popf()?;
                        unary_op(&mut a, op, size)?;
                        a.$pushf()?;
                        a.pop($dx)?;
                        zero_extend(&mut a, size)?;
                        merge_flags!(a);
                        a.push($ax)?;
                    }
                    VmInstruction::Cond(cc) => {
                        a.push($wptr($bx + flags))?;
                        a.$popf()?;
                        set_if(&mut a, cc)?;
                        a.movzx(eax, al)?;
                        a.push($ax)?;
                    }
                    VmInstruction::Select => {
                        a.pop($cx)?;
                        a.pop($ax)?;
                        a.pop($dx)?;
                        a.test($cx, $cx)?;
                        a.cmove($ax, $dx)?;
                        a.push($ax)?;
                    }
                    VmInstruction::Jmp(_) => {
                        $sext32(&mut a, dword_ptr($si + 1))?;
                        a.add($di, $ax)?;
                        a.jmp(dispatch)?;
                        continue;
                    }
                    VmInstruction::Jcc(cc, _) => {
                        a.push($wptr($bx + flags))?;
                        a.$popf()?;
                        jump_if(&mut a, cc.negate(), next)?;
                        $sext32(&mut a, dword_ptr($si + 1))?;
                        a.add($di, $ax)?;
                        a.jmp(dispatch)?;
                        continue;
                    }
                    VmInstruction::Exit => {
                        a.pop($ax)?;
                        a.mov($cx, $wptr($bx + 4 * w))?;
                        a.mov($wptr($cx - w), $ax)?;
                        a.push($wptr($bx + flags))?;
                        a.$popf()?;
                        for (i, &reg) in regs.iter().enumerate() {
                            if i != 3 && i != 4 {
                                a.mov(reg, $wptr($bx + i as i32 * w))?;
                            }
                        }
                        a.lea($sp, ptr($bx + 3 * w))?;
                        a.pop($bx)?;
                        a.mov($sp, $wptr($sp))?;
                        a.lea($sp, ptr($sp - w))?;
                        a.ret()?;
                        continue;
                    }
                    // Managed programs never run here.
                    VmInstruction::Ret => {
                        a.jmp(trap)?;
                        continue;
                    }
                }
                a.jmp(next)?;
            }

            let result = a.assemble_options(TABLE_SIZE, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
            let trap_ip = result.label_ip(&trap)?;
            let mut bytes = Vec::with_capacity(TABLE_SIZE as usize + result.inner.code_buffer.len());
            for opcode in 0..=255u8 {
                let ip = match map.handler(opcode) {
                    Some(h) => result.label_ip(&handlers[usize::from(h)])?,
                    None => trap_ip,
                };
                bytes.extend_from_slice(&(ip as u32).to_le_bytes());
            }
            bytes.extend_from_slice(&result.inner.code_buffer);
            Ok(Runtime {
                bytes,
                entry_offset: result.label_ip(&entry)?,
            })
        }
    };
}

interpreter!(
    build64, bits: 64, word: 8,
    regs: [rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15],
    ax: rax, bx: rbx, cx: rcx, dx: rdx, si: rsi, di: rdi, bp: rbp, sp: rsp,
    ptr: qword_ptr, pushf: pushfq, popf: popfq, sext32: sext32_64
);

interpreter!(
    build32, bits: 32, word: 4,
    regs: [eax, ecx, edx, ebx, esp, ebp, esi, edi],
    ax: eax, bx: ebx, cx: ecx, dx: edx, si: esi, di: edi, bp: ebp, sp: esp,
    ptr: dword_ptr, pushf: pushfd, popf: popfd, sext32: sext32_32
);

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use iced_x86::{Decoder, DecoderOptions, Mnemonic, Register};

    use super::*;

    fn table(runtime: &Runtime) -> Vec<u32> {
        runtime.bytes[..TABLE_SIZE as usize]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn handlers_are_distinct_and_inside_the_block() {
        for size in [AddressSize::U64, AddressSize::U32] {
            let map = OpcodeMap::new(5);
            let runtime = build(size, &map).expect("assembles");
            let entries = table(&runtime);
            let distinct: HashSet<u32> = entries.iter().copied().collect();
            // Every handler plus the shared trap.
            assert_eq!(distinct.len(), HANDLER_COUNT + 1);
            assert!(entries
                .iter()
                .all(|&e| u64::from(e) >= TABLE_SIZE && (e as usize) < runtime.bytes.len()));
        }
    }

    #[test]
    fn entry_reserves_the_stack_gap() {
        let runtime = build(AddressSize::U64, &OpcodeMap::new(0)).expect("assembles");
        let at = runtime.entry_offset as usize;
        let mut decoder = Decoder::with_ip(64, &runtime.bytes[at..], runtime.entry_offset, DecoderOptions::NONE);
        let first = decoder.decode();
        assert_eq!(first.mnemonic(), Mnemonic::Lea);
        assert_eq!(first.op0_register(), Register::RSP);
        assert_eq!(first.memory_displacement64() as i64, -(STACK_GAP as i64));
        assert_eq!(decoder.decode().mnemonic(), Mnemonic::Pushfq);
    }

    #[test]
    fn unassigned_opcodes_trap() {
        let map = OpcodeMap::new(9);
        let runtime = build(AddressSize::U32, &map).expect("assembles");
        let entries = table(&runtime);
        let unused = (0..=255u8).find(|&op| map.handler(op).is_none()).expect("spare opcodes");
        let at = entries[usize::from(unused)] as usize;
        let mut decoder = Decoder::with_ip(32, &runtime.bytes[at..], at as u64, DecoderOptions::NONE);
        assert_eq!(decoder.decode().mnemonic(), Mnemonic::Ud2);
    }

    #[test]
    fn shifts_count_by_cl() {
        let runtime = build(AddressSize::U64, &OpcodeMap::new(4)).expect("assembles");
        let code = &runtime.bytes[TABLE_SIZE as usize..];
        let mut shifts = 0;
        for instr in Decoder::with_ip(64, code, TABLE_SIZE, DecoderOptions::NONE) {
            if matches!(instr.mnemonic(), Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar) {
                assert_eq!(instr.op1_register(), Register::CL, "{instr}");
                shifts += 1;
            }
        }
        // Three shifts at four widths.
        assert!(shifts >= 12);
    }
}
