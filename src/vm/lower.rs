//! Lowering of command lists to VM instructions.
//!
//! Each [`CommandKind`] maps to a rule through an exhaustive match, so a new kind
//! cannot be added without deciding how it lowers. Every rule leaves the
//! evaluation stack as it found it; values live in virtual registers and memory
//! between commands.
//!
//! Native code keeps its general-purpose registers in virtual registers 0..16 (x86
//! numbering) and its stack in memory, addressed through virtual register 4.
//! Managed code maps argument `n` to register `n` and local `n` to
//! `args + n`; 32-bit values are kept sign-extended to the full slot.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use super::{AluOp, UnaryOp, VmInstruction};
use crate::error::VirtualizeError;
use crate::isa::x86::{REG_BP, REG_SP};
use crate::model::{
    Command, CommandId, CommandKind, Cond, FixupTarget, Flags, Function, FunctionId, ManagedSignature, MemOperand,
    Operand, OperandSize, ProgramId, StackType, XrefKind, XrefTarget,
};

const REG_DX: u8 = 2;

/// Virtual registers available to a program.
pub const MAX_REGISTERS: usize = 256;

/// Image facts native lowering consults.
#[derive(Debug, Clone)]
pub struct ImageFacts {
    pub word: OperandSize,
    /// Addresses inside this range are emitted as image-relative operands.
    pub image: Range<u64>,
    /// Function entries by address.
    pub entries: HashMap<u64, FunctionId>,
}

/// Output of lowering one function.
#[derive(Debug, Clone, Default)]
pub struct Lowered {
    pub instructions: Vec<VmInstruction>,
    /// Resume index of each re-entry stub, in stub order.
    pub stubs: Vec<u32>,
}

struct Emitter<'a> {
    code: Vec<VmInstruction>,
    stubs: Vec<u32>,
    /// Branches to patch: instruction index, target command and branch address.
    branches: Vec<(usize, CommandId, u64)>,
    program: ProgramId,
    word: OperandSize,
    facts: Option<&'a ImageFacts>,
    /// Flags the current command must materialize.
    flags: Flags,
    args: usize,
}

fn operand_error(command: &Command) -> VirtualizeError {
    VirtualizeError::Operand {
        address: command.address,
    }
}

fn unsupported(command: &Command) -> VirtualizeError {
    VirtualizeError::Unsupported {
        address: command.address,
        text: command.text.clone(),
    }
}

fn operand(command: &Command, index: usize) -> Result<&Operand, VirtualizeError> {
    command.operands.get(index).ok_or_else(|| operand_error(command))
}

fn operand_size(command: &Command, index: usize) -> Result<OperandSize, VirtualizeError> {
    operand(command, index)?.size().ok_or_else(|| operand_error(command))
}

impl Emitter<'_> {
    fn emit(&mut self, instruction: VmInstruction) {
        self.code.push(instruction);
    }

    fn alu(&mut self, op: AluOp, size: OperandSize, flags: Flags) {
        self.emit(VmInstruction::Alu { op, size, flags });
    }

    /// Pushes a constant with the smaller encoding that reproduces it at word width.
    fn push_imm(&mut self, value: u64) {
        let value = value & self.word.mask();
        let narrow = value as u32 as i32;
        if self.word == OperandSize::Dword || narrow as i64 as u64 == value {
            self.emit(VmInstruction::PushImm32(narrow));
        } else {
            self.emit(VmInstruction::PushImm64(value));
        }
    }

    fn push_address(&mut self, address: u64) {
        match self.facts {
            Some(facts) if facts.image.contains(&address) => {
                let target = facts
                    .entries
                    .get(&address)
                    .map_or(FixupTarget::Address(address), |&id| FixupTarget::Function(id));
                self.emit(VmInstruction::PushAddr(target));
            }
            _ => self.push_imm(address),
        }
    }

    fn address_of(&mut self, command: &Command, mem: &MemOperand) -> Result<(), VirtualizeError> {
        if mem.segment {
            return Err(operand_error(command));
        }
        if mem.absolute {
            self.push_address(mem.disp & mem.address_size.mask());
            return Ok(());
        }
        let word = self.word;
        let mut pushed = false;
        if let Some(base) = mem.base {
            self.emit(VmInstruction::PushReg(base));
            pushed = true;
        }
        if let Some(index) = mem.index {
            self.emit(VmInstruction::PushReg(index));
            if mem.scale > 1 {
                self.emit(VmInstruction::PushImm32(mem.scale.trailing_zeros() as i32));
                self.alu(AluOp::Shl, word, Flags::empty());
            }
            if pushed {
                self.alu(AluOp::Add, word, Flags::empty());
            }
            pushed = true;
        }
        if !pushed {
            return Err(operand_error(command));
        }
        if mem.disp != 0 {
            self.push_imm(mem.disp);
            self.alu(AluOp::Add, word, Flags::empty());
        }
        if mem.address_size < word {
            self.emit(VmInstruction::Zext(mem.address_size));
        }
        Ok(())
    }

    /// Pushes operand `index` of `command`, zero-extended from its size.
    /// Immediates are pushed sign-extended; every consumer masks them.
    fn push_operand(&mut self, command: &Command, index: usize) -> Result<(), VirtualizeError> {
        match *operand(command, index)? {
            Operand::Reg { reg, size, high } => {
                self.emit(VmInstruction::PushReg(reg));
                if high {
                    self.emit(VmInstruction::PushImm32(8));
                    self.alu(AluOp::Shr, self.word, Flags::empty());
                    self.emit(VmInstruction::Zext(OperandSize::Byte));
                } else if size < self.word {
                    self.emit(VmInstruction::Zext(size));
                }
            }
            Operand::Imm { value, size } => {
                let relocated = command
                    .xref(index)
                    .is_some_and(|x| x.kind == XrefKind::Data && matches!(x.target, XrefTarget::Address(_)));
                if relocated {
                    self.push_address(value);
                } else {
                    self.push_imm(size.sign_extend(value));
                }
            }
            Operand::Mem(mem) => {
                let size = mem.size.ok_or_else(|| operand_error(command))?;
                self.address_of(command, &mem)?;
                self.emit(VmInstruction::Load(size));
            }
            Operand::Target(_) | Operand::Arg(_) | Operand::Local(_) | Operand::Other => {
                return Err(operand_error(command))
            }
        }
        Ok(())
    }

    /// Pops the top of the stack into operand `index` with x86 write semantics.
    fn store_operand(&mut self, command: &Command, index: usize) -> Result<(), VirtualizeError> {
        match *operand(command, index)? {
            Operand::Reg { reg, size, high } => self.store_register(reg, size, high),
            Operand::Mem(mem) => {
                let size = mem.size.ok_or_else(|| operand_error(command))?;
                self.address_of(command, &mem)?;
                self.emit(VmInstruction::Swap);
                self.emit(VmInstruction::Store(size));
            }
            _ => return Err(operand_error(command)),
        }
        Ok(())
    }

    fn store_register(&mut self, reg: u8, size: OperandSize, high: bool) {
        let word = self.word;
        if size == word {
            self.emit(VmInstruction::PopReg(reg));
            return;
        }
        if size == OperandSize::Dword {
            // 32-bit writes clear the upper half.
            self.emit(VmInstruction::Zext(OperandSize::Dword));
            self.emit(VmInstruction::PopReg(reg));
            return;
        }
        let keep = if high { !0xFF00u64 } else { !size.mask() };
        self.emit(VmInstruction::Zext(size));
        if high {
            self.emit(VmInstruction::PushImm32(8));
            self.alu(AluOp::Shl, word, Flags::empty());
        }
        self.emit(VmInstruction::PushReg(reg));
        self.push_imm(keep);
        self.alu(AluOp::And, word, Flags::empty());
        self.alu(AluOp::Or, word, Flags::empty());
        self.emit(VmInstruction::PopReg(reg));
    }

    /// Pushes the top of the stack onto the emulated native stack.
    fn push_native(&mut self, size: OperandSize) {
        let word = self.word;
        self.emit(VmInstruction::PushReg(REG_SP));
        self.emit(VmInstruction::PushImm32(size.bytes() as i32));
        self.alu(AluOp::Sub, word, Flags::empty());
        self.emit(VmInstruction::Dup);
        self.emit(VmInstruction::PopReg(REG_SP));
        self.emit(VmInstruction::Swap);
        self.emit(VmInstruction::Store(size));
    }

    /// Pops `size` bytes off the emulated native stack onto the evaluation stack.
    fn pop_native(&mut self, size: OperandSize, extra: u64) {
        let word = self.word;
        self.emit(VmInstruction::PushReg(REG_SP));
        self.emit(VmInstruction::Dup);
        self.push_imm(size.bytes() + extra);
        self.alu(AluOp::Add, word, Flags::empty());
        self.emit(VmInstruction::PopReg(REG_SP));
        self.emit(VmInstruction::Load(size));
    }

    fn branch(&mut self, instruction: VmInstruction, target: CommandId, address: u64) {
        self.branches.push((self.code.len(), target, address));
        self.emit(instruction);
    }

    fn exit_to(&mut self, target: u64) {
        self.push_address(target);
        self.emit(VmInstruction::Exit);
    }

    fn finish(mut self, starts: &[usize]) -> Result<Lowered, VirtualizeError> {
        for &(at, target, address) in &self.branches {
            let to = *starts.get(target.index()).ok_or(VirtualizeError::Operand { address })?;
            let delta = to as i64 - at as i64;
            let delta = i32::try_from(delta).map_err(|_| VirtualizeError::ProgramTooLarge { count: self.code.len() })?;
            self.code[at] = match self.code[at] {
                VmInstruction::Jcc(cc, _) => VmInstruction::Jcc(cc, delta),
                _ => VmInstruction::Jmp(delta),
            };
        }
        Ok(Lowered {
            instructions: self.code,
            stubs: self.stubs,
        })
    }
}

type NativeRule = fn(&mut Emitter<'_>, &Command) -> Result<(), VirtualizeError>;

fn native_rule(kind: CommandKind) -> Option<NativeRule> {
    let rule: NativeRule = match kind {
        CommandKind::Nop => |e, _| {
            e.emit(VmInstruction::Nop);
            Ok(())
        },
        CommandKind::Data => |_, _| Ok(()),
        CommandKind::Mov | CommandKind::Movzx => |e, c| {
            e.push_operand(c, 1)?;
            e.store_operand(c, 0)
        },
        CommandKind::Movsx => |e, c| {
            e.push_operand(c, 1)?;
            e.emit(VmInstruction::Sext(operand_size(c, 1)?));
            e.store_operand(c, 0)
        },
        CommandKind::Lea => |e, c| {
            match *operand(c, 1)? {
                Operand::Mem(mem) => e.address_of(c, &mem)?,
                _ => return Err(operand_error(c)),
            }
            e.store_operand(c, 0)
        },
        CommandKind::Add => |e, c| binary(e, c, AluOp::Add, true),
        CommandKind::Sub => |e, c| binary(e, c, AluOp::Sub, true),
        CommandKind::And => |e, c| binary(e, c, AluOp::And, true),
        CommandKind::Or => |e, c| binary(e, c, AluOp::Or, true),
        CommandKind::Xor => |e, c| binary(e, c, AluOp::Xor, true),
        CommandKind::Cmp => |e, c| binary(e, c, AluOp::Sub, false),
        CommandKind::Test => |e, c| binary(e, c, AluOp::And, false),
        CommandKind::Shl => |e, c| binary(e, c, AluOp::Shl, true),
        CommandKind::Shr => |e, c| binary(e, c, AluOp::Shr, true),
        CommandKind::Sar => |e, c| binary(e, c, AluOp::Sar, true),
        CommandKind::Inc => |e, c| step(e, c, AluOp::Add),
        CommandKind::Dec => |e, c| step(e, c, AluOp::Sub),
        CommandKind::Neg => |e, c| negate(e, c, UnaryOp::Neg),
        CommandKind::Not => |e, c| negate(e, c, UnaryOp::Not),
        CommandKind::Mul => |e, c| {
            let size = operand_size(c, 0)?;
            let first = if c.operands.len() == 3 { 1 } else { 0 };
            e.push_operand(c, first)?;
            e.push_operand(c, first + 1)?;
            let flags = e.flags;
            e.alu(AluOp::Imul, size, flags);
            e.store_operand(c, 0)
        },
        CommandKind::Xchg => |e, c| {
            e.push_operand(c, 0)?;
            e.push_operand(c, 1)?;
            e.store_operand(c, 0)?;
            e.store_operand(c, 1)
        },
        CommandKind::SignExtendAcc => |e, c| {
            let size = operand_size(c, 0)?;
            let half = OperandSize::from_bytes(size.bytes() / 2).ok_or_else(|| operand_error(c))?;
            e.emit(VmInstruction::PushReg(0));
            e.emit(VmInstruction::Sext(half));
            e.store_register(0, size, false);
            Ok(())
        },
        CommandKind::SignFill => |e, c| {
            let size = operand_size(c, 0)?;
            e.emit(VmInstruction::PushReg(0));
            e.emit(VmInstruction::PushImm32(size.bits() as i32 - 1));
            e.alu(AluOp::Sar, size, Flags::empty());
            e.store_register(REG_DX, size, false);
            Ok(())
        },
        CommandKind::Setcc(_) => |e, c| {
            let CommandKind::Setcc(cc) = c.kind else {
                return Err(unsupported(c));
            };
            e.emit(VmInstruction::Cond(cc));
            e.store_operand(c, 0)
        },
        CommandKind::Cmovcc(_) => |e, c| {
            let CommandKind::Cmovcc(cc) = c.kind else {
                return Err(unsupported(c));
            };
            e.push_operand(c, 0)?;
            e.push_operand(c, 1)?;
            e.emit(VmInstruction::Cond(cc));
            e.emit(VmInstruction::Select);
            e.store_operand(c, 0)
        },
        CommandKind::Push => |e, c| {
            let size = operand_size(c, 0)?;
            e.push_operand(c, 0)?;
            e.push_native(size);
            Ok(())
        },
        CommandKind::Pop => |e, c| {
            let size = operand_size(c, 0)?;
            e.pop_native(size, 0);
            e.store_operand(c, 0)
        },
        CommandKind::Leave => |e, _| {
            let word = e.word;
            e.emit(VmInstruction::PushReg(REG_BP));
            e.emit(VmInstruction::PopReg(REG_SP));
            e.pop_native(word, 0);
            e.emit(VmInstruction::PopReg(REG_BP));
            Ok(())
        },
        CommandKind::Ret => |e, c| {
            let extra = match c.operands.first() {
                Some(Operand::Imm { value, .. }) => *value,
                _ => 0,
            };
            let word = e.word;
            e.pop_native(word, extra);
            e.emit(VmInstruction::Exit);
            Ok(())
        },
        CommandKind::Jmp => |e, c| match c.xref(0).map(|x| x.target) {
            Some(XrefTarget::Command(id)) => {
                e.branch(VmInstruction::Jmp(0), id, c.address);
                Ok(())
            }
            Some(XrefTarget::Address(target)) if matches!(c.operands.first(), Some(Operand::Target(_))) => {
                e.exit_to(target);
                Ok(())
            }
            _ => match c.operands.first() {
                Some(Operand::Mem(mem)) if mem.absolute => {
                    e.push_operand(c, 0)?;
                    e.emit(VmInstruction::Exit);
                    Ok(())
                }
                _ => Err(unsupported(c)),
            },
        },
        CommandKind::Jcc(_) => |e, c| {
            let CommandKind::Jcc(cc) = c.kind else {
                return Err(unsupported(c));
            };
            match c.xref(0).map(|x| x.target) {
                Some(XrefTarget::Command(id)) => e.branch(VmInstruction::Jcc(cc, 0), id, c.address),
                Some(XrefTarget::Address(target)) => {
                    e.emit(VmInstruction::Jcc(cc.negate(), 3));
                    e.exit_to(target);
                }
                _ => return Err(unsupported(c)),
            }
            Ok(())
        },
        CommandKind::Call => |e, c| {
            match *operand(c, 0)? {
                Operand::Target(target) => e.push_address(target),
                Operand::Mem(_) => e.push_operand(c, 0)?,
                _ => return Err(unsupported(c)),
            }
            let index = u32::try_from(e.stubs.len()).map_err(|_| unsupported(c))?;
            let program = e.program;
            e.emit(VmInstruction::PushAddr(FixupTarget::Stub { program, index }));
            let word = e.word;
            e.push_native(word);
            e.emit(VmInstruction::Exit);
            e.stubs.push(e.code.len() as u32);
            Ok(())
        },
        CommandKind::LoadVar
        | CommandKind::StoreVar
        | CommandKind::LoadConst
        | CommandKind::Dup
        | CommandKind::Discard
        | CommandKind::Convert { .. }
        | CommandKind::CompareSet(_)
        | CommandKind::BranchTrue
        | CommandKind::BranchFalse
        | CommandKind::CompareBranch(_)
        | CommandKind::Return
        | CommandKind::Excluded
        | CommandKind::Unsupported => return None,
    };
    Some(rule)
}

fn binary(e: &mut Emitter<'_>, c: &Command, op: AluOp, store: bool) -> Result<(), VirtualizeError> {
    let size = operand_size(c, 0)?;
    e.push_operand(c, 0)?;
    e.push_operand(c, 1)?;
    let flags = e.flags;
    e.alu(op, size, flags);
    if store {
        e.store_operand(c, 0)
    } else {
        e.emit(VmInstruction::Drop);
        Ok(())
    }
}

fn step(e: &mut Emitter<'_>, c: &Command, op: AluOp) -> Result<(), VirtualizeError> {
    let size = operand_size(c, 0)?;
    e.push_operand(c, 0)?;
    e.emit(VmInstruction::PushImm32(1));
    let flags = e.flags;
    e.alu(op, size, flags);
    e.store_operand(c, 0)
}

fn negate(e: &mut Emitter<'_>, c: &Command, op: UnaryOp) -> Result<(), VirtualizeError> {
    let size = operand_size(c, 0)?;
    e.push_operand(c, 0)?;
    let flags = e.flags;
    e.emit(VmInstruction::Unary { op, size, flags });
    e.store_operand(c, 0)
}

/// Lowers a native function.
///
/// `live_out`, when given, limits each command's materialized flags to those a
/// later command can observe.
pub fn lower_native(
    function: &Function,
    program: ProgramId,
    facts: &ImageFacts,
    live_out: Option<&[Flags]>,
) -> Result<Lowered, VirtualizeError> {
    let mut e = Emitter {
        code: Vec::new(),
        stubs: Vec::new(),
        branches: Vec::new(),
        program,
        word: facts.word,
        facts: Some(facts),
        flags: Flags::empty(),
        args: 0,
    };
    let mut starts = Vec::with_capacity(function.commands.len());
    for (i, command) in function.commands.iter().enumerate() {
        starts.push(e.code.len());
        let rule = native_rule(command.kind).ok_or_else(|| unsupported(command))?;
        e.flags = match live_out {
            Some(live) => command.flags_written & live.get(i).copied().unwrap_or(Flags::ARITHMETIC),
            None => command.flags_written,
        };
        rule(&mut e, command)?;
    }
    e.finish(&starts)
}

fn stack_size(t: StackType) -> OperandSize {
    match t {
        StackType::I4 => OperandSize::Dword,
        StackType::I8 => OperandSize::Qword,
    }
}

type ManagedRule = fn(&mut Emitter<'_>, &Command, &[StackType]) -> Result<(), VirtualizeError>;

fn top(c: &Command, stack: &[StackType], depth: usize) -> Result<StackType, VirtualizeError> {
    stack
        .len()
        .checked_sub(depth + 1)
        .and_then(|i| stack.get(i))
        .copied()
        .ok_or(VirtualizeError::StackShape { address: c.address })
}

/// Restores the sign-extended form of a 32-bit result.
fn canonical(e: &mut Emitter<'_>, t: StackType) {
    if t == StackType::I4 {
        e.emit(VmInstruction::Sext(OperandSize::Dword));
    }
}

fn managed_binary(e: &mut Emitter<'_>, c: &Command, stack: &[StackType], op: AluOp) -> Result<(), VirtualizeError> {
    let t = top(c, stack, 1)?;
    e.alu(op, stack_size(t), Flags::empty());
    canonical(e, t);
    Ok(())
}

fn compare(e: &mut Emitter<'_>, c: &Command, stack: &[StackType]) -> Result<(), VirtualizeError> {
    let t = top(c, stack, 0)?;
    e.alu(AluOp::Sub, stack_size(t), Flags::ARITHMETIC);
    e.emit(VmInstruction::Drop);
    Ok(())
}

fn local_target(c: &Command) -> Result<CommandId, VirtualizeError> {
    c.local_targets().next().ok_or_else(|| unsupported(c))
}

fn managed_rule(kind: CommandKind) -> Option<ManagedRule> {
    let rule: ManagedRule = match kind {
        CommandKind::Nop => |e, _, _| {
            e.emit(VmInstruction::Nop);
            Ok(())
        },
        CommandKind::Data => |_, _, _| Ok(()),
        CommandKind::LoadVar => |e, c, _| {
            let reg = e.register(c)?;
            e.emit(VmInstruction::PushReg(reg));
            Ok(())
        },
        CommandKind::StoreVar => |e, c, _| {
            let reg = e.register(c)?;
            e.emit(VmInstruction::PopReg(reg));
            Ok(())
        },
        CommandKind::LoadConst => |e, c, _| match *operand(c, 0)? {
            Operand::Imm {
                value,
                size: OperandSize::Qword,
            } => {
                e.push_imm(value);
                Ok(())
            }
            Operand::Imm { value, .. } => {
                e.emit(VmInstruction::PushImm32(value as u32 as i32));
                Ok(())
            }
            _ => Err(operand_error(c)),
        },
        CommandKind::Dup => |e, _, _| {
            e.emit(VmInstruction::Dup);
            Ok(())
        },
        CommandKind::Discard => |e, _, _| {
            e.emit(VmInstruction::Drop);
            Ok(())
        },
        CommandKind::Add => |e, c, s| managed_binary(e, c, s, AluOp::Add),
        CommandKind::Sub => |e, c, s| managed_binary(e, c, s, AluOp::Sub),
        CommandKind::Mul => |e, c, s| managed_binary(e, c, s, AluOp::Imul),
        CommandKind::And => |e, c, s| managed_binary(e, c, s, AluOp::And),
        CommandKind::Or => |e, c, s| managed_binary(e, c, s, AluOp::Or),
        CommandKind::Xor => |e, c, s| managed_binary(e, c, s, AluOp::Xor),
        CommandKind::Shl => |e, c, s| managed_binary(e, c, s, AluOp::Shl),
        CommandKind::Shr => |e, c, s| managed_binary(e, c, s, AluOp::Shr),
        CommandKind::Sar => |e, c, s| managed_binary(e, c, s, AluOp::Sar),
        CommandKind::Neg | CommandKind::Not => |e, c, s| {
            let t = top(c, s, 0)?;
            let op = if c.kind == CommandKind::Neg { UnaryOp::Neg } else { UnaryOp::Not };
            e.emit(VmInstruction::Unary {
                op,
                size: stack_size(t),
                flags: Flags::empty(),
            });
            canonical(e, t);
            Ok(())
        },
        CommandKind::Convert { .. } => |e, c, s| {
            let CommandKind::Convert { size, signed } = c.kind else {
                return Err(unsupported(c));
            };
            let from = top(c, s, 0)?;
            match (size, signed) {
                (OperandSize::Qword, true) => {}
                (OperandSize::Qword, false) => {
                    if from == StackType::I4 {
                        e.emit(VmInstruction::Zext(OperandSize::Dword));
                    }
                }
                (OperandSize::Dword, _) => e.emit(VmInstruction::Sext(OperandSize::Dword)),
                (narrow, true) => e.emit(VmInstruction::Sext(narrow)),
                (narrow, false) => e.emit(VmInstruction::Zext(narrow)),
            }
            Ok(())
        },
        CommandKind::CompareSet(_) => |e, c, s| {
            let CommandKind::CompareSet(cc) = c.kind else {
                return Err(unsupported(c));
            };
            compare(e, c, s)?;
            e.emit(VmInstruction::Cond(cc));
            Ok(())
        },
        CommandKind::BranchTrue | CommandKind::BranchFalse => |e, c, s| {
            let t = top(c, s, 0)?;
            e.emit(VmInstruction::PushImm32(0));
            e.alu(AluOp::Sub, stack_size(t), Flags::ARITHMETIC);
            e.emit(VmInstruction::Drop);
            let cc = if c.kind == CommandKind::BranchTrue { Cond::Ne } else { Cond::E };
            e.branch(VmInstruction::Jcc(cc, 0), local_target(c)?, c.address);
            Ok(())
        },
        CommandKind::CompareBranch(_) => |e, c, s| {
            let CommandKind::CompareBranch(cc) = c.kind else {
                return Err(unsupported(c));
            };
            compare(e, c, s)?;
            e.branch(VmInstruction::Jcc(cc, 0), local_target(c)?, c.address);
            Ok(())
        },
        CommandKind::Jmp => |e, c, _| {
            e.branch(VmInstruction::Jmp(0), local_target(c)?, c.address);
            Ok(())
        },
        CommandKind::Return => |e, _, s| {
            if s.is_empty() {
                e.emit(VmInstruction::PushImm32(0));
            }
            e.emit(VmInstruction::Ret);
            Ok(())
        },
        CommandKind::Mov
        | CommandKind::Movzx
        | CommandKind::Movsx
        | CommandKind::Lea
        | CommandKind::Cmp
        | CommandKind::Test
        | CommandKind::Inc
        | CommandKind::Dec
        | CommandKind::Xchg
        | CommandKind::SignExtendAcc
        | CommandKind::SignFill
        | CommandKind::Setcc(_)
        | CommandKind::Cmovcc(_)
        | CommandKind::Push
        | CommandKind::Pop
        | CommandKind::Leave
        | CommandKind::Jcc(_)
        | CommandKind::Call
        | CommandKind::Ret
        | CommandKind::Excluded
        | CommandKind::Unsupported => return None,
    };
    Some(rule)
}

impl Emitter<'_> {
    fn register(&self, c: &Command) -> Result<u8, VirtualizeError> {
        let slot = match *operand(c, 0)? {
            Operand::Arg(n) => usize::from(n),
            Operand::Local(n) => self.args + usize::from(n),
            _ => return Err(operand_error(c)),
        };
        u8::try_from(slot).map_err(|_| VirtualizeError::RegisterLimit { count: slot + 1 })
    }
}

/// Applies a managed command's stack effect.
fn stack_effect(c: &Command, signature: &ManagedSignature, stack: &mut Vec<StackType>) -> Result<(), VirtualizeError> {
    let shape = || VirtualizeError::StackShape { address: c.address };
    let pop = |stack: &mut Vec<StackType>| stack.pop().ok_or_else(shape);
    let slot_type = |c: &Command| match *operand(c, 0)? {
        Operand::Arg(n) => signature.args.get(usize::from(n)).copied().ok_or_else(|| operand_error(c)),
        Operand::Local(n) => signature.locals.get(usize::from(n)).copied().ok_or_else(|| operand_error(c)),
        _ => Err(operand_error(c)),
    };
    match c.kind {
        CommandKind::Nop | CommandKind::Data | CommandKind::Jmp => {}
        CommandKind::LoadVar => stack.push(slot_type(c)?),
        CommandKind::StoreVar => {
            if pop(stack)? != slot_type(c)? {
                return Err(shape());
            }
        }
        CommandKind::LoadConst => stack.push(match operand(c, 0)?.size() {
            Some(OperandSize::Qword) => StackType::I8,
            _ => StackType::I4,
        }),
        CommandKind::Dup => {
            let t = *stack.last().ok_or_else(shape)?;
            stack.push(t);
        }
        CommandKind::Discard | CommandKind::BranchTrue | CommandKind::BranchFalse => {
            pop(stack)?;
        }
        CommandKind::Add
        | CommandKind::Sub
        | CommandKind::Mul
        | CommandKind::And
        | CommandKind::Or
        | CommandKind::Xor => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            if a != b {
                return Err(shape());
            }
            stack.push(a);
        }
        CommandKind::Shl | CommandKind::Shr | CommandKind::Sar => {
            pop(stack)?;
            let a = pop(stack)?;
            stack.push(a);
        }
        CommandKind::Neg | CommandKind::Not => {
            let a = pop(stack)?;
            stack.push(a);
        }
        CommandKind::Convert { size, .. } => {
            pop(stack)?;
            stack.push(if size == OperandSize::Qword { StackType::I8 } else { StackType::I4 });
        }
        CommandKind::CompareSet(_) | CommandKind::CompareBranch(_) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            if a != b {
                return Err(shape());
            }
            if matches!(c.kind, CommandKind::CompareSet(_)) {
                stack.push(StackType::I4);
            }
        }
        CommandKind::Return => {
            if let Some(ret) = signature.ret {
                if pop(stack)? != ret {
                    return Err(shape());
                }
            }
            if !stack.is_empty() {
                return Err(shape());
            }
        }
        _ => return Err(unsupported(c)),
    }
    Ok(())
}

/// Evaluation-stack types on entry to each command; `None` for unreachable ones.
pub fn stack_types(
    function: &Function,
    signature: &ManagedSignature,
) -> Result<Vec<Option<Vec<StackType>>>, VirtualizeError> {
    let commands = &function.commands;
    let mut states: Vec<Option<Vec<StackType>>> = vec![None; commands.len()];
    let mut queue = VecDeque::new();
    if !commands.is_empty() {
        states[0] = Some(Vec::new());
        queue.push_back(0);
    }
    while let Some(i) = queue.pop_front() {
        let command = &commands[i];
        let mut stack = states[i].clone().unwrap_or_default();
        stack_effect(command, signature, &mut stack)?;
        let next = (command.fallthrough && i + 1 < commands.len()).then_some(i + 1);
        for succ in command.local_targets().map(CommandId::index).chain(next) {
            match &states[succ] {
                Some(existing) if *existing != stack => {
                    return Err(VirtualizeError::StackShape {
                        address: commands[succ].address,
                    })
                }
                Some(_) => {}
                None => {
                    states[succ] = Some(stack.clone());
                    queue.push_back(succ);
                }
            }
        }
    }
    Ok(states)
}

/// Lowers a managed method body.
pub fn lower_managed(
    function: &Function,
    signature: &ManagedSignature,
    program: ProgramId,
) -> Result<Lowered, VirtualizeError> {
    let count = signature.args.len() + signature.locals.len();
    if count > MAX_REGISTERS {
        return Err(VirtualizeError::RegisterLimit { count });
    }
    let states = stack_types(function, signature)?;
    let mut e = Emitter {
        code: Vec::new(),
        stubs: Vec::new(),
        branches: Vec::new(),
        program,
        word: OperandSize::Qword,
        facts: None,
        flags: Flags::empty(),
        args: signature.args.len(),
    };
    let mut starts = Vec::with_capacity(function.commands.len());
    for (command, state) in function.commands.iter().zip(&states) {
        starts.push(e.code.len());
        let Some(stack) = state else {
            continue;
        };
        let rule = managed_rule(command.kind).ok_or_else(|| unsupported(command))?;
        rule(&mut e, command, stack)?;
    }
    e.finish(&starts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x86::X86_64;
    use crate::isa::DecodeContext;

    fn native(code: &[u8]) -> Function {
        let ctx = DecodeContext {
            relocations: &[],
            image: 0x400000..0x500000,
        };
        let list = crate::disasm::disassemble(&X86_64, code, 0x401000, None, &ctx).expect("decodes");
        let mut f = Function::new(FunctionId(0), "f", 0x401000, crate::model::Isa::X64);
        f.commands = list.commands;
        f.end = list.end;
        f
    }

    fn facts() -> ImageFacts {
        ImageFacts {
            word: OperandSize::Qword,
            image: 0x400000..0x500000,
            entries: HashMap::from([(0x401100, FunctionId(1))]),
        }
    }

    #[test]
    fn immediates_use_the_short_form_when_they_fit() {
        // mov rax, -1; mov rcx, 0x100000000; ret
        let f = native(&[
            0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF, 0x48, 0xB9, 0, 0, 0, 0, 1, 0, 0, 0, 0xC3,
        ]);
        let lowered = lower_native(&f, ProgramId(0), &facts(), None).expect("lowers");
        assert_eq!(lowered.instructions[0], VmInstruction::PushImm32(-1));
        assert_eq!(lowered.instructions[1], VmInstruction::PopReg(0));
        assert_eq!(lowered.instructions[2], VmInstruction::PushImm64(0x1_0000_0000));
    }

    #[test]
    fn local_branches_are_relative_indices() {
        // test edi, edi; je +3; mov eax, edi; ret
        let f = native(&[0x85, 0xFF, 0x74, 0x02, 0x89, 0xF8, 0xC3]);
        let lowered = lower_native(&f, ProgramId(0), &facts(), None).expect("lowers");
        let (at, delta) = lowered
            .instructions
            .iter()
            .enumerate()
            .find_map(|(i, ins)| match ins {
                VmInstruction::Jcc(Cond::E, d) => Some((i, *d)),
                _ => None,
            })
            .expect("has a conditional branch");
        let target = (at as i64 + i64::from(delta)) as usize;
        // The ret sequence starts by reading the stack pointer.
        assert_eq!(lowered.instructions[target], VmInstruction::PushReg(REG_SP));
        assert_eq!(lowered.instructions.last(), Some(&VmInstruction::Exit));
    }

    #[test]
    fn calls_exit_through_a_stub() {
        // call 0x401100; ret
        let f = native(&[0xE8, 0xFB, 0x00, 0x00, 0x00, 0xC3]);
        let lowered = lower_native(&f, ProgramId(4), &facts(), None).expect("lowers");
        assert_eq!(
            lowered.instructions[0],
            VmInstruction::PushAddr(FixupTarget::Function(FunctionId(1)))
        );
        assert_eq!(
            lowered.instructions[1],
            VmInstruction::PushAddr(FixupTarget::Stub {
                program: ProgramId(4),
                index: 0
            })
        );
        assert_eq!(lowered.stubs.len(), 1);
        let resume = lowered.stubs[0] as usize;
        assert_eq!(lowered.instructions[resume - 1], VmInstruction::Exit);
    }

    #[test]
    fn flag_masks_follow_liveness() {
        // add eax, esi; sub eax, edi; ret
        let f = native(&[0x01, 0xF0, 0x29, 0xF8, 0xC3]);
        let live = crate::vm::liveness::live_out(&f.commands);
        let lowered = lower_native(&f, ProgramId(0), &facts(), Some(&live)).expect("lowers");
        let masks: Vec<Flags> = lowered
            .instructions
            .iter()
            .filter_map(|i| match i {
                VmInstruction::Alu { size: OperandSize::Dword, flags, .. } => Some(*flags),
                _ => None,
            })
            .collect();
        assert_eq!(masks[0], Flags::empty());
        assert_eq!(masks[1], Flags::ARITHMETIC);
    }

    #[test]
    fn lock_prefixed_instructions_cannot_be_lowered() {
        // lock add [rdi], eax; ret
        let f = native(&[0xF0, 0x01, 0x07, 0xC3]);
        assert!(matches!(
            lower_native(&f, ProgramId(0), &facts(), None),
            Err(VirtualizeError::Unsupported { address: 0x401000, .. })
        ));
    }

    fn managed(code: &[u8], signature: &ManagedSignature) -> Function {
        let mut body = vec![(code.len() as u8) << 2 | 0x2];
        body.extend_from_slice(code);
        let ctx = DecodeContext {
            relocations: &[],
            image: 0..u64::MAX,
        };
        let list = crate::disasm::disassemble(&crate::isa::cil::CIL_64, &body, 0x2050, None, &ctx).expect("decodes");
        let mut f = Function::new(FunctionId(0), "m", 0x2050, crate::model::Isa::Cil);
        f.commands = list.commands;
        f.end = list.end;
        f.signature = Some(signature.clone());
        f
    }

    #[test]
    fn managed_arithmetic_keeps_int32_canonical() {
        // ldarg.0; ldarg.1; add; ret
        let sig = ManagedSignature {
            args: vec![StackType::I4, StackType::I4],
            locals: vec![],
            ret: Some(StackType::I4),
        };
        let f = managed(&[0x02, 0x03, 0x58, 0x2A], &sig);
        let lowered = lower_managed(&f, &sig, ProgramId(0)).expect("lowers");
        assert_eq!(
            lowered.instructions,
            vec![
                VmInstruction::PushReg(0),
                VmInstruction::PushReg(1),
                VmInstruction::Alu {
                    op: AluOp::Add,
                    size: OperandSize::Dword,
                    flags: Flags::empty()
                },
                VmInstruction::Sext(OperandSize::Dword),
                VmInstruction::Ret,
            ]
        );
    }

    #[test]
    fn mismatched_stack_types_are_rejected() {
        // ldarg.0 (int32); ldarg.1 (int64); add; ret
        let sig = ManagedSignature {
            args: vec![StackType::I4, StackType::I8],
            locals: vec![],
            ret: Some(StackType::I4),
        };
        let f = managed(&[0x02, 0x03, 0x58, 0x2A], &sig);
        assert!(matches!(
            lower_managed(&f, &sig, ProgramId(0)),
            Err(VirtualizeError::StackShape { .. })
        ));
    }
}
