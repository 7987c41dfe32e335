//! x86 and x86-64 backend.
//!
//! Decoding is done by `iced-x86`; this module only maps its instruction model onto
//! [`Command`]s and emits the 13-byte entry stub used by trampolines and re-entry
//! stubs:
//!
//! ```text
//! E8 rel32        call vm_entry
//! i32             program header - address of this field
//! u32             index of the first VM instruction to run
//! ```

use iced_x86::{
    ConditionCode, Decoder, DecoderError, DecoderOptions, FlowControl, Formatter, Instruction, IntelFormatter,
    Mnemonic, OpKind, Register, RflagsBits,
};

use super::{DecodeContext, Decoded, InstructionSet, Trampoline};
use crate::error::{DecodeError, VirtualizeError};
use crate::model::{
    Command, CommandKind, Cond, CrossRef, Field, Fixup, FixupKind, FixupLocation, FixupTarget, Flags, Function,
    Isa, MemOperand, Operand, OperandSize, ProgramId, XrefKind, XrefTarget,
};
use crate::vm::profile::VmProfile;

/// Size of a trampoline or re-entry stub.
pub const ENTRY_STUB_SIZE: u64 = 13;

/// Filler for the rest of a replaced body.
const INT3: u8 = 0xCC;

const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Register numbers as returned by `Register::number()` on full registers.
pub const REG_SP: u8 = 4;
pub const REG_BP: u8 = 5;

/// The x86 backend for a given bitness.
pub struct X86 {
    bitness: u32,
}

pub static X86_32: X86 = X86 { bitness: 32 };
pub static X86_64: X86 = X86 { bitness: 64 };

/// Stub bytes with the two fixup fields zeroed.
pub fn entry_stub(start_index: u32) -> [u8; ENTRY_STUB_SIZE as usize] {
    let mut stub = [0u8; ENTRY_STUB_SIZE as usize];
    stub[0] = 0xE8;
    stub[9..13].copy_from_slice(&start_index.to_le_bytes());
    stub
}

/// Fixups of a stub placed at `at(0)`.
pub fn entry_stub_fixups(at: impl Fn(u32) -> FixupLocation, program: ProgramId) -> [Fixup; 2] {
    [
        Fixup::new(at(1), FixupTarget::VmEntry, FixupKind::Relative, OperandSize::Dword, -4),
        Fixup::new(at(5), FixupTarget::Program(program), FixupKind::Relative, OperandSize::Dword, 0),
    ]
}

impl X86 {
    fn word(&self) -> OperandSize {
        if self.bitness == 64 {
            OperandSize::Qword
        } else {
            OperandSize::Dword
        }
    }
}

impl InstructionSet for X86 {
    fn isa(&self) -> Isa {
        if self.bitness == 64 {
            Isa::X64
        } else {
            Isa::X86
        }
    }

    fn decode(&self, bytes: &[u8], address: u64, ctx: &DecodeContext<'_>) -> Result<Decoded, DecodeError> {
        let mut decoder = Decoder::with_ip(self.bitness, bytes, address, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(DecodeError::Truncated { address });
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes if self.completes_with_more_bytes(bytes) => DecodeError::Truncated { address },
                _ => DecodeError::Invalid { address },
            });
        }
        let offsets = decoder.get_constant_offsets(&instr);

        let mut command = Command::new(address, instr.len() as u32, kind_of(&instr));
        let mut formatter = IntelFormatter::new();
        formatter.format(&instr, &mut command.text);
        command.flags_read = flags_of(instr.rflags_read());
        command.flags_written = flags_of(instr.rflags_modified());
        command.operands = (0..instr.op_count()).map(|i| self.operand(&instr, i)).collect();
        if let Some(size) = accumulator_width(instr.mnemonic()) {
            command.operands = vec![Operand::Reg {
                reg: 0,
                size,
                high: false,
            }];
        }

        let flow = instr.flow_control();
        let mut targets = Vec::new();
        for (i, operand) in command.operands.iter().enumerate() {
            match *operand {
                Operand::Target(target) => {
                    let kind = if flow == FlowControl::Call {
                        XrefKind::Call
                    } else {
                        XrefKind::Branch
                    };
                    let field = offsets.has_immediate().then(|| Field {
                        offset: offsets.immediate_offset() as u8,
                        size: OperandSize::from_bytes(offsets.immediate_size() as u64).unwrap_or(OperandSize::Dword),
                    });
                    command.xrefs.push(CrossRef {
                        operand: i,
                        kind,
                        target: XrefTarget::Address(target),
                        field,
                    });
                    if kind == XrefKind::Branch {
                        targets.push(target);
                    }
                }
                Operand::Mem(mem) if mem.absolute && !mem.segment => {
                    let field = offsets.has_displacement().then(|| Field {
                        offset: offsets.displacement_offset() as u8,
                        size: OperandSize::from_bytes(offsets.displacement_size() as u64).unwrap_or(OperandSize::Dword),
                    });
                    command.xrefs.push(CrossRef {
                        operand: i,
                        kind: XrefKind::Data,
                        target: XrefTarget::Address(mem.disp),
                        field,
                    });
                }
                Operand::Imm { value, size } if offsets.has_immediate() => {
                    let slot = address + offsets.immediate_offset() as u64;
                    if ctx.is_relocated(slot) && size >= OperandSize::Dword {
                        command.xrefs.push(CrossRef {
                            operand: i,
                            kind: XrefKind::Data,
                            target: XrefTarget::Address(value),
                            field: Some(Field {
                                offset: offsets.immediate_offset() as u8,
                                size: OperandSize::from_bytes(offsets.immediate_size() as u64).unwrap_or(size),
                            }),
                        });
                    }
                }
                _ => {}
            }
        }

        if matches!(flow, FlowControl::IndirectBranch | FlowControl::IndirectCall) {
            let through_slot = matches!(command.operands.first(), Some(Operand::Mem(m)) if m.absolute && !m.segment);
            if !through_slot {
                command.xrefs.push(CrossRef {
                    operand: 0,
                    kind: if flow == FlowControl::IndirectCall {
                        XrefKind::Call
                    } else {
                        XrefKind::Branch
                    },
                    target: XrefTarget::Unresolved,
                    field: None,
                });
            }
        }

        command.fallthrough = match flow {
            FlowControl::Next
            | FlowControl::ConditionalBranch
            | FlowControl::Call
            | FlowControl::IndirectCall
            | FlowControl::XbeginXabortXend => true,
            FlowControl::Interrupt => instr.mnemonic() != Mnemonic::Int3,
            FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
            | FlowControl::Return
            | FlowControl::Exception => false,
        };

        Ok(Decoded { command, targets })
    }

    fn trampoline_size(&self, _function: &Function) -> u64 {
        ENTRY_STUB_SIZE
    }

    fn trampoline(
        &self,
        function: &Function,
        program: ProgramId,
        _profile: &VmProfile,
    ) -> Result<Trampoline, VirtualizeError> {
        let size = function.range_len();
        if size < ENTRY_STUB_SIZE {
            return Err(VirtualizeError::TooSmall {
                size,
                required: ENTRY_STUB_SIZE,
            });
        }
        let mut bytes = entry_stub(0).to_vec();
        bytes.resize(size as usize, INT3);
        let base = function.address;
        Ok(Trampoline {
            address: base,
            bytes,
            fixups: entry_stub_fixups(|off| FixupLocation::Native(base + u64::from(off)), program).to_vec(),
            patches: Vec::new(),
        })
    }
}

impl X86 {
    /// Whether `bytes` is the prefix of a valid instruction. iced reports running out of
    /// input before it looks at the opcode, so an invalid opcode at the end of the window
    /// also comes back as `NoMoreBytes`.
    fn completes_with_more_bytes(&self, bytes: &[u8]) -> bool {
        let mut padded = bytes.to_vec();
        padded.resize(bytes.len() + MAX_INSTRUCTION_LENGTH, 0);
        let mut decoder = Decoder::new(self.bitness, &padded, DecoderOptions::NONE);
        let instr = decoder.decode();
        !instr.is_invalid() && instr.len() > bytes.len()
    }

    fn operand(&self, instr: &Instruction, i: u32) -> Operand {
        match instr.op_kind(i) {
            OpKind::Register => {
                let reg = instr.op_register(i);
                if !reg.is_gpr() {
                    return Operand::Other;
                }
                match OperandSize::from_bytes(reg.size() as u64) {
                    Some(size) => Operand::Reg {
                        reg: reg.full_register().number() as u8,
                        size,
                        high: matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH),
                    },
                    None => Operand::Other,
                }
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Operand::Target(instr.near_branch_target())
            }
            OpKind::Immediate8 | OpKind::Immediate8_2nd => self.immediate(instr, i, OperandSize::Byte),
            OpKind::Immediate16 | OpKind::Immediate8to16 => self.immediate(instr, i, OperandSize::Word),
            OpKind::Immediate32 | OpKind::Immediate8to32 => self.immediate(instr, i, OperandSize::Dword),
            OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => {
                self.immediate(instr, i, OperandSize::Qword)
            }
            OpKind::Memory => self.memory(instr),
            _ => Operand::Other,
        }
    }

    fn immediate(&self, instr: &Instruction, i: u32, size: OperandSize) -> Operand {
        Operand::Imm {
            value: instr.immediate(i) & size.mask(),
            size,
        }
    }

    fn memory(&self, instr: &Instruction) -> Operand {
        let base = instr.memory_base();
        let index = instr.memory_index();
        let ip_relative = instr.is_ip_rel_memory_operand();
        if (base != Register::None && !ip_relative && !base.is_gpr()) || (index != Register::None && !index.is_gpr()) {
            return Operand::Other;
        }
        let number = |r: Register| (r != Register::None).then(|| r.full_register().number() as u8);
        let narrow = base.is_gpr32() || index.is_gpr32() || base == Register::EIP;
        let address_size = if narrow || self.bitness == 32 {
            OperandSize::Dword
        } else {
            self.word()
        };
        Operand::Mem(MemOperand {
            base: if ip_relative { None } else { number(base) },
            index: number(index),
            scale: instr.memory_index_scale() as u8,
            disp: instr.memory_displacement64(),
            size: OperandSize::from_bytes(instr.memory_size().size() as u64),
            absolute: ip_relative || (base == Register::None && index == Register::None),
            address_size,
            segment: matches!(instr.segment_prefix(), Register::FS | Register::GS),
        })
    }
}

fn flags_of(bits: u32) -> Flags {
    let mut flags = Flags::empty();
    for (iced, ours) in [
        (RflagsBits::CF, Flags::CF),
        (RflagsBits::PF, Flags::PF),
        (RflagsBits::AF, Flags::AF),
        (RflagsBits::ZF, Flags::ZF),
        (RflagsBits::SF, Flags::SF),
        (RflagsBits::OF, Flags::OF),
    ] {
        if bits & iced != 0 {
            flags |= ours;
        }
    }
    flags
}

fn condition(instr: &Instruction) -> Option<Cond> {
    match instr.condition_code() {
        ConditionCode::None => None,
        cc => Cond::from_code((cc as u8).wrapping_sub(1)),
    }
}

/// Destination width of the implicit-accumulator widening instructions.
fn accumulator_width(mnemonic: Mnemonic) -> Option<OperandSize> {
    match mnemonic {
        Mnemonic::Cbw | Mnemonic::Cwd => Some(OperandSize::Word),
        Mnemonic::Cwde | Mnemonic::Cdq => Some(OperandSize::Dword),
        Mnemonic::Cdqe | Mnemonic::Cqo => Some(OperandSize::Qword),
        _ => None,
    }
}

fn is_setcc(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Seto
            | Mnemonic::Setno
            | Mnemonic::Setb
            | Mnemonic::Setae
            | Mnemonic::Sete
            | Mnemonic::Setne
            | Mnemonic::Setbe
            | Mnemonic::Seta
            | Mnemonic::Sets
            | Mnemonic::Setns
            | Mnemonic::Setp
            | Mnemonic::Setnp
            | Mnemonic::Setl
            | Mnemonic::Setge
            | Mnemonic::Setle
            | Mnemonic::Setg
    )
}

fn is_cmovcc(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Cmovo
            | Mnemonic::Cmovno
            | Mnemonic::Cmovb
            | Mnemonic::Cmovae
            | Mnemonic::Cmove
            | Mnemonic::Cmovne
            | Mnemonic::Cmovbe
            | Mnemonic::Cmova
            | Mnemonic::Cmovs
            | Mnemonic::Cmovns
            | Mnemonic::Cmovp
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovl
            | Mnemonic::Cmovge
            | Mnemonic::Cmovle
            | Mnemonic::Cmovg
    )
}

fn kind_of(instr: &Instruction) -> CommandKind {
    if instr.has_lock_prefix() {
        return CommandKind::Unsupported;
    }
    match instr.mnemonic() {
        Mnemonic::Nop | Mnemonic::Endbr32 | Mnemonic::Endbr64 | Mnemonic::Pause => CommandKind::Nop,
        Mnemonic::Mov => CommandKind::Mov,
        Mnemonic::Movzx => CommandKind::Movzx,
        Mnemonic::Movsx | Mnemonic::Movsxd => CommandKind::Movsx,
        Mnemonic::Lea => CommandKind::Lea,
        Mnemonic::Add => CommandKind::Add,
        Mnemonic::Sub => CommandKind::Sub,
        Mnemonic::And => CommandKind::And,
        Mnemonic::Or => CommandKind::Or,
        Mnemonic::Xor => CommandKind::Xor,
        Mnemonic::Cmp => CommandKind::Cmp,
        Mnemonic::Test => CommandKind::Test,
        Mnemonic::Inc => CommandKind::Inc,
        Mnemonic::Dec => CommandKind::Dec,
        Mnemonic::Neg => CommandKind::Neg,
        Mnemonic::Not => CommandKind::Not,
        Mnemonic::Shl | Mnemonic::Sal => CommandKind::Shl,
        Mnemonic::Shr => CommandKind::Shr,
        Mnemonic::Sar => CommandKind::Sar,
        Mnemonic::Imul if instr.op_count() >= 2 => CommandKind::Mul,
        Mnemonic::Xchg => CommandKind::Xchg,
        Mnemonic::Cbw | Mnemonic::Cwde | Mnemonic::Cdqe => CommandKind::SignExtendAcc,
        Mnemonic::Cwd | Mnemonic::Cdq | Mnemonic::Cqo => CommandKind::SignFill,
        Mnemonic::Push => CommandKind::Push,
        Mnemonic::Pop => CommandKind::Pop,
        Mnemonic::Leave => CommandKind::Leave,
        Mnemonic::Jmp => CommandKind::Jmp,
        Mnemonic::Call => CommandKind::Call,
        Mnemonic::Ret => CommandKind::Ret,
        Mnemonic::Int3
        | Mnemonic::Int
        | Mnemonic::Into
        | Mnemonic::Ud2
        | Mnemonic::Hlt
        | Mnemonic::Cli
        | Mnemonic::Sti
        | Mnemonic::In
        | Mnemonic::Out
        | Mnemonic::Syscall
        | Mnemonic::Sysenter
        | Mnemonic::Cpuid
        | Mnemonic::Rdtsc
        | Mnemonic::Rdmsr
        | Mnemonic::Wrmsr
        | Mnemonic::Lgdt
        | Mnemonic::Lidt => CommandKind::Excluded,
        _ => match condition(instr) {
            Some(cc) if instr.is_jcc_short_or_near() => CommandKind::Jcc(cc),
            Some(cc) if is_setcc(instr.mnemonic()) => CommandKind::Setcc(cc),
            Some(cc) if is_cmovcc(instr.mnemonic()) => CommandKind::Cmovcc(cc),
            _ => CommandKind::Unsupported,
        },
    }
}
