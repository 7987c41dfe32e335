//! ECMA-335 CIL backend.
//!
//! A managed function's address is its method body header. The instruction stream
//! follows the header; its length is recorded there, so bodies never need a symbol
//! size.

use super::{Body, DecodeContext, Decoded, InstructionSet, Trampoline};
use crate::error::{DecodeError, VirtualizeError};
use crate::model::{
    Command, CommandKind, Cond, CrossRef, Fixup, FixupKind, FixupLocation, FixupTarget, Function, Isa, Operand,
    OperandSize, ProgramId, XrefKind, XrefTarget,
};
use crate::vm::profile::VmProfile;

const TINY_FORMAT: u8 = 0x2;
const FAT_FORMAT: u8 = 0x3;
const FAT_MORE_SECTS: u16 = 0x8;
const TINY_MAX_STACK: u16 = 8;

const LDC_I4: u8 = 0x20;
const CALL: u8 = 0x28;
const RET: u8 = 0x2A;
const NOP: u8 = 0x00;

/// Inline operand encoding of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inline {
    Nothing,
    U8,
    I8,
    U16,
    I32,
    I64,
    R4,
    R8,
    Token,
    Br8,
    Br32,
    Switch,
}

impl Inline {
    fn fixed_len(self) -> usize {
        match self {
            Inline::Nothing => 0,
            Inline::U8 | Inline::I8 | Inline::Br8 => 1,
            Inline::U16 => 2,
            Inline::I32 | Inline::R4 | Inline::Token | Inline::Br32 | Inline::Switch => 4,
            Inline::I64 | Inline::R8 => 8,
        }
    }
}

fn inline_of(op: u8) -> Option<Inline> {
    Some(match op {
        0x00..=0x0D => Inline::Nothing,
        0x0E..=0x13 => Inline::U8,
        0x14..=0x1E => Inline::Nothing,
        0x1F => Inline::I8,
        0x20 => Inline::I32,
        0x21 => Inline::I64,
        0x22 => Inline::R4,
        0x23 => Inline::R8,
        0x25 | 0x26 => Inline::Nothing,
        0x27..=0x29 => Inline::Token,
        0x2A => Inline::Nothing,
        0x2B..=0x37 => Inline::Br8,
        0x38..=0x44 => Inline::Br32,
        0x45 => Inline::Switch,
        0x46..=0x6E => Inline::Nothing,
        0x6F..=0x75 => Inline::Token,
        0x76 => Inline::Nothing,
        0x79 => Inline::Token,
        0x7A => Inline::Nothing,
        0x7B..=0x81 => Inline::Token,
        0x82..=0x8B => Inline::Nothing,
        0x8C | 0x8D => Inline::Token,
        0x8E => Inline::Nothing,
        0x8F => Inline::Token,
        0x90..=0xA2 => Inline::Nothing,
        0xA3..=0xA5 => Inline::Token,
        0xB3..=0xBA => Inline::Nothing,
        0xC2 => Inline::Token,
        0xC3 => Inline::Nothing,
        0xC6 => Inline::Token,
        0xD0 => Inline::Token,
        0xD1..=0xDC => Inline::Nothing,
        0xDD => Inline::Br32,
        0xDE => Inline::Br8,
        0xDF | 0xE0 => Inline::Nothing,
        _ => return None,
    })
}

fn extended_inline_of(op: u8) -> Option<Inline> {
    Some(match op {
        0x00..=0x05 => Inline::Nothing,
        0x06 | 0x07 => Inline::Token,
        0x09..=0x0E => Inline::U16,
        0x0F | 0x11 => Inline::Nothing,
        0x12 => Inline::U8,
        0x13 | 0x14 => Inline::Nothing,
        0x15 | 0x16 => Inline::Token,
        0x17 | 0x18 => Inline::Nothing,
        0x19 => Inline::U8,
        0x1A => Inline::Nothing,
        0x1C => Inline::Token,
        0x1D | 0x1E => Inline::Nothing,
        _ => return None,
    })
}

/// Conditions of `beq` .. `blt.un`, in opcode order.
const COMPARE_BRANCHES: [Cond; 10] = [
    Cond::E,
    Cond::Ge,
    Cond::G,
    Cond::Le,
    Cond::L,
    Cond::Ne,
    Cond::Ae,
    Cond::A,
    Cond::Be,
    Cond::B,
];

/// Parsed method body header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    pub header_size: u64,
    pub code_size: u64,
    pub max_stack: u16,
    pub fat: bool,
    pub more_sects: bool,
}

pub fn method_header(bytes: &[u8], address: u64) -> Result<MethodHeader, DecodeError> {
    let malformed = |reason: &str| DecodeError::MalformedBody {
        address,
        reason: reason.to_owned(),
    };
    let first = *bytes.first().ok_or(DecodeError::Truncated { address })?;
    match first & 0x3 {
        TINY_FORMAT => Ok(MethodHeader {
            header_size: 1,
            code_size: u64::from(first >> 2),
            max_stack: TINY_MAX_STACK,
            fat: false,
            more_sects: false,
        }),
        FAT_FORMAT => {
            let raw = bytes.get(..12).ok_or(DecodeError::Truncated { address })?;
            let flags = u16::from_le_bytes([raw[0], raw[1]]);
            let header_size = u64::from(flags >> 12) * 4;
            if header_size < 12 {
                return Err(malformed("fat header shorter than 12 bytes"));
            }
            Ok(MethodHeader {
                header_size,
                code_size: u64::from(u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]])),
                max_stack: u16::from_le_bytes([raw[2], raw[3]]),
                fat: true,
                more_sects: flags & FAT_MORE_SECTS != 0,
            })
        }
        _ => Err(malformed("unknown header format")),
    }
}

/// The CIL backend; `native` is the width of `native int`.
pub struct Cil {
    native: OperandSize,
}

pub static CIL_32: Cil = Cil {
    native: OperandSize::Dword,
};
pub static CIL_64: Cil = Cil {
    native: OperandSize::Qword,
};

fn read_i32(bytes: &[u8], at: usize, address: u64) -> Result<i32, DecodeError> {
    bytes
        .get(at..at + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DecodeError::Truncated { address })
}

impl InstructionSet for Cil {
    fn isa(&self) -> Isa {
        Isa::Cil
    }

    fn body(&self, bytes: &[u8], address: u64) -> Result<Body, DecodeError> {
        let header = method_header(bytes, address)?;
        let code_start = address + header.header_size;
        let code_end = code_start + header.code_size;
        if (bytes.len() as u64) < header.header_size + header.code_size {
            return Err(DecodeError::Truncated { address });
        }
        Ok(Body {
            code_start,
            code_end: Some(code_end),
            has_handlers: header.more_sects,
            max_stack: Some(header.max_stack),
        })
    }

    fn decode(&self, bytes: &[u8], address: u64, _ctx: &DecodeContext<'_>) -> Result<Decoded, DecodeError> {
        let op = *bytes.first().ok_or(DecodeError::Truncated { address })?;
        let (opcode_len, inline, extended) = if op == 0xFE {
            let ext = *bytes.get(1).ok_or(DecodeError::Truncated { address })?;
            (2, extended_inline_of(ext).ok_or(DecodeError::Invalid { address })?, Some(ext))
        } else {
            (1, inline_of(op).ok_or(DecodeError::Invalid { address })?, None)
        };

        let mut len = opcode_len + inline.fixed_len();
        let mut switch_targets = Vec::new();
        if inline == Inline::Switch {
            let count = read_i32(bytes, opcode_len, address)? as u32 as usize;
            let table = opcode_len + 4;
            len = table
                .checked_add(count.checked_mul(4).ok_or(DecodeError::Invalid { address })?)
                .ok_or(DecodeError::Invalid { address })?;
            if bytes.len() < len {
                return Err(DecodeError::Truncated { address });
            }
            let next = address + len as u64;
            for i in 0..count {
                let delta = read_i32(bytes, table + i * 4, address)?;
                switch_targets.push(next.wrapping_add(delta as i64 as u64));
            }
        }
        let raw = bytes.get(..len).ok_or(DecodeError::Truncated { address })?;
        let arg = &raw[opcode_len..];
        let next = address + len as u64;

        let u8_arg = || u16::from(arg[0]);
        let u16_arg = || u16::from_le_bytes([arg[0], arg[1]]);
        let branch_target = || match inline {
            Inline::Br8 => next.wrapping_add(arg[0] as i8 as i64 as u64),
            _ => next.wrapping_add(i32::from_le_bytes([arg[0], arg[1], arg[2], arg[3]]) as i64 as u64),
        };
        let i4 = |v: i32| Operand::Imm {
            value: u64::from(v as u32),
            size: OperandSize::Dword,
        };

        let mut command = Command::new(address, len as u32, CommandKind::Unsupported);
        let mut name = "il";
        let mut targets = Vec::new();
        let mut branch = None;

        match (op, extended) {
            (0x00, None) => {
                name = "nop";
                command.kind = CommandKind::Nop;
            }
            (0x01, None) => {
                name = "break";
                command.kind = CommandKind::Excluded;
            }
            (0x02..=0x05, None) => {
                name = "ldarg";
                command.kind = CommandKind::LoadVar;
                command.operands.push(Operand::Arg(u16::from(op - 0x02)));
            }
            (0x06..=0x09, None) => {
                name = "ldloc";
                command.kind = CommandKind::LoadVar;
                command.operands.push(Operand::Local(u16::from(op - 0x06)));
            }
            (0x0A..=0x0D, None) => {
                name = "stloc";
                command.kind = CommandKind::StoreVar;
                command.operands.push(Operand::Local(u16::from(op - 0x0A)));
            }
            (0x0E, None) | (0xFE, Some(0x09)) => {
                name = "ldarg";
                command.kind = CommandKind::LoadVar;
                command.operands.push(Operand::Arg(if op == 0x0E { u8_arg() } else { u16_arg() }));
            }
            (0x10, None) | (0xFE, Some(0x0B)) => {
                name = "starg";
                command.kind = CommandKind::StoreVar;
                command.operands.push(Operand::Arg(if op == 0x10 { u8_arg() } else { u16_arg() }));
            }
            (0x11, None) | (0xFE, Some(0x0C)) => {
                name = "ldloc";
                command.kind = CommandKind::LoadVar;
                command.operands.push(Operand::Local(if op == 0x11 { u8_arg() } else { u16_arg() }));
            }
            (0x13, None) | (0xFE, Some(0x0E)) => {
                name = "stloc";
                command.kind = CommandKind::StoreVar;
                command.operands.push(Operand::Local(if op == 0x13 { u8_arg() } else { u16_arg() }));
            }
            (0x15..=0x1E, None) => {
                name = "ldc.i4";
                command.kind = CommandKind::LoadConst;
                command.operands.push(i4(i32::from(op) - 0x16));
            }
            (0x1F, None) => {
                name = "ldc.i4.s";
                command.kind = CommandKind::LoadConst;
                command.operands.push(i4(i32::from(arg[0] as i8)));
            }
            (0x20, None) => {
                name = "ldc.i4";
                command.kind = CommandKind::LoadConst;
                command.operands.push(i4(i32::from_le_bytes([arg[0], arg[1], arg[2], arg[3]])));
            }
            (0x21, None) => {
                name = "ldc.i8";
                command.kind = CommandKind::LoadConst;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&arg[..8]);
                command.operands.push(Operand::Imm {
                    value: u64::from_le_bytes(buf),
                    size: OperandSize::Qword,
                });
            }
            (0x25, None) => {
                name = "dup";
                command.kind = CommandKind::Dup;
            }
            (0x26, None) => {
                name = "pop";
                command.kind = CommandKind::Discard;
            }
            (0x27, None) => {
                name = "jmp";
                command.kind = CommandKind::Excluded;
                command.fallthrough = false;
            }
            (0x2A, None) => {
                name = "ret";
                command.kind = CommandKind::Return;
                command.fallthrough = false;
            }
            (0x2B, None) | (0x38, None) => {
                name = "br";
                command.kind = CommandKind::Jmp;
                command.fallthrough = false;
                branch = Some(branch_target());
            }
            (0x2C, None) | (0x39, None) => {
                name = "brfalse";
                command.kind = CommandKind::BranchFalse;
                branch = Some(branch_target());
            }
            (0x2D, None) | (0x3A, None) => {
                name = "brtrue";
                command.kind = CommandKind::BranchTrue;
                branch = Some(branch_target());
            }
            (0x2E..=0x37, None) | (0x3B..=0x44, None) => {
                let k = if op >= 0x3B { op - 0x3B } else { op - 0x2E };
                name = "bcc";
                command.kind = CommandKind::CompareBranch(COMPARE_BRANCHES[usize::from(k)]);
                branch = Some(branch_target());
            }
            (0x45, None) => {
                name = "switch";
                for &t in &switch_targets {
                    command.operands.push(Operand::Target(t));
                    command.xrefs.push(CrossRef {
                        operand: command.operands.len() - 1,
                        kind: XrefKind::Branch,
                        target: XrefTarget::Address(t),
                        field: None,
                    });
                }
                targets.extend(switch_targets.iter().copied());
            }
            (0x58, None) => {
                name = "add";
                command.kind = CommandKind::Add;
            }
            (0x59, None) => {
                name = "sub";
                command.kind = CommandKind::Sub;
            }
            (0x5A, None) => {
                name = "mul";
                command.kind = CommandKind::Mul;
            }
            (0x5F, None) => {
                name = "and";
                command.kind = CommandKind::And;
            }
            (0x60, None) => {
                name = "or";
                command.kind = CommandKind::Or;
            }
            (0x61, None) => {
                name = "xor";
                command.kind = CommandKind::Xor;
            }
            (0x62, None) => {
                name = "shl";
                command.kind = CommandKind::Shl;
            }
            (0x63, None) => {
                name = "shr";
                command.kind = CommandKind::Sar;
            }
            (0x64, None) => {
                name = "shr.un";
                command.kind = CommandKind::Shr;
            }
            (0x65, None) => {
                name = "neg";
                command.kind = CommandKind::Neg;
            }
            (0x66, None) => {
                name = "not";
                command.kind = CommandKind::Not;
            }
            (0x67..=0x6A, None) | (0x6D, None) | (0x6E, None) | (0xD1..=0xD3, None) | (0xE0, None) => {
                name = "conv";
                let (size, signed) = match op {
                    0x67 => (OperandSize::Byte, true),
                    0x68 => (OperandSize::Word, true),
                    0x69 => (OperandSize::Dword, true),
                    0x6A => (OperandSize::Qword, true),
                    0x6D => (OperandSize::Dword, false),
                    0x6E => (OperandSize::Qword, false),
                    0xD1 => (OperandSize::Word, false),
                    0xD2 => (OperandSize::Byte, false),
                    0xD3 => (self.native, true),
                    _ => (self.native, false),
                };
                command.kind = CommandKind::Convert { size, signed };
            }
            (0x7A, None) | (0xFE, Some(0x1A)) => {
                name = "throw";
                command.kind = CommandKind::Excluded;
                command.fallthrough = false;
            }
            (0xDC, None) | (0xDD, None) | (0xDE, None) | (0xFE, Some(0x11)) => {
                name = "eh";
                command.kind = CommandKind::Excluded;
                command.fallthrough = false;
            }
            (0xFE, Some(0x14)) => {
                name = "tail.";
                command.kind = CommandKind::Excluded;
            }
            (0xFE, Some(c @ 0x01..=0x05)) => {
                name = "cmp";
                command.kind = CommandKind::CompareSet(match c {
                    0x01 => Cond::E,
                    0x02 => Cond::G,
                    0x03 => Cond::A,
                    0x04 => Cond::L,
                    _ => Cond::B,
                });
            }
            _ => {}
        }

        if let Some(target) = branch {
            command.operands.push(Operand::Target(target));
            command.xrefs.push(CrossRef {
                operand: 0,
                kind: XrefKind::Branch,
                target: XrefTarget::Address(target),
                field: None,
            });
            targets.push(target);
        }

        command.text = match extended {
            Some(ext) => format!("{name} (fe {ext:02x})"),
            None => format!("{name} ({op:02x})"),
        };
        Ok(Decoded { command, targets })
    }

    fn trampoline_size(&self, function: &Function) -> u64 {
        let args = function.signature.as_ref().map_or(0, |s| s.args.len());
        (0..args).map(|i| ldarg(i).len() as u64).sum::<u64>() + 5 + 5 + 1
    }

    fn trampoline(
        &self,
        function: &Function,
        program: ProgramId,
        profile: &VmProfile,
    ) -> Result<Trampoline, VirtualizeError> {
        let signature = function.signature.as_ref().ok_or(VirtualizeError::NoSignature)?;
        let token = profile.dispatch_token(signature).ok_or_else(|| VirtualizeError::NoDispatch {
            shape: signature.shape().to_string(),
        })?;
        let code_start = function.commands.first().map_or(function.address, |c| c.address);
        let header_len = code_start - function.address;
        let code_len = function.end.saturating_sub(code_start);

        let mut code = Vec::new();
        for i in 0..signature.args.len() {
            code.extend_from_slice(&ldarg(i));
        }
        let rva_at = code.len() as u64 + 1;
        code.push(LDC_I4);
        code.extend_from_slice(&[0; 4]);
        code.push(CALL);
        code.extend_from_slice(&token.to_le_bytes());
        code.push(RET);

        if (code.len() as u64) > code_len {
            return Err(VirtualizeError::TooSmall {
                size: code_len,
                required: code.len() as u64,
            });
        }
        code.resize(code_len as usize, NOP);

        // The arguments and the program address are on the stack at the call.
        let needed = signature.args.len() as u64 + 1;
        let declared = function.max_stack.unwrap_or(TINY_MAX_STACK);
        let mut patches = Vec::new();
        if needed > u64::from(declared) {
            if header_len < 12 {
                return Err(VirtualizeError::StackFrame {
                    frame: needed,
                    limit: u64::from(TINY_MAX_STACK),
                });
            }
            patches.push((function.address + 2, (needed as u16).to_le_bytes().to_vec()));
        }

        Ok(Trampoline {
            address: code_start,
            bytes: code,
            fixups: vec![Fixup::new(
                FixupLocation::Native(code_start + rva_at),
                FixupTarget::Program(program),
                FixupKind::ImageRelative,
                OperandSize::Dword,
                0,
            )],
            patches,
        })
    }
}

fn ldarg(index: usize) -> Vec<u8> {
    match index {
        0..=3 => vec![0x02 + index as u8],
        4..=255 => vec![0x0E, index as u8],
        _ => {
            let mut v = vec![0xFE, 0x09];
            v.extend_from_slice(&(index as u16).to_le_bytes());
            v
        }
    }
}
