//! The virtual machine: instruction set, program encoding and the pieces that
//! produce and run programs.
//!
//! A program block is laid out as
//!
//! ```text
//! stubs    13 bytes each, re-entry points used after native call-outs
//! header   u32 self_rva, u32 runtime_rva, u32 instruction count
//! offsets  u32 per instruction, relative to the start of the code
//! code     opcode byte + operands per instruction
//! ```
//!
//! Every operand that depends on where something lands (`self_rva`, `runtime_rva`,
//! image addresses, the stubs' call and header fields) is emitted as a fixup.

pub mod compiler;
pub mod interp;
pub mod liveness;
pub mod lower;
pub mod profile;
pub mod runtime;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::error::VirtualizeError;
use crate::isa::x86::{entry_stub, entry_stub_fixups, ENTRY_STUB_SIZE};
use crate::model::{Cond, Fixup, FixupKind, FixupLocation, FixupTarget, Flags, FunctionId, OperandSize, ProgramId};
use crate::utils::read_le;

/// Size of the program header.
pub const HEADER_SIZE: u32 = 12;

/// Binary operations; the result is zero-extended from the operation size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Imul,
}

impl AluOp {
    pub const ALL: [AluOp; 9] = [
        AluOp::Add,
        AluOp::Sub,
        AluOp::And,
        AluOp::Or,
        AluOp::Xor,
        AluOp::Shl,
        AluOp::Shr,
        AluOp::Sar,
        AluOp::Imul,
    ];

    fn index(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// One VM instruction.
///
/// Stack effects use `a` for the deeper and `b` for the top operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmInstruction {
    Nop,
    /// Pushes a sign-extended 32-bit immediate.
    PushImm32(i32),
    PushImm64(u64),
    /// Pushes `image_base + rva(target)`. Decoded programs carry the raw RVA as
    /// `FixupTarget::Address`.
    PushAddr(FixupTarget),
    PushReg(u8),
    PopReg(u8),
    /// `addr -> value`, zero-extended.
    Load(OperandSize),
    /// `addr value -> `
    Store(OperandSize),
    Dup,
    Swap,
    Drop,
    Zext(OperandSize),
    Sext(OperandSize),
    /// `a b -> a op b`; flags in the mask are replaced by the operation's flags.
    Alu { op: AluOp, size: OperandSize, flags: Flags },
    Unary { op: UnaryOp, size: OperandSize, flags: Flags },
    /// Pushes 1 if the condition holds on the VM flags, else 0.
    Cond(Cond),
    /// `f t c -> c != 0 ? t : f`
    Select,
    /// Continues at `this index + delta`.
    Jmp(i32),
    Jcc(Cond, i32),
    /// Pops a native address and leaves the VM there.
    Exit,
    /// Pops the managed return value and leaves the VM.
    Ret,
}

const LOAD: u8 = 6;
const STORE: u8 = 10;
const DUP: u8 = 14;
const SWAP: u8 = 15;
const DROP: u8 = 16;
const ZEXT: u8 = 17;
const SEXT: u8 = 21;
const ALU: u8 = 25;
const UNARY: u8 = 61;
const COND: u8 = 69;
const SELECT: u8 = 85;
const JMP: u8 = 86;
const JCC: u8 = 87;
const EXIT: u8 = 103;
const RET: u8 = 104;

/// Number of distinct handlers; every instruction maps to exactly one.
pub const HANDLER_COUNT: usize = 105;

fn size_at(index: u8) -> OperandSize {
    OperandSize::ALL[usize::from(index & 3)]
}

impl VmInstruction {
    /// Handler ordinal, stable across seeds.
    pub fn handler(&self) -> u8 {
        let size = |s: OperandSize| s.index() as u8;
        match *self {
            VmInstruction::Nop => 0,
            VmInstruction::PushImm32(_) => 1,
            VmInstruction::PushImm64(_) => 2,
            VmInstruction::PushAddr(_) => 3,
            VmInstruction::PushReg(_) => 4,
            VmInstruction::PopReg(_) => 5,
            VmInstruction::Load(s) => LOAD + size(s),
            VmInstruction::Store(s) => STORE + size(s),
            VmInstruction::Dup => DUP,
            VmInstruction::Swap => SWAP,
            VmInstruction::Drop => DROP,
            VmInstruction::Zext(s) => ZEXT + size(s),
            VmInstruction::Sext(s) => SEXT + size(s),
            VmInstruction::Alu { op, size: s, .. } => ALU + op.index() * 4 + size(s),
            VmInstruction::Unary { op, size: s, .. } => UNARY + op as u8 * 4 + size(s),
            VmInstruction::Cond(c) => COND + c.code(),
            VmInstruction::Select => SELECT,
            VmInstruction::Jmp(_) => JMP,
            VmInstruction::Jcc(c, _) => JCC + c.code(),
            VmInstruction::Exit => EXIT,
            VmInstruction::Ret => RET,
        }
    }

    /// The instruction shape a handler implements, with zeroed operands.
    pub fn from_handler(handler: u8) -> Option<VmInstruction> {
        let flags = Flags::empty();
        Some(match handler {
            0 => VmInstruction::Nop,
            1 => VmInstruction::PushImm32(0),
            2 => VmInstruction::PushImm64(0),
            3 => VmInstruction::PushAddr(FixupTarget::Address(0)),
            4 => VmInstruction::PushReg(0),
            5 => VmInstruction::PopReg(0),
            h @ LOAD..=9 => VmInstruction::Load(size_at(h - LOAD)),
            h @ STORE..=13 => VmInstruction::Store(size_at(h - STORE)),
            DUP => VmInstruction::Dup,
            SWAP => VmInstruction::Swap,
            DROP => VmInstruction::Drop,
            h @ ZEXT..=20 => VmInstruction::Zext(size_at(h - ZEXT)),
            h @ SEXT..=24 => VmInstruction::Sext(size_at(h - SEXT)),
            h @ ALU..=60 => VmInstruction::Alu {
                op: AluOp::ALL[usize::from((h - ALU) / 4)],
                size: size_at(h - ALU),
                flags,
            },
            h @ UNARY..=68 => VmInstruction::Unary {
                op: if h - UNARY < 4 { UnaryOp::Neg } else { UnaryOp::Not },
                size: size_at(h - UNARY),
                flags,
            },
            h @ COND..=84 => VmInstruction::Cond(Cond::from_code(h - COND)?),
            SELECT => VmInstruction::Select,
            JMP => VmInstruction::Jmp(0),
            h @ JCC..=102 => VmInstruction::Jcc(Cond::from_code(h - JCC)?, 0),
            EXIT => VmInstruction::Exit,
            RET => VmInstruction::Ret,
            _ => return None,
        })
    }

    pub fn operand_len(&self) -> usize {
        match self {
            VmInstruction::PushImm32(_)
            | VmInstruction::PushAddr(_)
            | VmInstruction::Jmp(_)
            | VmInstruction::Jcc(..) => 4,
            VmInstruction::PushImm64(_) => 8,
            VmInstruction::PushReg(_) | VmInstruction::PopReg(_) => 1,
            VmInstruction::Alu { .. } | VmInstruction::Unary { .. } => 2,
            _ => 0,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + self.operand_len()
    }

    /// Whether control never continues with the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmInstruction::Jmp(_) | VmInstruction::Exit | VmInstruction::Ret)
    }
}

/// Seeded bijection between handler ordinals and opcode bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeMap {
    encode: [u8; 256],
    decode: [u8; 256],
}

const UNMAPPED: u8 = 0xFF;

impl OpcodeMap {
    pub fn new(seed: u64) -> Self {
        let mut permutation: Vec<u8> = (0..=255).collect();
        permutation.shuffle(&mut ChaCha20Rng::seed_from_u64(seed));
        let mut encode = [0u8; 256];
        let mut decode = [UNMAPPED; 256];
        for (handler, &opcode) in permutation.iter().enumerate() {
            encode[handler] = opcode;
            if handler < HANDLER_COUNT {
                decode[usize::from(opcode)] = handler as u8;
            }
        }
        Self { encode, decode }
    }

    pub fn opcode(&self, handler: u8) -> u8 {
        self.encode[usize::from(handler)]
    }

    pub fn handler(&self, opcode: u8) -> Option<u8> {
        Some(self.decode[usize::from(opcode)]).filter(|&h| h != UNMAPPED)
    }
}

/// A lowered function.
#[derive(Debug, Clone)]
pub struct VmProgram {
    pub id: ProgramId,
    pub function: FunctionId,
    pub instructions: Vec<VmInstruction>,
    /// Resume index of each re-entry stub.
    pub stubs: Vec<u32>,
    /// Encoded block, fixup fields zeroed.
    pub bytes: Vec<u8>,
    /// Fixups at `FixupLocation::Program` offsets of this block.
    pub fixups: Vec<Fixup>,
    /// Runs under the managed runtime rather than the native interpreter.
    pub managed: bool,
    /// Assigned by layout.
    pub address: Option<u64>,
}

impl VmProgram {
    /// Encodes `instructions` into a program block.
    pub fn new(
        id: ProgramId,
        function: FunctionId,
        instructions: Vec<VmInstruction>,
        stubs: Vec<u32>,
        managed: bool,
        map: &OpcodeMap,
    ) -> Result<Self, VirtualizeError> {
        let (bytes, fixups) = encode(id, &instructions, &stubs, managed, map)?;
        Ok(Self {
            id,
            function,
            instructions,
            stubs,
            bytes,
            fixups,
            managed,
            address: None,
        })
    }

    pub fn header_offset(&self) -> u64 {
        self.stubs.len() as u64 * ENTRY_STUB_SIZE
    }

    pub fn header_address(&self) -> Option<u64> {
        Some(self.address? + self.header_offset())
    }

    pub fn stub_address(&self, index: u32) -> Option<u64> {
        if index as usize >= self.stubs.len() {
            return None;
        }
        Some(self.address? + u64::from(index) * ENTRY_STUB_SIZE)
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Moves the program to slot `to`. The encoded bytes do not depend on the id.
    pub fn renumber(&mut self, to: ProgramId) {
        let from = self.id;
        for fixup in &mut self.fixups {
            fixup.renumber_program(from, to);
        }
        for instruction in &mut self.instructions {
            if let VmInstruction::PushAddr(target) = instruction {
                *target = target.renumber_program(from, to);
            }
        }
        self.id = to;
    }
}

/// Encodes a program block.
pub fn encode(
    id: ProgramId,
    instructions: &[VmInstruction],
    stubs: &[u32],
    managed: bool,
    map: &OpcodeMap,
) -> Result<(Vec<u8>, Vec<Fixup>), VirtualizeError> {
    let count = u32::try_from(instructions.len())
        .ok()
        .filter(|&c| c < i32::MAX as u32)
        .ok_or(VirtualizeError::ProgramTooLarge {
            count: instructions.len(),
        })?;
    let at = |offset: usize| FixupLocation::Program {
        program: id,
        offset: offset as u32,
    };
    let image_relative = |offset: usize, target: FixupTarget| {
        Fixup::new(at(offset), target, FixupKind::ImageRelative, OperandSize::Dword, 0)
    };

    let mut bytes = Vec::new();
    let mut fixups = Vec::new();
    for &resume in stubs {
        let base = bytes.len();
        bytes.extend_from_slice(&entry_stub(resume));
        fixups.extend(entry_stub_fixups(|off| at(base + off as usize), id));
    }

    let header = bytes.len();
    fixups.push(image_relative(header, FixupTarget::Program(id)));
    if !managed {
        fixups.push(image_relative(header + 4, FixupTarget::Runtime));
    }
    bytes.extend_from_slice(&[0; 8]);
    bytes.extend_from_slice(&count.to_le_bytes());

    let table = bytes.len();
    bytes.resize(table + instructions.len() * 4, 0);
    let code = bytes.len();
    for (i, instruction) in instructions.iter().enumerate() {
        let offset = (bytes.len() - code) as u32;
        bytes[table + i * 4..table + i * 4 + 4].copy_from_slice(&offset.to_le_bytes());
        bytes.push(map.opcode(instruction.handler()));
        match *instruction {
            VmInstruction::PushImm32(v) | VmInstruction::Jmp(v) | VmInstruction::Jcc(_, v) => {
                bytes.extend_from_slice(&v.to_le_bytes())
            }
            VmInstruction::PushImm64(v) => bytes.extend_from_slice(&v.to_le_bytes()),
            VmInstruction::PushAddr(target) => {
                fixups.push(image_relative(bytes.len(), target));
                bytes.extend_from_slice(&[0; 4]);
            }
            VmInstruction::PushReg(r) | VmInstruction::PopReg(r) => bytes.push(r),
            VmInstruction::Alu { flags, .. } | VmInstruction::Unary { flags, .. } => {
                bytes.extend_from_slice(&flags.bits().to_le_bytes())
            }
            _ => {}
        }
    }
    Ok((bytes, fixups))
}

/// Decodes the instruction at the start of `code`. Returns it with its length.
pub fn decode(code: &[u8], map: &OpcodeMap) -> Option<(VmInstruction, usize)> {
    let shape = VmInstruction::from_handler(map.handler(*code.first()?)?)?;
    let len = shape.encoded_len();
    let operand = |size: usize| read_le(code, 1, size);
    let instruction = match shape {
        VmInstruction::PushImm32(_) => VmInstruction::PushImm32(operand(4)? as u32 as i32),
        VmInstruction::PushImm64(_) => VmInstruction::PushImm64(operand(8)?),
        VmInstruction::PushAddr(_) => VmInstruction::PushAddr(FixupTarget::Address(operand(4)?)),
        VmInstruction::PushReg(_) => VmInstruction::PushReg(operand(1)? as u8),
        VmInstruction::PopReg(_) => VmInstruction::PopReg(operand(1)? as u8),
        VmInstruction::Jmp(_) => VmInstruction::Jmp(operand(4)? as u32 as i32),
        VmInstruction::Jcc(c, _) => VmInstruction::Jcc(c, operand(4)? as u32 as i32),
        VmInstruction::Alu { op, size, .. } => VmInstruction::Alu {
            op,
            size,
            flags: Flags::from_bits_truncate(operand(2)? as u16),
        },
        VmInstruction::Unary { op, size, .. } => VmInstruction::Unary {
            op,
            size,
            flags: Flags::from_bits_truncate(operand(2)? as u16),
        },
        other => other,
    };
    Some((instruction, len))
}
