//! Decoded instructions in an ISA-agnostic shape.

use bitflags::bitflags;

use super::{CommandId, OperandSize};

bitflags! {
    /// Arithmetic status flags, in x86 `RFLAGS` bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u16 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const OF = 1 << 11;
    }
}

impl Flags {
    pub const ARITHMETIC: Flags = Flags::all();
}

/// Condition codes in x86 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Cond> {
        Cond::ALL.get(usize::from(code)).copied()
    }

    pub fn negate(self) -> Cond {
        Cond::ALL[usize::from(self.code() ^ 1)]
    }

    /// Flags the condition depends on.
    pub fn reads(self) -> Flags {
        match self {
            Cond::O | Cond::No => Flags::OF,
            Cond::B | Cond::Ae => Flags::CF,
            Cond::E | Cond::Ne => Flags::ZF,
            Cond::Be | Cond::A => Flags::CF | Flags::ZF,
            Cond::S | Cond::Ns => Flags::SF,
            Cond::P | Cond::Np => Flags::PF,
            Cond::L | Cond::Ge => Flags::SF | Flags::OF,
            Cond::Le | Cond::G => Flags::ZF | Flags::SF | Flags::OF,
        }
    }

    pub fn eval(self, flags: Flags) -> bool {
        let cf = flags.contains(Flags::CF);
        let zf = flags.contains(Flags::ZF);
        let sf = flags.contains(Flags::SF);
        let of = flags.contains(Flags::OF);
        let pf = flags.contains(Flags::PF);
        let positive = match self {
            Cond::O | Cond::No => of,
            Cond::B | Cond::Ae => cf,
            Cond::E | Cond::Ne => zf,
            Cond::Be | Cond::A => cf || zf,
            Cond::S | Cond::Ns => sf,
            Cond::P | Cond::Np => pf,
            Cond::L | Cond::Ge => sf != of,
            Cond::Le | Cond::G => zf || sf != of,
        };
        // Odd codes are the negated forms.
        positive != (self.code() & 1 == 1)
    }
}

/// Closed set of instruction kinds the builder produces.
///
/// Register-machine kinds come from native decoders; stack-machine kinds from the
/// managed decoder. Binary arithmetic kinds without operands are stack forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Nop,
    Mov,
    Movzx,
    Movsx,
    Lea,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Shl,
    Shr,
    Sar,
    Mul,
    Xchg,
    /// `cbw`/`cwde`/`cdqe`: widen the accumulator in place.
    SignExtendAcc,
    /// `cwd`/`cdq`/`cqo`: fill the data register with the accumulator's sign.
    SignFill,
    Setcc(Cond),
    Cmovcc(Cond),
    Push,
    Pop,
    Leave,
    Jmp,
    Jcc(Cond),
    Call,
    Ret,
    LoadVar,
    StoreVar,
    LoadConst,
    Dup,
    Discard,
    Convert { size: OperandSize, signed: bool },
    CompareSet(Cond),
    BranchTrue,
    BranchFalse,
    CompareBranch(Cond),
    Return,
    /// Bytes inside a function that were never reached by decoding.
    Data,
    /// Privileged, exception-sensitive or otherwise never virtualized.
    Excluded,
    /// Decoded fine but has no lowering.
    Unsupported,
}

impl CommandKind {
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            CommandKind::Jmp
                | CommandKind::Jcc(_)
                | CommandKind::BranchTrue
                | CommandKind::BranchFalse
                | CommandKind::CompareBranch(_)
        )
    }
}

/// A memory operand `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u64,
    /// Size of the accessed value; `None` for `lea`.
    pub size: Option<OperandSize>,
    /// `disp` is an absolute address (no base/index, or IP-relative already folded).
    pub absolute: bool,
    pub address_size: OperandSize,
    /// Uses an FS/GS segment override.
    pub segment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// General-purpose register by full-register number; `high` selects AH..BH.
    Reg { reg: u8, size: OperandSize, high: bool },
    Imm { value: u64, size: OperandSize },
    Mem(MemOperand),
    /// Direct branch target.
    Target(u64),
    /// Managed argument slot.
    Arg(u16),
    /// Managed local slot.
    Local(u16),
    /// Anything the lowering cannot represent (vector registers, far pointers...).
    Other,
}

impl Operand {
    pub fn size(&self) -> Option<OperandSize> {
        match *self {
            Operand::Reg { size, .. } | Operand::Imm { size, .. } => Some(size),
            Operand::Mem(m) => m.size,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefKind {
    Branch,
    Call,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefTarget {
    /// A command of the same function.
    Command(CommandId),
    /// A fixed address outside the function.
    Address(u64),
    /// Computed at run time.
    Unresolved,
}

/// Byte range of an encoded field inside a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: u8,
    pub size: OperandSize,
}

/// A reference from an operand to code or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossRef {
    pub operand: usize,
    pub kind: XrefKind,
    pub target: XrefTarget,
    pub field: Option<Field>,
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: CommandId,
    pub address: u64,
    /// Encoded length in bytes.
    pub size: u32,
    /// Disassembly text, for diagnostics.
    pub text: String,
    pub kind: CommandKind,
    pub operands: Vec<Operand>,
    pub flags_read: Flags,
    pub flags_written: Flags,
    pub xrefs: Vec<CrossRef>,
    /// Control may continue with the next command.
    pub fallthrough: bool,
}

impl Command {
    pub fn new(address: u64, size: u32, kind: CommandKind) -> Self {
        Self {
            id: CommandId(0),
            address,
            size,
            text: String::new(),
            kind,
            operands: Vec::new(),
            flags_read: Flags::empty(),
            flags_written: Flags::empty(),
            xrefs: Vec::new(),
            fallthrough: true,
        }
    }

    pub fn end(&self) -> u64 {
        self.address + u64::from(self.size)
    }

    pub fn xref(&self, operand: usize) -> Option<&CrossRef> {
        self.xrefs.iter().find(|x| x.operand == operand)
    }

    /// Intra-function branch targets.
    pub fn local_targets(&self) -> impl Iterator<Item = CommandId> + '_ {
        self.xrefs.iter().filter_map(|x| match (x.kind, x.target) {
            (XrefKind::Branch, XrefTarget::Command(id)) => Some(id),
            _ => None,
        })
    }

    pub fn has_unresolved(&self) -> bool {
        self.xrefs
            .iter()
            .any(|x| x.kind != XrefKind::Data && x.target == XrefTarget::Unresolved)
    }
}
