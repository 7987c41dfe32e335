//! Address-dependent references that must be recomputed after layout.

use super::{FunctionId, ProgramId};

/// Size class of a patched field or a VM operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
    Qword,
}

impl OperandSize {
    pub const ALL: [OperandSize; 4] = [
        OperandSize::Byte,
        OperandSize::Word,
        OperandSize::Dword,
        OperandSize::Qword,
    ];

    pub fn bytes(self) -> u64 {
        match self {
            OperandSize::Byte => 1,
            OperandSize::Word => 2,
            OperandSize::Dword => 4,
            OperandSize::Qword => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            1 => Some(OperandSize::Byte),
            2 => Some(OperandSize::Word),
            4 => Some(OperandSize::Dword),
            8 => Some(OperandSize::Qword),
            _ => None,
        }
    }

    /// Mask selecting the low `bits()` bits.
    pub fn mask(self) -> u64 {
        match self {
            OperandSize::Qword => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    pub fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    /// Sign-extends the low `bits()` bits of `value` to 64 bits.
    pub fn sign_extend(self, value: u64) -> u64 {
        let shift = 64 - self.bits();
        (((value << shift) as i64) >> shift) as u64
    }

    pub fn index(self) -> usize {
        match self {
            OperandSize::Byte => 0,
            OperandSize::Word => 1,
            OperandSize::Dword => 2,
            OperandSize::Qword => 3,
        }
    }
}

/// How the stored value is derived from the target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// `S + A`
    Absolute,
    /// `S + A - P`
    Relative,
    /// `S + A - image_base`
    ImageRelative,
}

/// Where the patched field lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupLocation {
    /// A virtual address in an existing segment.
    Native(u64),
    /// An offset inside a VM program block; the block address is known after layout.
    Program { program: ProgramId, offset: u32 },
}

/// What the field refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupTarget {
    Address(u64),
    /// Entry of a function; a virtualized function's entry is its trampoline.
    Function(FunctionId),
    /// Header of a VM program.
    Program(ProgramId),
    /// Re-entry stub `index` of a VM program.
    Stub { program: ProgramId, index: u32 },
    /// Base of the injected interpreter (its handler table).
    Runtime,
    /// Native entry routine of the interpreter.
    VmEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub location: FixupLocation,
    pub target: FixupTarget,
    pub kind: FixupKind,
    pub size: OperandSize,
    pub addend: i64,
    /// Retired fixups are skipped by resolution.
    pub deleted: bool,
}

impl Fixup {
    pub fn new(location: FixupLocation, target: FixupTarget, kind: FixupKind, size: OperandSize, addend: i64) -> Self {
        Self {
            location,
            target,
            kind,
            size,
            addend,
            deleted: false,
        }
    }

    /// Points every reference to program `from` at program `to`.
    pub fn renumber_program(&mut self, from: ProgramId, to: ProgramId) {
        if let FixupLocation::Program { program, .. } = &mut self.location {
            if *program == from {
                *program = to;
            }
        }
        self.target = self.target.renumber_program(from, to);
    }
}

impl FixupTarget {
    pub fn renumber_program(self, from: ProgramId, to: ProgramId) -> Self {
        match self {
            FixupTarget::Program(p) if p == from => FixupTarget::Program(to),
            FixupTarget::Stub { program, index } if program == from => FixupTarget::Stub { program: to, index },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_masks_and_sign_extension() {
        assert_eq!(OperandSize::Byte.mask(), 0xff);
        assert_eq!(OperandSize::Qword.mask(), u64::MAX);
        assert_eq!(OperandSize::Word.sign_extend(0x8000), 0xffff_ffff_ffff_8000);
        assert_eq!(OperandSize::Dword.sign_extend(0x7fff_ffff), 0x7fff_ffff);
        assert_eq!(OperandSize::from_bytes(3), None);
    }

    #[test]
    fn renumbering_touches_only_the_given_program() {
        let mut fixup = Fixup::new(
            FixupLocation::Program {
                program: ProgramId(7),
                offset: 4,
            },
            FixupTarget::Stub {
                program: ProgramId(7),
                index: 1,
            },
            FixupKind::ImageRelative,
            OperandSize::Dword,
            0,
        );
        fixup.renumber_program(ProgramId(7), ProgramId(0));
        assert_eq!(
            fixup.location,
            FixupLocation::Program {
                program: ProgramId(0),
                offset: 4
            }
        );
        assert_eq!(
            fixup.target,
            FixupTarget::Stub {
                program: ProgramId(0),
                index: 1
            }
        );
        assert_eq!(
            FixupTarget::Program(ProgramId(3)).renumber_program(ProgramId(7), ProgramId(0)),
            FixupTarget::Program(ProgramId(3))
        );
    }
}
