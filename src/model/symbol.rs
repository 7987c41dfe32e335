//! Symbols, imports, exports and load-time relocations of an image.

use super::OperandSize;

/// Classification of a symbol-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    Other,
}

/// A symbol defined in the image.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Virtual address of the symbol.
    pub address: u64,
    /// Size in bytes, zero when the format does not record one.
    pub size: u64,
    pub kind: SymbolKind,
    /// Whether this is a weak definition.
    pub is_weak: bool,
}

/// A symbol the image expects the loader to bind.
#[derive(Debug, Clone)]
pub struct Import {
    pub library: String,
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    /// Address of the slot the loader writes, zero when unknown.
    pub address: u64,
}

/// A symbol the image makes available to others.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: Option<String>,
    pub ordinal: Option<u32>,
    pub address: u64,
}

/// Where a relocation entry lives on disk, so a writer can neutralize it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationEntry {
    /// A 16-bit entry inside a PE base-relocation block.
    PeBlock { file_offset: u64 },
    /// An ELF `Elf*_Rel`/`Elf*_Rela` entry.
    Elf { file_offset: u64, rela: bool, class64: bool },
    /// A Mach-O rebase location; encoded as an opcode stream and not individually editable.
    MachORebase,
}

/// A location the loader patches when the image is not loaded at its preferred base.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Virtual address of the patched slot.
    pub address: u64,
    pub size: OperandSize,
    /// The address the slot points at before relocation, when it is known.
    pub target: Option<u64>,
    pub entry: RelocationEntry,
    /// Set once the slot was overwritten by generated code.
    pub deleted: bool,
}

impl Relocation {
    pub fn end(&self) -> u64 {
        self.address + self.size.bytes()
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.address < end && start < self.end()
    }
}
