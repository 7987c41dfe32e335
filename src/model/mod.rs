//! Format-agnostic object model.
//!
//! A [`File`] owns one or more [`Architecture`]s (one per embedded image, e.g. the
//! slices of a universal Mach-O). Everything inside an architecture is addressed by
//! dense integer ids so cross-references never hold owning pointers.

pub mod command;
pub mod fixup;
pub mod function;
pub mod segment;
pub mod symbol;

use std::fmt;
use std::path::PathBuf;

use crate::format::{Format, FatSlice, ImageHeader};
use crate::resolver::FixupTable;
use crate::vm::VmProgram;

pub use command::{Command, CommandKind, Cond, CrossRef, Field, Flags, MemOperand, Operand, XrefKind, XrefTarget};
pub use fixup::{Fixup, FixupKind, FixupLocation, FixupTarget, OperandSize};
pub use function::{CompilationType, ExtCommand, Function, ManagedShape, ManagedSignature, StackType};
pub use segment::{PhysicalSize, Segment, SegmentFlags};
pub use symbol::{Export, Import, Relocation, RelocationEntry, Symbol, SymbolKind};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }

            pub fn from_index(index: usize) -> Self {
                Self(u32::try_from(index).unwrap_or(u32::MAX))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

entity_id!(
    /// Index into [`Architecture::functions`].
    FunctionId
);
entity_id!(
    /// Index into [`Function::commands`].
    CommandId
);
entity_id!(
    /// Index into the architecture's fixup table.
    FixupId
);
entity_id!(
    /// Index into [`Architecture::vm_programs`].
    ProgramId
);
entity_id!(
    /// Index into [`Architecture::segments`].
    SegmentId
);

/// Instruction set of an architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X64,
    /// ECMA-335 common intermediate language.
    Cil,
}

impl Isa {
    pub fn name(self) -> &'static str {
        match self {
            Isa::X86 => "i386",
            Isa::X64 => "amd64",
            Isa::Cil => "cil",
        }
    }

    pub fn is_native(self) -> bool {
        !matches!(self, Isa::Cil)
    }
}

/// Width of an address in the image. Fixed for the lifetime of an architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSize {
    U32,
    U64,
}

impl AddressSize {
    pub fn bytes(self) -> u64 {
        match self {
            AddressSize::U32 => 4,
            AddressSize::U64 => 8,
        }
    }

    pub fn operand_size(self) -> OperandSize {
        match self {
            AddressSize::U32 => OperandSize::Dword,
            AddressSize::U64 => OperandSize::Qword,
        }
    }

    /// Highest address (exclusive) that fits the address width.
    pub fn limit(self) -> u128 {
        match self {
            AddressSize::U32 => 1u128 << 32,
            AddressSize::U64 => 1u128 << 64,
        }
    }
}

/// Calling convention of native code in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    MsX64,
    SysV64,
    Managed,
}

/// Ownership root of a loaded container.
#[derive(Debug)]
pub struct File {
    pub path: PathBuf,
    pub format: Format,
    /// The original bytes; writers start from these.
    pub data: Vec<u8>,
    /// Slice table when the container embeds several images.
    pub fat: Option<Vec<FatSlice>>,
    pub architectures: Vec<Architecture>,
}

impl File {
    pub fn architecture_by_name(&self, name: &str) -> Option<&Architecture> {
        self.architectures.iter().find(|a| a.name == name)
    }
}

/// Placement of the injected interpreter inside the VM segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimePlacement {
    pub address: u64,
    pub entry_offset: u64,
}

/// One instruction-set view of the binary (an "image").
#[derive(Debug)]
pub struct Architecture {
    pub name: String,
    pub isa: Isa,
    pub address_size: AddressSize,
    pub image_base: u64,
    pub entry_point: u64,
    pub segment_alignment: u64,
    pub file_alignment: u64,
    /// Offset of this image inside the container file.
    pub offset: u64,
    /// Size of this image inside the container file.
    pub size: u64,
    pub time_stamp: u32,
    pub calling_convention: CallingConvention,
    pub header: ImageHeader,
    pub segments: Vec<Segment>,
    pub symbols: Vec<Symbol>,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub relocations: Vec<Relocation>,
    /// Code ranges described by unwind tables (`.eh_frame` FDEs, `.pdata`, `__unwind_info`).
    pub unwind_ranges: Vec<(u64, u64)>,
    pub fixups: FixupTable,
    pub functions: Vec<Function>,
    pub vm_programs: Vec<VmProgram>,
    pub vm_segment: Option<SegmentId>,
    pub vm_runtime: Option<RuntimePlacement>,
}

impl Architecture {
    pub fn new(name: impl Into<String>, isa: Isa, address_size: AddressSize, header: ImageHeader) -> Self {
        let calling_convention = match (isa, address_size) {
            (Isa::Cil, _) => CallingConvention::Managed,
            (_, AddressSize::U64) => CallingConvention::SysV64,
            (_, AddressSize::U32) => CallingConvention::Cdecl,
        };
        Self {
            name: name.into(),
            isa,
            address_size,
            image_base: 0,
            entry_point: 0,
            segment_alignment: 0x1000,
            file_alignment: 0x200,
            offset: 0,
            size: 0,
            time_stamp: 0,
            calling_convention,
            header,
            segments: Vec::new(),
            symbols: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            relocations: Vec::new(),
            unwind_ranges: Vec::new(),
            fixups: FixupTable::default(),
            functions: Vec::new(),
            vm_programs: Vec::new(),
            vm_segment: None,
            vm_runtime: None,
        }
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.index())
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id.index())
    }

    pub fn program(&self, id: ProgramId) -> Option<&VmProgram> {
        self.vm_programs.get(id.index())
    }

    pub fn segment_by_address(&self, address: u64) -> Option<SegmentId> {
        self.segments
            .iter()
            .position(|s| s.contains(address))
            .map(SegmentId::from_index)
    }

    pub fn function_by_address(&self, address: u64) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.address == address)
            .map(FunctionId::from_index)
    }

    /// The function whose claimed range contains `address`.
    pub fn function_containing(&self, address: u64) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.contains(address))
            .map(FunctionId::from_index)
    }

    /// Highest virtual address (exclusive) covered by any segment.
    pub fn end_address(&self) -> u64 {
        self.segments.iter().map(|s| s.end()).max().unwrap_or(self.image_base)
    }

    /// Reads file-backed bytes at a virtual address.
    pub fn read(&self, address: u64, len: usize) -> Option<&[u8]> {
        let segment = &self.segments[self.segment_by_address(address)?.index()];
        let start = usize::try_from(address - segment.address).ok()?;
        segment.data.get(start..start.checked_add(len)?)
    }

    /// Reads as many file-backed bytes as are available from `address` up to `len`.
    pub fn read_available(&self, address: u64, len: usize) -> Option<&[u8]> {
        let segment = &self.segments[self.segment_by_address(address)?.index()];
        let start = usize::try_from(address - segment.address).ok()?;
        let end = start.saturating_add(len).min(segment.data.len());
        segment.data.get(start..end)
    }

    /// Reads a NUL-terminated string at a virtual address.
    pub fn read_cstr(&self, address: u64) -> Option<String> {
        let bytes = self.read_available(address, 4096)?;
        let end = bytes.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn read_word(&self, address: u64) -> Option<u64> {
        let size = self.address_size.bytes() as usize;
        crate::utils::read_le(self.read(address, size)?, 0, size)
    }

    /// Overwrites file-backed bytes at a virtual address.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> bool {
        let Some(id) = self.segment_by_address(address) else {
            return false;
        };
        let segment = &mut self.segments[id.index()];
        let Ok(start) = usize::try_from(address - segment.address) else {
            return false;
        };
        match segment.data.get_mut(start..start + bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    pub fn add_function(&mut self, name: impl Into<String>, address: u64, size: Option<u64>) -> FunctionId {
        let id = FunctionId::from_index(self.functions.len());
        let mut function = Function::new(id, name, address, self.isa);
        function.size = size.filter(|&s| s > 0);
        self.functions.push(function);
        id
    }

    pub fn is_executable(&self, address: u64) -> bool {
        self.segment_by_address(address)
            .and_then(|id| self.segment(id))
            .is_some_and(|s| s.flags.contains(SegmentFlags::EXECUTE))
    }

    /// Virtual address relative to the image base, if it fits the RVA width.
    pub fn rva(&self, address: u64) -> Option<u32> {
        address.checked_sub(self.image_base).and_then(|v| u32::try_from(v).ok())
    }

    /// Whether an unwind table describes any code in `start..end`.
    pub fn has_unwind_info(&self, start: u64, end: u64) -> bool {
        self.unwind_ranges.iter().any(|&(lo, hi)| lo < end && start < hi)
    }

    /// Whether `address` lies inside the image (any segment).
    pub fn in_image(&self, address: u64) -> bool {
        address >= self.image_base && address < self.end_address()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::ImageHeader;

    /// A bare architecture with one executable segment, for unit tests.
    pub fn test_arch(isa: Isa, base: u64, code: &[u8]) -> Architecture {
        let size = match isa {
            Isa::X86 => AddressSize::U32,
            _ => AddressSize::U64,
        };
        let mut arch = Architecture::new("test", isa, size, ImageHeader::None);
        arch.image_base = base;
        arch.segments.push(Segment::new(
            ".text",
            base + 0x1000,
            0x1000,
            0x1000,
            code.to_vec(),
            SegmentFlags::READ | SegmentFlags::EXECUTE,
        ));
        arch.size = 0x1000 + code.len() as u64;
        arch
    }

    #[test]
    fn reads_and_writes_through_segments() {
        let mut arch = test_arch(Isa::X64, 0x400000, &[1, 2, 3, 4]);
        assert_eq!(arch.read(0x401001, 2), Some(&[2u8, 3][..]));
        assert!(arch.write(0x401002, &[9, 9]));
        assert_eq!(arch.read(0x401000, 4), Some(&[1u8, 2, 9, 9][..]));
        assert!(!arch.write(0x401003, &[0, 0]));
        assert_eq!(arch.read(0x500000, 1), None);
        assert_eq!(arch.rva(0x401000), Some(0x1000));
    }

    #[test]
    fn function_lookup_by_address() {
        let mut arch = test_arch(Isa::X64, 0x400000, &[0xC3; 16]);
        let id = arch.add_function("f", 0x401000, Some(8));
        arch.functions[id.index()].end = 0x401008;
        assert_eq!(arch.function_by_address(0x401000), Some(id));
        assert_eq!(arch.function_containing(0x401004), Some(id));
        assert_eq!(arch.function_containing(0x401008), None);
    }
}
