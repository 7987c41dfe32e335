//! Container codecs.
//!
//! Each submodule understands one container family and is the only place its byte
//! layout appears. Readers populate the object model from the original bytes;
//! writers start from those bytes again, copy every segment back, then apply the
//! header edits that the appended VM segment needs.

pub mod clr;
pub mod elf;
pub mod macho;
pub mod pe;

use std::fs;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use object::pod::{self, Pod};
use gimli::{BaseAddresses, CieOrFde, EhFrame, UnwindSection};
use object::{FileKind, Object, ObjectSection, ObjectSymbol, SymbolKind as ObjSymbolKind};

use crate::error::{OpenError, WriteError};
use crate::model::{Architecture, Export, File, Import, Segment, Symbol, SymbolKind};
use crate::utils::read_le;

/// Container family of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pe,
    Elf,
    MachO,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Pe => "PE",
            Format::Elf => "ELF",
            Format::MachO => "Mach-O",
        }
    }
}

/// One entry of a universal Mach-O slice table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatSlice {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u64,
    pub size: u64,
    /// Alignment as a power of two.
    pub align: u32,
}

/// Container facts a writer needs, opaque to the rest of the pipeline.
#[derive(Debug, Clone)]
pub enum ImageHeader {
    /// Images built in memory without a container.
    None,
    Pe(pe::PeHeader),
    Elf(elf::ElfHeader),
    MachO(macho::MachOHeader),
}

/// Identifies the container family by its magic.
pub fn detect(data: &[u8]) -> Result<Format, OpenError> {
    match FileKind::parse(data) {
        Ok(FileKind::Pe32 | FileKind::Pe64) => Ok(Format::Pe),
        Ok(FileKind::Elf32 | FileKind::Elf64) => Ok(Format::Elf),
        Ok(FileKind::MachO32 | FileKind::MachO64 | FileKind::MachOFat32 | FileKind::MachOFat64) => Ok(Format::MachO),
        _ => Err(OpenError::UnknownFormat),
    }
}

/// Loads a container from disk.
///
/// The input is mapped only while its bytes are copied; the handle is released
/// before parsing starts, on every path.
pub fn open(path: &Path) -> Result<File, OpenError> {
    let io = |source| OpenError::Io {
        path: path.to_owned(),
        source,
    };
    let data = {
        let file = fs::File::open(path).map_err(io)?;
        // The mapping does not outlive this block.
        let map = unsafe { Mmap::map(&file) }.map_err(io)?;
        map.to_vec()
    };
    parse(path.to_owned(), data)
}

/// Parses a container already in memory.
pub fn parse(path: PathBuf, data: Vec<u8>) -> Result<File, OpenError> {
    let format = detect(&data)?;
    let (architectures, fat) = match format {
        Format::Pe => (vec![pe::read(&data)?], None),
        Format::Elf => (vec![elf::read(&data)?], None),
        Format::MachO => macho::read_container(&data)?,
    };
    for arch in &architectures {
        tracing::debug!(
            arch = %arch.name,
            segments = arch.segments.len(),
            functions = arch.functions.len(),
            relocations = arch.relocations.len(),
            "image loaded"
        );
    }
    Ok(File {
        path,
        format,
        data,
        fat,
        architectures,
    })
}

/// Rejects layouts the container cannot express. Runs before any byte is written.
pub fn check_limits(file: &File) -> Result<(), WriteError> {
    for arch in &file.architectures {
        let end = arch.segments.iter().map(|s| u128::from(s.address) + u128::from(s.size)).max();
        if let Some(end) = end.filter(|&e| e > arch.address_size.limit()) {
            return Err(WriteError::AddressSpace { end });
        }
        for (i, a) in arch.segments.iter().enumerate() {
            if let Some(b) = arch.segments[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(WriteError::Layout(format!("segments {} and {} overlap", a.name, b.name)));
            }
        }
        match &arch.header {
            ImageHeader::Pe(header) => pe::check(arch, header)?,
            ImageHeader::Elf(header) => elf::check(arch, header)?,
            ImageHeader::MachO(header) => macho::check(arch, header)?,
            ImageHeader::None => {}
        }
    }
    Ok(())
}

/// Bytes layout must keep free at the end of the VM segment for container tables.
pub fn tail_reserve(arch: &Architecture) -> u64 {
    match &arch.header {
        ImageHeader::Elf(header) => elf::phdr_table_len(header, 1),
        _ => 0,
    }
}

/// Produces the output container.
pub fn serialize(file: &File) -> Result<Vec<u8>, WriteError> {
    match file.format {
        Format::MachO => macho::write_container(file),
        Format::Pe | Format::Elf => {
            let arch = file
                .architectures
                .first()
                .ok_or_else(|| WriteError::Layout("no architecture".into()))?;
            match &arch.header {
                ImageHeader::Pe(header) => pe::write(&file.data, arch, header),
                ImageHeader::Elf(header) => elf::write(&file.data, arch, header),
                _ => Err(WriteError::Layout(format!("{} image without its header", file.format.name()))),
            }
        }
    }
}

/// Copies the file-backed bytes of every segment into `image`, growing it for
/// segments placed past its end.
pub(crate) fn write_segments(image: &mut Vec<u8>, segments: &[Segment]) -> Result<(), WriteError> {
    for segment in segments {
        let len = (segment.physical_len() as usize).min(segment.data.len());
        if len == 0 {
            continue;
        }
        let start = to_usize(segment.offset)?;
        let end = start + len;
        if end > image.len() {
            image.resize(end, 0);
        }
        image[start..end].copy_from_slice(&segment.data[..len]);
    }
    Ok(())
}

/// Fills symbols, imports and exports through the object crate's unified view, and
/// adds a function for every text symbol inside an executable segment.
pub(crate) fn read_symbols(arch: &mut Architecture, data: &[u8]) -> Result<(), OpenError> {
    let object = object::File::parse(data)?;
    for symbol in object.symbols().chain(object.dynamic_symbols()) {
        if !symbol.is_definition() || symbol.address() == 0 {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        let kind = match symbol.kind() {
            ObjSymbolKind::Text => SymbolKind::Function,
            ObjSymbolKind::Data => SymbolKind::Data,
            _ => SymbolKind::Other,
        };
        arch.symbols.push(Symbol {
            name: name.to_owned(),
            address: symbol.address(),
            size: symbol.size(),
            kind,
            is_weak: symbol.is_weak(),
        });
        if kind != SymbolKind::Function || !arch.is_executable(symbol.address()) {
            continue;
        }
        match arch.function_by_address(symbol.address()) {
            Some(id) => {
                let function = &mut arch.functions[id.index()];
                if function.size.is_none() && symbol.size() > 0 {
                    function.size = Some(symbol.size());
                }
            }
            None => {
                let size = (symbol.size() > 0).then_some(symbol.size());
                arch.add_function(name, symbol.address(), size);
            }
        }
    }
    for import in object.imports()? {
        arch.imports.push(Import {
            library: String::from_utf8_lossy(import.library()).into_owned(),
            name: Some(String::from_utf8_lossy(import.name()).into_owned()),
            ordinal: None,
            address: 0,
        });
    }
    for export in object.exports()? {
        arch.exports.push(Export {
            name: Some(String::from_utf8_lossy(export.name()).into_owned()),
            ordinal: None,
            address: export.address(),
        });
    }
    Ok(())
}

/// Records the code ranges covered by `.eh_frame` (`__eh_frame` on Mach-O) and by
/// the first-level index of a Mach-O `__unwind_info` section.
pub(crate) fn read_unwind_info(arch: &mut Architecture, data: &[u8]) -> Result<(), OpenError> {
    let object = object::File::parse(data)?;
    if let Some(section) = object.section_by_name(".eh_frame") {
        let ranges = eh_frame_ranges(section.data()?, section.address(), arch.address_size.bytes() as u8);
        tracing::trace!(fdes = ranges.len(), "eh_frame read");
        arch.unwind_ranges.extend(ranges);
    }
    if let Some(section) = object.section_by_name("__unwind_info") {
        if let Some((start, end)) = compact_unwind_range(section.data()?) {
            arch.unwind_ranges.push((arch.image_base + start, arch.image_base + end));
        }
    }
    Ok(())
}

/// Text offsets spanned by a compact unwind index: from the first entry to the
/// sentinel that closes the last page.
fn compact_unwind_range(bytes: &[u8]) -> Option<(u64, u64)> {
    let u32_at = |at: usize| read_le(bytes, at, 4);
    if u32_at(0)? != 1 {
        return None;
    }
    let (index, count) = (usize::try_from(u32_at(20)?).ok()?, usize::try_from(u32_at(24)?).ok()?);
    if count < 2 {
        return None;
    }
    let first = u32_at(index)?;
    let sentinel = u32_at(index + (count - 1) * 12)?;
    (first < sentinel).then_some((first, sentinel))
}

/// `[start, end)` of every FDE in an `.eh_frame` section loaded at `address`.
///
/// Parsing stops at the first malformed entry; what was read so far is kept.
pub(crate) fn eh_frame_ranges(bytes: &[u8], address: u64, address_size: u8) -> Vec<(u64, u64)> {
    let mut eh_frame = EhFrame::new(bytes, gimli::LittleEndian);
    eh_frame.set_address_size(address_size);
    let bases = BaseAddresses::default().set_eh_frame(address);
    let mut ranges = Vec::new();
    let mut entries = eh_frame.entries(&bases);
    loop {
        match entries.next() {
            Ok(Some(CieOrFde::Fde(partial))) => {
                match partial.parse(|section, bases, offset| section.cie_from_offset(bases, offset)) {
                    Ok(fde) => ranges.push((fde.initial_address(), fde.initial_address().wrapping_add(fde.len()))),
                    Err(err) => tracing::debug!(%err, "skipping FDE"),
                }
            }
            Ok(Some(CieOrFde::Cie(_))) => {}
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(%err, "stopped reading .eh_frame");
                break;
            }
        }
    }
    ranges
}

pub(crate) fn to_usize(value: u64) -> Result<usize, WriteError> {
    usize::try_from(value).map_err(|_| WriteError::AddressSpace { end: u128::from(value) })
}

/// Borrows a header structure at `offset`.
pub(crate) fn read_pod<'a, T: Pod>(data: &'a [u8], offset: u64, what: &str) -> Result<&'a T, OpenError> {
    usize::try_from(offset)
        .ok()
        .and_then(|o| data.get(o..))
        .and_then(|bytes| pod::from_bytes::<T>(bytes).ok())
        .map(|(value, _)| value)
        .ok_or_else(|| OpenError::Truncated(format!("{what} at {offset:#x}")))
}

/// Borrows `count` consecutive header structures at `offset`.
pub(crate) fn read_pod_slice<'a, T: Pod>(
    data: &'a [u8],
    offset: u64,
    count: usize,
    what: &str,
) -> Result<&'a [T], OpenError> {
    usize::try_from(offset)
        .ok()
        .and_then(|o| data.get(o..))
        .and_then(|bytes| pod::slice_from_bytes::<T>(bytes, count).ok())
        .map(|(values, _)| values)
        .ok_or_else(|| OpenError::Truncated(format!("{count} {what} at {offset:#x}")))
}

/// Edits a header structure in place.
pub(crate) fn edit_pod<T: Pod>(data: &mut [u8], offset: u64, edit: impl FnOnce(&mut T)) -> Result<(), WriteError> {
    let value = usize::try_from(offset)
        .ok()
        .and_then(|o| data.get_mut(o..))
        .and_then(|bytes| pod::from_bytes_mut::<T>(bytes).ok())
        .map(|(value, _)| value)
        .ok_or_else(|| WriteError::Layout(format!("header at {offset:#x} is out of bounds")))?;
    edit(value);
    Ok(())
}

/// Writes a structure's bytes at `offset`.
pub(crate) fn put_pod<T: Pod>(data: &mut [u8], offset: u64, value: &T) -> Result<(), WriteError> {
    let bytes = pod::bytes_of(value);
    let start = to_usize(offset)?;
    let dst = data
        .get_mut(start..start + bytes.len())
        .ok_or_else(|| WriteError::Layout(format!("no room for a header at {offset:#x}")))?;
    dst.copy_from_slice(bytes);
    Ok(())
}
