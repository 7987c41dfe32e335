//! PE codec (PE32 and PE32+, i386 and AMD64, plus IL-only CLR images).
//!
//! Sections become segments. Function candidates come from the entry point, the
//! export table, the x64 exception directory and, for CLR images, the method
//! table. The writer appends one section header into the header slack.

use object::pe::{
    ImageDataDirectory, ImageDosHeader, ImageExportDirectory, ImageFileHeader, ImageImportDescriptor,
    ImageOptionalHeader32, ImageOptionalHeader64, ImageSectionHeader, IMAGE_DIRECTORY_ENTRY_BASERELOC,
    IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR, IMAGE_DIRECTORY_ENTRY_EXCEPTION, IMAGE_DIRECTORY_ENTRY_EXPORT,
    IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_DIRECTORY_ENTRY_SECURITY, IMAGE_DOS_SIGNATURE, IMAGE_FILE_MACHINE_AMD64,
    IMAGE_FILE_MACHINE_I386, IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC, IMAGE_NT_SIGNATURE,
    IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW, IMAGE_SCN_CNT_CODE,
    IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_NOT_PAGED, IMAGE_SCN_MEM_READ,
    IMAGE_SCN_MEM_WRITE,
};
use object::endian::{U16Bytes, U32Bytes, U16, U32};
use object::pod::{self, Pod};
use object::LittleEndian as LE;

use super::{clr, edit_pod, put_pod, read_pod, read_pod_slice, to_usize, write_segments, ImageHeader};
use crate::error::{OpenError, WriteError};
use crate::model::{
    AddressSize, Architecture, CallingConvention, Export, Import, Isa, OperandSize, Relocation, RelocationEntry,
    Segment, SegmentFlags,
};
use crate::utils::{align_up, fixed_name, name_field, read_le, write_le};

/// Loader limit on the section count.
pub const MAX_SECTIONS: usize = 96;

const SECTION_HEADER_SIZE: u64 = 40;
const CHECKSUM_OFFSET: u64 = 64;
const COMIMAGE_FLAGS_ILONLY: u32 = 1;

/// Header facts the PE writer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeHeader {
    pub pe32_plus: bool,
    /// Offset of the `PE\0\0` signature.
    pub nt_offset: u64,
    pub optional_offset: u64,
    /// Offset of the first data directory.
    pub directories: u64,
    pub directory_count: u32,
    pub section_table: u64,
    pub section_count: u16,
    /// End of the region a new section header may occupy.
    pub header_limit: u64,
}

/// Width-independent view of the optional header.
struct Optional {
    entry: u32,
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    size_of_headers: u32,
    directory_count: u32,
    size: u64,
}

fn optional_header(data: &[u8], offset: u64, pe32_plus: bool) -> Result<Optional, OpenError> {
    Ok(if pe32_plus {
        let h = read_pod::<ImageOptionalHeader64>(data, offset, "optional header")?;
        Optional {
            entry: h.address_of_entry_point.get(LE),
            image_base: h.image_base.get(LE),
            section_alignment: h.section_alignment.get(LE),
            file_alignment: h.file_alignment.get(LE),
            size_of_headers: h.size_of_headers.get(LE),
            directory_count: h.number_of_rva_and_sizes.get(LE),
            size: std::mem::size_of::<ImageOptionalHeader64>() as u64,
        }
    } else {
        let h = read_pod::<ImageOptionalHeader32>(data, offset, "optional header")?;
        Optional {
            entry: h.address_of_entry_point.get(LE),
            image_base: u64::from(h.image_base.get(LE)),
            section_alignment: h.section_alignment.get(LE),
            file_alignment: h.file_alignment.get(LE),
            size_of_headers: h.size_of_headers.get(LE),
            directory_count: h.number_of_rva_and_sizes.get(LE),
            size: std::mem::size_of::<ImageOptionalHeader32>() as u64,
        }
    })
}

fn section_flags(characteristics: u32) -> SegmentFlags {
    let mut flags = SegmentFlags::empty();
    flags.set(SegmentFlags::READ, characteristics & IMAGE_SCN_MEM_READ != 0);
    flags.set(SegmentFlags::WRITE, characteristics & IMAGE_SCN_MEM_WRITE != 0);
    flags.set(SegmentFlags::EXECUTE, characteristics & IMAGE_SCN_MEM_EXECUTE != 0);
    flags.set(SegmentFlags::PAGED, characteristics & IMAGE_SCN_MEM_NOT_PAGED == 0);
    flags
}

/// Reads a structure at a virtual address of the image.
fn struct_at<T: Pod>(arch: &Architecture, address: u64) -> Option<&T> {
    let bytes = arch.read(address, std::mem::size_of::<T>())?;
    pod::from_bytes::<T>(bytes).ok().map(|(value, _)| value)
}

fn u32_at(arch: &Architecture, address: u64) -> Option<u64> {
    read_le(arch.read(address, 4)?, 0, 4)
}

/// Maps a virtual address to its offset in the file.
fn file_offset(arch: &Architecture, address: u64) -> Option<u64> {
    let segment = arch.segment(arch.segment_by_address(address)?)?;
    let delta = address - segment.address;
    (delta < segment.data.len() as u64).then_some(segment.offset + delta)
}

/// Reads a PE image.
pub fn read(data: &[u8]) -> Result<Architecture, OpenError> {
    let dos = read_pod::<ImageDosHeader>(data, 0, "DOS header")?;
    if dos.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
        return Err(OpenError::MalformedHeader("missing MZ signature".into()));
    }
    let nt_offset = u64::from(dos.e_lfanew.get(LE));
    if read_pod::<U32Bytes<LE>>(data, nt_offset, "PE signature")?.get(LE) != IMAGE_NT_SIGNATURE {
        return Err(OpenError::MalformedHeader("missing PE signature".into()));
    }
    let file_header = read_pod::<ImageFileHeader>(data, nt_offset + 4, "file header")?;
    let optional_offset = nt_offset + 4 + std::mem::size_of::<ImageFileHeader>() as u64;
    let pe32_plus = match read_pod::<U16Bytes<LE>>(data, optional_offset, "optional header magic")?.get(LE) {
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => true,
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => false,
        magic => return Err(OpenError::MalformedHeader(format!("optional header magic {magic:#x}"))),
    };
    let optional = optional_header(data, optional_offset, pe32_plus)?;
    let machine = file_header.machine.get(LE);
    let (isa, address_size) = match (machine, pe32_plus) {
        (IMAGE_FILE_MACHINE_AMD64, true) => (Isa::X64, AddressSize::U64),
        (IMAGE_FILE_MACHINE_I386, false) => (Isa::X86, AddressSize::U32),
        (machine, _) => return Err(OpenError::UnsupportedSubtype(format!("PE machine {machine:#x}"))),
    };

    let directories = optional_offset + optional.size;
    let directory_table = read_pod_slice::<ImageDataDirectory>(
        data,
        directories,
        optional.directory_count.min(16) as usize,
        "data directories",
    )?;
    let directory = |index: usize| {
        directory_table
            .get(index)
            .map(|d| (u64::from(d.virtual_address.get(LE)), u64::from(d.size.get(LE))))
            .filter(|&(va, size)| va != 0 && size != 0)
    };

    let section_table = optional_offset + u64::from(file_header.size_of_optional_header.get(LE));
    let section_count = file_header.number_of_sections.get(LE);
    let sections = read_pod_slice::<ImageSectionHeader>(data, section_table, usize::from(section_count), "section headers")?;

    // IL-only images carry no native code worth protecting.
    let clr = directory(IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR);
    let isa = if clr.is_some() { Isa::Cil } else { isa };
    let mut arch = Architecture::new(isa.name(), isa, address_size, ImageHeader::None);
    arch.image_base = optional.image_base;
    arch.segment_alignment = u64::from(optional.section_alignment).max(1);
    arch.file_alignment = u64::from(optional.file_alignment).max(1);
    arch.time_stamp = file_header.time_date_stamp.get(LE);
    arch.size = data.len() as u64;
    arch.calling_convention = match isa {
        Isa::X64 => CallingConvention::MsX64,
        Isa::X86 => CallingConvention::Stdcall,
        Isa::Cil => CallingConvention::Managed,
    };
    if optional.entry != 0 {
        arch.entry_point = arch.image_base + u64::from(optional.entry);
    }

    let mut header_limit = u64::from(optional.size_of_headers);
    for (i, section) in sections.iter().enumerate() {
        let virtual_size = u64::from(section.virtual_size.get(LE));
        let raw_size = u64::from(section.size_of_raw_data.get(LE));
        let raw_offset = u64::from(section.pointer_to_raw_data.get(LE));
        let bytes = if raw_offset == 0 || raw_size == 0 {
            &[][..]
        } else {
            let start = raw_offset.min(data.len() as u64) as usize;
            let end = (raw_offset + raw_size).min(data.len() as u64) as usize;
            header_limit = header_limit.min(raw_offset);
            &data[start..end]
        };
        let mut segment = Segment::new(
            fixed_name(&section.name),
            arch.image_base + u64::from(section.virtual_address.get(LE)),
            if virtual_size == 0 { raw_size } else { virtual_size },
            raw_offset,
            bytes.to_vec(),
            section_flags(section.characteristics.get(LE)),
        );
        segment.header_index = Some(i);
        arch.segments.push(segment);
    }

    arch.header = ImageHeader::Pe(PeHeader {
        pe32_plus,
        nt_offset,
        optional_offset,
        directories,
        directory_count: optional.directory_count,
        section_table,
        section_count,
        header_limit,
    });

    if let Some((va, size)) = directory(IMAGE_DIRECTORY_ENTRY_BASERELOC) {
        read_base_relocations(&mut arch, va, size);
    }
    if let Some((va, _)) = directory(IMAGE_DIRECTORY_ENTRY_IMPORT) {
        read_imports(&mut arch, va);
    }
    if let Some((va, size)) = directory(IMAGE_DIRECTORY_ENTRY_EXPORT) {
        read_exports(&mut arch, va, size);
    }

    match clr {
        Some((va, _)) => {
            let header = struct_at::<object::pe::ImageCor20Header>(&arch, arch.image_base + va)
                .ok_or_else(|| OpenError::Truncated("CLR header".into()))?;
            let flags = header.flags.get(LE);
            if flags & COMIMAGE_FLAGS_ILONLY == 0 {
                return Err(OpenError::UnsupportedFeature("mixed-mode CLR image".into()));
            }
            let metadata = arch.image_base + u64::from(header.meta_data.virtual_address.get(LE));
            for method in clr::methods(&arch, metadata)? {
                let id = arch.add_function(method.name, method.address, None);
                arch.functions[id.index()].signature = method.signature;
            }
        }
        None => {
            if arch.entry_point != 0 && arch.is_executable(arch.entry_point) {
                arch.add_function("entry", arch.entry_point, None);
            }
            let exported: Vec<(String, u64)> = arch
                .exports
                .iter()
                .filter(|e| arch.is_executable(e.address))
                .map(|e| {
                    let name = e.name.clone().unwrap_or_else(|| format!("ordinal_{}", e.ordinal.unwrap_or(0)));
                    (name, e.address)
                })
                .collect();
            for (name, address) in exported {
                if arch.function_by_address(address).is_none() {
                    arch.add_function(name, address, None);
                }
            }
            if isa == Isa::X64 {
                if let Some((va, size)) = directory(IMAGE_DIRECTORY_ENTRY_EXCEPTION) {
                    read_runtime_functions(&mut arch, va, size);
                }
            }
        }
    }
    Ok(arch)
}

fn read_base_relocations(arch: &mut Architecture, va: u64, size: u64) {
    let mut block = arch.image_base + va;
    let end = block + size;
    while block + 8 <= end {
        let (Some(page), Some(block_size)) = (u32_at(arch, block), u32_at(arch, block + 4)) else {
            break;
        };
        if block_size < 8 {
            break;
        }
        for k in 0..(block_size - 8) / 2 {
            let entry = block + 8 + k * 2;
            let Some(raw) = arch.read(entry, 2).and_then(|b| read_le(b, 0, 2)) else {
                break;
            };
            let (kind, offset) = ((raw >> 12) as u16, raw & 0xfff);
            let size = match kind {
                IMAGE_REL_BASED_ABSOLUTE => continue,
                IMAGE_REL_BASED_HIGHLOW => OperandSize::Dword,
                IMAGE_REL_BASED_DIR64 => OperandSize::Qword,
                _ => OperandSize::Word,
            };
            let address = arch.image_base + page + offset;
            let target = match size {
                OperandSize::Dword => u32_at(arch, address),
                OperandSize::Qword => arch.read(address, 8).and_then(|b| read_le(b, 0, 8)),
                _ => None,
            };
            let Some(file_offset) = file_offset(arch, entry) else {
                continue;
            };
            arch.relocations.push(Relocation {
                address,
                size,
                target,
                entry: RelocationEntry::PeBlock { file_offset },
                deleted: false,
            });
        }
        block += align_up(block_size, 4);
    }
}

fn read_imports(arch: &mut Architecture, va: u64) {
    let word = arch.address_size.bytes();
    let ordinal_flag = 1u64 << (word * 8 - 1);
    let mut imports = Vec::new();
    let mut at = arch.image_base + va;
    while let Some(descriptor) = struct_at::<ImageImportDescriptor>(arch, at) {
        let name = descriptor.name.get(LE);
        let first_thunk = u64::from(descriptor.first_thunk.get(LE));
        if name == 0 || first_thunk == 0 {
            break;
        }
        let lookup = match descriptor.original_first_thunk.get(LE) {
            0 => first_thunk,
            rva => u64::from(rva),
        };
        let library = arch.read_cstr(arch.image_base + u64::from(name)).unwrap_or_default();
        for i in 0.. {
            let slot = arch.image_base + lookup + i * word;
            let Some(thunk) = arch.read(slot, word as usize).and_then(|b| read_le(b, 0, word as usize)) else {
                break;
            };
            if thunk == 0 {
                break;
            }
            let (name, ordinal) = if thunk & ordinal_flag != 0 {
                (None, Some(thunk as u16))
            } else {
                (arch.read_cstr(arch.image_base + (thunk & 0x7fff_ffff) + 2), None)
            };
            imports.push(Import {
                library: library.clone(),
                name,
                ordinal,
                address: arch.image_base + first_thunk + i * word,
            });
        }
        at += std::mem::size_of::<ImageImportDescriptor>() as u64;
    }
    arch.imports = imports;
}

fn read_exports(arch: &mut Architecture, va: u64, size: u64) {
    let base = arch.image_base;
    let Some(directory) = struct_at::<ImageExportDirectory>(arch, base + va) else {
        return;
    };
    let ordinal_base = directory.base.get(LE);
    let functions = u64::from(directory.address_of_functions.get(LE));
    let names = u64::from(directory.address_of_names.get(LE));
    let ordinals = u64::from(directory.address_of_name_ordinals.get(LE));
    let function_count = u64::from(directory.number_of_functions.get(LE));
    let name_count = u64::from(directory.number_of_names.get(LE));

    let mut named = std::collections::HashMap::new();
    for i in 0..name_count {
        let name = u32_at(arch, base + names + i * 4).and_then(|rva| arch.read_cstr(base + rva));
        let index = arch.read(base + ordinals + i * 2, 2).and_then(|b| read_le(b, 0, 2));
        if let (Some(name), Some(index)) = (name, index) {
            named.insert(index, name);
        }
    }
    let mut exports = Vec::new();
    for index in 0..function_count {
        let Some(rva) = u32_at(arch, base + functions + index * 4).filter(|&rva| rva != 0) else {
            continue;
        };
        // Forwarders point back into the export directory.
        if (va..va + size).contains(&rva) {
            continue;
        }
        exports.push(Export {
            name: named.remove(&index),
            ordinal: Some(ordinal_base + index as u32),
            address: base + rva,
        });
    }
    arch.exports = exports;
}

/// Adds sized functions and unwind ranges from the x64 `RUNTIME_FUNCTION` table.
fn read_runtime_functions(arch: &mut Architecture, va: u64, size: u64) {
    let base = arch.image_base;
    for i in 0..size / 12 {
        let entry = base + va + i * 12;
        let (Some(begin), Some(end)) = (u32_at(arch, entry), u32_at(arch, entry + 4)) else {
            break;
        };
        if end <= begin {
            continue;
        }
        let address = base + begin;
        arch.unwind_ranges.push((address, base + end));
        match arch.function_by_address(address) {
            Some(id) => arch.functions[id.index()].size = Some(end - begin),
            None => {
                arch.add_function(format!("sub_{address:x}"), address, Some(end - begin));
            }
        }
    }
}

pub fn check(arch: &Architecture, header: &PeHeader) -> Result<(), WriteError> {
    if arch.vm_segment.is_none() {
        return Ok(());
    }
    let count = usize::from(header.section_count) + 1;
    if count > MAX_SECTIONS {
        return Err(WriteError::TooManySegments {
            count,
            max: MAX_SECTIONS,
        });
    }
    let slot = header.section_table + u64::from(header.section_count) * SECTION_HEADER_SIZE;
    if slot + SECTION_HEADER_SIZE > header.header_limit {
        return Err(WriteError::NoHeaderRoom {
            needed: SECTION_HEADER_SIZE,
            available: header.header_limit.saturating_sub(slot),
        });
    }
    let image_size = arch.end_address() - arch.image_base;
    if image_size > u64::from(u32::MAX) {
        return Err(WriteError::AddressSpace {
            end: u128::from(arch.end_address()),
        });
    }
    Ok(())
}

/// Standard PE image checksum, skipping the checksum field itself.
pub fn checksum(data: &[u8], field: usize) -> u32 {
    let mut sum = 0u64;
    for (i, pair) in data.chunks(2).enumerate() {
        let at = i * 2;
        if at == field || at == field + 2 {
            continue;
        }
        let word = u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]);
        sum += u64::from(word);
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum = (sum & 0xffff) + (sum >> 16);
    (sum as u32).wrapping_add(data.len() as u32)
}

/// Writes the image: section contents, neutralized base relocations and, when a
/// VM segment exists, its section header plus the updated optional header.
pub fn write(original: &[u8], arch: &Architecture, header: &PeHeader) -> Result<Vec<u8>, WriteError> {
    let mut image = original.to_vec();
    write_segments(&mut image, &arch.segments)?;
    for reloc in arch.relocations.iter().filter(|r| r.deleted) {
        if let RelocationEntry::PeBlock { file_offset } = reloc.entry {
            // An IMAGE_REL_BASED_ABSOLUTE entry is padding.
            if !write_le(&mut image, to_usize(file_offset)?, 2, 0) {
                return Err(WriteError::Layout(format!("relocation entry {file_offset:#x} is out of bounds")));
            }
        }
    }

    let Some(segment) = arch.vm_segment.and_then(|id| arch.segment(id)) else {
        return Ok(image);
    };
    let raw_size = align_up(segment.data.len() as u64, arch.file_alignment);
    let raw_end = to_usize(segment.offset + raw_size)?;
    if image.len() < raw_end {
        image.resize(raw_end, 0);
    }
    let executable = segment.flags.contains(SegmentFlags::EXECUTE);
    let characteristics = if executable {
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ
    } else {
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ
    };
    let rva = |address: u64| U32::new(LE, (address - arch.image_base) as u32);
    let section = ImageSectionHeader {
        name: name_field::<8>(&segment.name),
        virtual_size: U32::new(LE, segment.size as u32),
        virtual_address: rva(segment.address),
        size_of_raw_data: U32::new(LE, raw_size as u32),
        pointer_to_raw_data: U32::new(LE, segment.offset as u32),
        pointer_to_relocations: U32::new(LE, 0),
        pointer_to_linenumbers: U32::new(LE, 0),
        number_of_relocations: U16::new(LE, 0),
        number_of_linenumbers: U16::new(LE, 0),
        characteristics: U32::new(LE, characteristics),
    };
    let slot = header.section_table + u64::from(header.section_count) * SECTION_HEADER_SIZE;
    put_pod(&mut image, slot, &section)?;
    edit_pod::<ImageFileHeader>(&mut image, header.nt_offset + 4, |h| {
        h.number_of_sections = U16::new(LE, header.section_count + 1);
    })?;

    let size_of_image = align_up(arch.end_address() - arch.image_base, arch.segment_alignment) as u32;
    let code_growth = if executable { raw_size as u32 } else { 0 };
    if header.pe32_plus {
        edit_pod::<ImageOptionalHeader64>(&mut image, header.optional_offset, |h| {
            h.size_of_image = U32::new(LE, size_of_image);
            h.size_of_code = U32::new(LE, h.size_of_code.get(LE).wrapping_add(code_growth));
        })?;
    } else {
        edit_pod::<ImageOptionalHeader32>(&mut image, header.optional_offset, |h| {
            h.size_of_image = U32::new(LE, size_of_image);
            h.size_of_code = U32::new(LE, h.size_of_code.get(LE).wrapping_add(code_growth));
        })?;
    }
    // The signature no longer matches the image.
    if header.directory_count as usize > IMAGE_DIRECTORY_ENTRY_SECURITY {
        let entry = header.directories + (IMAGE_DIRECTORY_ENTRY_SECURITY * 8) as u64;
        edit_pod::<ImageDataDirectory>(&mut image, entry, |d| {
            d.virtual_address = U32::new(LE, 0);
            d.size = U32::new(LE, 0);
        })?;
    }
    let field = to_usize(header.optional_offset + CHECKSUM_OFFSET)?;
    let sum = checksum(&image, field);
    if !write_le(&mut image, field, 4, u64::from(sum)) {
        return Err(WriteError::Layout("checksum field is out of bounds".into()));
    }
    tracing::debug!(section = %segment.name, checksum = sum, "section appended");
    Ok(image)
}
