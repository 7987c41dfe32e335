//! ELF codec (ELF32/ELF64, little endian, i386 and x86-64).
//!
//! `PT_LOAD` program headers become segments. The writer appends the VM segment as
//! a new `PT_LOAD` at the end of the file; because the program header table cannot
//! grow in place, a copy with the extra entry is stored at the end of that segment
//! and `e_phoff`/`PT_PHDR` are pointed at it.

use object::elf::{
    FileHeader32, FileHeader64, ProgramHeader32, ProgramHeader64, SectionHeader32, SectionHeader64, ELFCLASS32,
    ELFCLASS64, ELFDATA2LSB, EM_386, EM_X86_64, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD, PT_PHDR, R_386_COPY,
    R_386_NONE, R_386_RELATIVE, R_X86_64_32, R_X86_64_32S, R_X86_64_COPY, R_X86_64_NONE, R_X86_64_PC32,
    R_X86_64_RELATIVE, SHF_ALLOC, SHT_REL, SHT_RELA,
};
use object::endian::{U16, U32, U64};
use object::Endianness;

use super::{edit_pod, put_pod, read_pod, read_symbols, read_unwind_info, to_usize, write_segments, ImageHeader};
use crate::error::{OpenError, WriteError};
use crate::model::{
    AddressSize, Architecture, Isa, OperandSize, Relocation, RelocationEntry, Segment, SegmentFlags,
};
use crate::utils::{read_le, write_le};

const LE: Endianness = Endianness::Little;

/// Largest `e_phnum` before the extended numbering scheme kicks in.
const MAX_PHNUM: usize = 0xfffe;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(LE, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(LE, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(LE, v)
}

/// Header facts the ELF writer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfHeader {
    pub class64: bool,
    pub phoff: u64,
    pub phnum: u16,
    pub phentsize: u16,
    /// Index of the `PT_PHDR` entry.
    pub phdr_entry: Option<usize>,
}

/// Width-independent view of a program header.
#[derive(Debug, Clone, Copy)]
struct Phdr {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

/// Width-independent view of the file header.
struct Ehdr {
    e_type: u16,
    machine: u16,
    entry: u64,
    phoff: u64,
    phnum: u16,
    phentsize: u16,
    shoff: u64,
    shnum: u16,
    shentsize: u16,
}

fn file_header(data: &[u8], class64: bool) -> Result<Ehdr, OpenError> {
    Ok(if class64 {
        let h = read_pod::<FileHeader64<Endianness>>(data, 0, "ELF header")?;
        Ehdr {
            e_type: h.e_type.get(LE),
            machine: h.e_machine.get(LE),
            entry: h.e_entry.get(LE),
            phoff: h.e_phoff.get(LE),
            phnum: h.e_phnum.get(LE),
            phentsize: h.e_phentsize.get(LE),
            shoff: h.e_shoff.get(LE),
            shnum: h.e_shnum.get(LE),
            shentsize: h.e_shentsize.get(LE),
        }
    } else {
        let h = read_pod::<FileHeader32<Endianness>>(data, 0, "ELF header")?;
        Ehdr {
            e_type: h.e_type.get(LE),
            machine: h.e_machine.get(LE),
            entry: u64::from(h.e_entry.get(LE)),
            phoff: u64::from(h.e_phoff.get(LE)),
            phnum: h.e_phnum.get(LE),
            phentsize: h.e_phentsize.get(LE),
            shoff: u64::from(h.e_shoff.get(LE)),
            shnum: h.e_shnum.get(LE),
            shentsize: h.e_shentsize.get(LE),
        }
    })
}

fn program_header(data: &[u8], offset: u64, class64: bool) -> Result<Phdr, OpenError> {
    Ok(if class64 {
        let p = read_pod::<ProgramHeader64<Endianness>>(data, offset, "program header")?;
        Phdr {
            p_type: p.p_type.get(LE),
            flags: p.p_flags.get(LE),
            offset: p.p_offset.get(LE),
            vaddr: p.p_vaddr.get(LE),
            filesz: p.p_filesz.get(LE),
            memsz: p.p_memsz.get(LE),
            align: p.p_align.get(LE),
        }
    } else {
        let p = read_pod::<ProgramHeader32<Endianness>>(data, offset, "program header")?;
        Phdr {
            p_type: p.p_type.get(LE),
            flags: p.p_flags.get(LE),
            offset: u64::from(p.p_offset.get(LE)),
            vaddr: u64::from(p.p_vaddr.get(LE)),
            filesz: u64::from(p.p_filesz.get(LE)),
            memsz: u64::from(p.p_memsz.get(LE)),
            align: u64::from(p.p_align.get(LE)),
        }
    })
}

/// `(type, flags, offset, size, entsize)` of a section header.
fn section_header(data: &[u8], offset: u64, class64: bool) -> Result<(u32, u64, u64, u64, u64), OpenError> {
    Ok(if class64 {
        let s = read_pod::<SectionHeader64<Endianness>>(data, offset, "section header")?;
        (
            s.sh_type.get(LE),
            s.sh_flags.get(LE),
            s.sh_offset.get(LE),
            s.sh_size.get(LE),
            s.sh_entsize.get(LE),
        )
    } else {
        let s = read_pod::<SectionHeader32<Endianness>>(data, offset, "section header")?;
        (
            s.sh_type.get(LE),
            u64::from(s.sh_flags.get(LE)),
            u64::from(s.sh_offset.get(LE)),
            u64::from(s.sh_size.get(LE)),
            u64::from(s.sh_entsize.get(LE)),
        )
    })
}

fn segment_flags(p_flags: u32) -> SegmentFlags {
    let mut flags = SegmentFlags::empty();
    flags.set(SegmentFlags::READ, p_flags & PF_R != 0);
    flags.set(SegmentFlags::WRITE, p_flags & PF_W != 0);
    flags.set(SegmentFlags::EXECUTE, p_flags & PF_X != 0);
    flags
}

/// Reads an ELF executable or shared object.
pub fn read(data: &[u8]) -> Result<Architecture, OpenError> {
    // e_ident[EI_CLASS] and e_ident[EI_DATA]
    let (class, encoding) = match data.get(..16) {
        Some(ident) => (ident[4], ident[5]),
        None => return Err(OpenError::Truncated("ELF identification at 0x0".into())),
    };
    if encoding != ELFDATA2LSB {
        return Err(OpenError::UnsupportedSubtype("big-endian ELF".into()));
    }
    let class64 = match class {
        ELFCLASS64 => true,
        ELFCLASS32 => false,
        class => return Err(OpenError::MalformedHeader(format!("ELF class {class}"))),
    };
    let ehdr = file_header(data, class64)?;
    let (isa, address_size) = match (ehdr.machine, class64) {
        (EM_X86_64, true) => (Isa::X64, AddressSize::U64),
        (EM_386, false) => (Isa::X86, AddressSize::U32),
        (machine, _) => return Err(OpenError::UnsupportedSubtype(format!("ELF machine {machine}"))),
    };
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(OpenError::UnsupportedSubtype(format!("ELF type {}", ehdr.e_type)));
    }
    let expected = if class64 { 56 } else { 32 };
    if ehdr.phnum > 0 && usize::from(ehdr.phentsize) != expected {
        return Err(OpenError::MalformedHeader(format!("program header size {}", ehdr.phentsize)));
    }

    let mut phdr_entry = None;
    let mut arch = Architecture::new(isa.name(), isa, address_size, ImageHeader::None);
    let mut loads = Vec::new();
    for i in 0..usize::from(ehdr.phnum) {
        let phdr = program_header(data, ehdr.phoff + (i * expected) as u64, class64)?;
        match phdr.p_type {
            PT_LOAD => loads.push((i, phdr)),
            PT_PHDR => phdr_entry = Some(i),
            _ => {}
        }
    }
    if loads.is_empty() {
        return Err(OpenError::MalformedHeader("no PT_LOAD program headers".into()));
    }

    let alignment = loads.iter().map(|(_, p)| p.align).max().unwrap_or(0).max(0x1000);
    for (n, (index, phdr)) in loads.iter().enumerate() {
        let start = usize::try_from(phdr.offset).map_err(|_| OpenError::Truncated("PT_LOAD offset".into()))?;
        let bytes = start
            .checked_add(phdr.filesz as usize)
            .and_then(|end| data.get(start..end))
            .ok_or_else(|| OpenError::Truncated(format!("PT_LOAD {n} data")))?;
        let mut segment = Segment::new(
            format!("LOAD{n}"),
            phdr.vaddr,
            phdr.memsz.max(phdr.filesz),
            phdr.offset,
            bytes.to_vec(),
            segment_flags(phdr.flags),
        );
        segment.header_index = Some(*index);
        arch.segments.push(segment);
    }
    let lowest = arch.segments.iter().map(|s| s.address).min().unwrap_or(0);
    arch.image_base = lowest & !(alignment - 1);
    arch.entry_point = ehdr.entry;
    arch.segment_alignment = alignment;
    arch.file_alignment = alignment;
    arch.size = data.len() as u64;
    arch.header = ImageHeader::Elf(ElfHeader {
        class64,
        phoff: ehdr.phoff,
        phnum: ehdr.phnum,
        phentsize: ehdr.phentsize,
        phdr_entry,
    });

    read_symbols(&mut arch, data)?;
    read_unwind_info(&mut arch, data)?;
    read_relocations(&mut arch, data, &ehdr, class64)?;
    Ok(arch)
}

/// Loads the allocatable `SHT_REL`/`SHT_RELA` tables.
fn read_relocations(arch: &mut Architecture, data: &[u8], ehdr: &Ehdr, class64: bool) -> Result<(), OpenError> {
    if ehdr.shoff == 0 {
        return Ok(());
    }
    for i in 0..u64::from(ehdr.shnum) {
        let (sh_type, sh_flags, offset, size, entsize) =
            section_header(data, ehdr.shoff + i * u64::from(ehdr.shentsize), class64)?;
        if (sh_type != SHT_REL && sh_type != SHT_RELA) || sh_flags & u64::from(SHF_ALLOC) == 0 {
            continue;
        }
        let rela = sh_type == SHT_RELA;
        let word = if class64 { 8 } else { 4 };
        let entsize = match entsize {
            0 => word * if rela { 3 } else { 2 },
            n => n,
        };
        for n in 0..size / entsize {
            let entry = offset + n * entsize;
            let at = usize::try_from(entry).map_err(|_| OpenError::Truncated("relocation table".into()))?;
            let field = |k: usize| {
                read_le(data, at + k * word as usize, word as usize)
                    .ok_or_else(|| OpenError::Truncated(format!("relocation at {entry:#x}")))
            };
            let r_offset = field(0)?;
            let r_info = field(1)?;
            let addend = if rela { Some(field(2)?) } else { None };
            let r_type = if class64 { r_info as u32 } else { r_info as u32 & 0xff };
            let Some((size, relative)) = relocation_shape(arch.isa, r_type) else {
                continue;
            };
            let target = if relative {
                match addend {
                    Some(addend) => Some(addend & arch.address_size.operand_size().mask()),
                    None => arch.read_word(r_offset),
                }
            } else {
                None
            };
            arch.relocations.push(Relocation {
                address: r_offset,
                size,
                target,
                entry: RelocationEntry::Elf {
                    file_offset: entry,
                    rela,
                    class64,
                },
                deleted: false,
            });
        }
    }
    Ok(())
}

/// Patched width and whether the type is a plain base-relative rebase.
fn relocation_shape(isa: Isa, r_type: u32) -> Option<(OperandSize, bool)> {
    match isa {
        Isa::X64 => match r_type {
            R_X86_64_NONE | R_X86_64_COPY => None,
            R_X86_64_RELATIVE => Some((OperandSize::Qword, true)),
            R_X86_64_32 | R_X86_64_32S | R_X86_64_PC32 => Some((OperandSize::Dword, false)),
            _ => Some((OperandSize::Qword, false)),
        },
        _ => match r_type {
            R_386_NONE | R_386_COPY => None,
            R_386_RELATIVE => Some((OperandSize::Dword, true)),
            _ => Some((OperandSize::Dword, false)),
        },
    }
}

/// Size of a program header table with `extra` more entries.
pub fn phdr_table_len(header: &ElfHeader, extra: u64) -> u64 {
    (u64::from(header.phnum) + extra) * u64::from(header.phentsize)
}

pub fn check(arch: &Architecture, header: &ElfHeader) -> Result<(), WriteError> {
    if arch.vm_segment.is_some() && usize::from(header.phnum) + 1 > MAX_PHNUM {
        return Err(WriteError::TooManySegments {
            count: usize::from(header.phnum) + 1,
            max: MAX_PHNUM,
        });
    }
    Ok(())
}

/// Writes the image: segment contents, neutralized relocations and, when a VM
/// segment exists, its `PT_LOAD` plus the relocated program header table.
pub fn write(original: &[u8], arch: &Architecture, header: &ElfHeader) -> Result<Vec<u8>, WriteError> {
    let mut image = original.to_vec();
    write_segments(&mut image, &arch.segments)?;

    for reloc in arch.relocations.iter().filter(|r| r.deleted) {
        if let RelocationEntry::Elf { file_offset, class64, .. } = reloc.entry {
            let word = if class64 { 8 } else { 4 };
            // r_info = 0 is R_*_NONE against the null symbol.
            if !write_le(&mut image, to_usize(file_offset + word)?, word as usize, 0) {
                return Err(WriteError::Layout(format!("relocation entry {file_offset:#x} is out of bounds")));
            }
        }
    }

    let Some(segment) = arch.vm_segment.and_then(|id| arch.segment(id)) else {
        return Ok(image);
    };
    let table_len = phdr_table_len(header, 1);
    let old_len = phdr_table_len(header, 0);
    let data_len = segment.data.len() as u64;
    if data_len < table_len {
        return Err(WriteError::Layout("VM segment has no room for the program headers".into()));
    }
    let table_offset = segment.offset + data_len - table_len;
    let table_address = segment.address + data_len - table_len;

    let old = image
        .get(to_usize(header.phoff)?..to_usize(header.phoff + old_len)?)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| WriteError::Layout("program header table is out of bounds".into()))?;
    let start = to_usize(table_offset)?;
    image[start..start + old.len()].copy_from_slice(&old);

    let mut p_flags = PF_R;
    if segment.flags.contains(SegmentFlags::EXECUTE) {
        p_flags |= PF_X;
    }
    let entry_offset = table_offset + old_len;
    let phentsize = u64::from(header.phentsize);
    let phnum = header.phnum + 1;
    if header.class64 {
        put_pod(
            &mut image,
            entry_offset,
            &ProgramHeader64::<Endianness> {
                p_type: u32(PT_LOAD),
                p_flags: u32(p_flags),
                p_offset: u64(segment.offset),
                p_vaddr: u64(segment.address),
                p_paddr: u64(segment.address),
                p_filesz: u64(data_len),
                p_memsz: u64(segment.size.max(data_len)),
                p_align: u64(arch.segment_alignment),
            },
        )?;
        if let Some(i) = header.phdr_entry {
            edit_pod::<ProgramHeader64<Endianness>>(&mut image, table_offset + i as u64 * phentsize, |p| {
                p.p_offset = u64(table_offset);
                p.p_vaddr = u64(table_address);
                p.p_paddr = u64(table_address);
                p.p_filesz = u64(table_len);
                p.p_memsz = u64(table_len);
            })?;
        }
        edit_pod::<FileHeader64<Endianness>>(&mut image, 0, |h| {
            h.e_phoff = u64(table_offset);
            h.e_phnum = u16(phnum);
        })?;
    } else {
        let narrow = |v: u64| u32(v as u32);
        put_pod(
            &mut image,
            entry_offset,
            &ProgramHeader32::<Endianness> {
                p_type: u32(PT_LOAD),
                p_offset: narrow(segment.offset),
                p_vaddr: narrow(segment.address),
                p_paddr: narrow(segment.address),
                p_filesz: narrow(data_len),
                p_memsz: narrow(segment.size.max(data_len)),
                p_flags: u32(p_flags),
                p_align: narrow(arch.segment_alignment),
            },
        )?;
        if let Some(i) = header.phdr_entry {
            edit_pod::<ProgramHeader32<Endianness>>(&mut image, table_offset + i as u64 * phentsize, |p| {
                p.p_offset = narrow(table_offset);
                p.p_vaddr = narrow(table_address);
                p.p_paddr = narrow(table_address);
                p.p_filesz = narrow(table_len);
                p.p_memsz = narrow(table_len);
            })?;
        }
        edit_pod::<FileHeader32<Endianness>>(&mut image, 0, |h| {
            h.e_phoff = narrow(table_offset);
            h.e_phnum = u16(phnum);
        })?;
    }
    tracing::debug!(offset = table_offset, entries = phnum, "program headers relocated");
    Ok(image)
}
