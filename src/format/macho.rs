//! Mach-O codec (thin i386/x86-64 images and universal containers).
//!
//! Every `LC_SEGMENT`/`LC_SEGMENT_64` with mapped contents becomes a segment. The
//! writer inserts one more segment command into the slack between the load
//! commands and the first section's data, then appends the segment contents to the
//! end of the slice. Universal containers are rebuilt slice by slice.

use object::endian::{U32, U64};
use object::macho::{
    DyldInfoCommand, EncryptionInfoCommand32, FatArch32, FatArch64, FatHeader, LinkeditDataCommand, LoadCommand,
    MachHeader32, MachHeader64, Section32, Section64, SegmentCommand32, SegmentCommand64, CPU_TYPE_X86,
    CPU_TYPE_X86_64, FAT_MAGIC, FAT_MAGIC_64, LC_DYLD_CHAINED_FIXUPS, LC_DYLD_INFO, LC_DYLD_INFO_ONLY,
    LC_ENCRYPTION_INFO, LC_ENCRYPTION_INFO_64, LC_FUNCTION_STARTS, LC_MAIN, LC_SEGMENT, LC_SEGMENT_64,
    LC_UNIXTHREAD, MH_BUNDLE, MH_DYLIB, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64, REBASE_IMMEDIATE_MASK,
    REBASE_OPCODE_ADD_ADDR_IMM_SCALED, REBASE_OPCODE_ADD_ADDR_ULEB, REBASE_OPCODE_DONE,
    REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB, REBASE_OPCODE_DO_REBASE_IMM_TIMES, REBASE_OPCODE_DO_REBASE_ULEB_TIMES,
    REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB, REBASE_OPCODE_MASK, REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
    REBASE_OPCODE_SET_TYPE_IMM, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE,
};
use object::{BigEndian, FileKind, LittleEndian as LE};

use super::{edit_pod, put_pod, read_pod, read_pod_slice, read_symbols, read_unwind_info, to_usize, write_segments, FatSlice, ImageHeader};
use crate::error::{OpenError, WriteError};
use crate::model::{AddressSize, Architecture, File, Isa, Relocation, RelocationEntry, Segment, SegmentFlags};
use crate::utils::{align_up, fixed_name, name_field, read_le};

/// Header facts the Mach-O writer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachOHeader {
    pub is64: bool,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    /// Offset just past the last load command.
    pub commands_end: u64,
    /// Lowest file offset holding section data; load commands must end before it.
    pub slack_limit: u64,
}

impl MachOHeader {
    /// Size of a segment command without sections.
    pub fn segment_command_size(&self) -> u64 {
        if self.is64 {
            std::mem::size_of::<SegmentCommand64<LE>>() as u64
        } else {
            std::mem::size_of::<SegmentCommand32<LE>>() as u64
        }
    }
}

/// Width-independent view of a segment command.
struct SegmentInfo {
    name: String,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    initprot: u32,
    /// Offsets of section data inside the file.
    section_offsets: Vec<u64>,
}

fn segment_command(data: &[u8], at: u64, is64: bool) -> Result<SegmentInfo, OpenError> {
    let (mut info, nsects, sections_at) = if is64 {
        let cmd = read_pod::<SegmentCommand64<LE>>(data, at, "segment command")?;
        let info = SegmentInfo {
            name: fixed_name(&cmd.segname),
            vmaddr: cmd.vmaddr.get(LE),
            vmsize: cmd.vmsize.get(LE),
            fileoff: cmd.fileoff.get(LE),
            filesize: cmd.filesize.get(LE),
            initprot: cmd.initprot.get(LE),
            section_offsets: Vec::new(),
        };
        (info, cmd.nsects.get(LE), at + std::mem::size_of::<SegmentCommand64<LE>>() as u64)
    } else {
        let cmd = read_pod::<SegmentCommand32<LE>>(data, at, "segment command")?;
        let info = SegmentInfo {
            name: fixed_name(&cmd.segname),
            vmaddr: u64::from(cmd.vmaddr.get(LE)),
            vmsize: u64::from(cmd.vmsize.get(LE)),
            fileoff: u64::from(cmd.fileoff.get(LE)),
            filesize: u64::from(cmd.filesize.get(LE)),
            initprot: cmd.initprot.get(LE),
            section_offsets: Vec::new(),
        };
        (info, cmd.nsects.get(LE), at + std::mem::size_of::<SegmentCommand32<LE>>() as u64)
    };
    let count = nsects as usize;
    info.section_offsets = if is64 {
        read_pod_slice::<Section64<LE>>(data, sections_at, count, "sections")?
            .iter()
            .filter(|s| s.size.get(LE) > 0)
            .map(|s| u64::from(s.offset.get(LE)))
            .collect()
    } else {
        read_pod_slice::<Section32<LE>>(data, sections_at, count, "sections")?
            .iter()
            .filter(|s| s.size.get(LE) > 0)
            .map(|s| u64::from(s.offset.get(LE)))
            .collect()
    };
    Ok(info)
}

fn protection(initprot: u32) -> SegmentFlags {
    let mut flags = SegmentFlags::PAGED;
    flags.set(SegmentFlags::READ, initprot & VM_PROT_READ != 0);
    flags.set(SegmentFlags::WRITE, initprot & VM_PROT_WRITE != 0);
    flags.set(SegmentFlags::EXECUTE, initprot & VM_PROT_EXECUTE != 0);
    flags
}

fn uleb128(data: &[u8], at: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data.get(*at)?;
        *at += 1;
        if shift < 64 {
            value |= u64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
}

/// Reads a thin container or every supported slice of a universal one.
pub fn read_container(data: &[u8]) -> Result<(Vec<Architecture>, Option<Vec<FatSlice>>), OpenError> {
    let slices = match FileKind::parse(data) {
        Ok(FileKind::MachOFat32) => fat_slices(data, false)?,
        Ok(FileKind::MachOFat64) => fat_slices(data, true)?,
        _ => {
            let mut arch = read_slice(data)?;
            arch.size = data.len() as u64;
            return Ok((vec![arch], None));
        }
    };
    let mut architectures = Vec::new();
    for slice in &slices {
        let start = to_offset(slice.offset)?;
        let bytes = start
            .checked_add(to_offset(slice.size)?)
            .and_then(|end| data.get(start..end))
            .ok_or_else(|| OpenError::Truncated(format!("slice at {:#x}", slice.offset)))?;
        match read_slice(bytes) {
            Ok(mut arch) => {
                arch.offset = slice.offset;
                arch.size = slice.size;
                architectures.push(arch);
            }
            // Other CPU types are carried through verbatim.
            Err(OpenError::UnsupportedSubtype(reason)) => {
                tracing::debug!(offset = slice.offset, %reason, "slice kept unmodified");
            }
            Err(err) => return Err(err),
        }
    }
    if architectures.is_empty() {
        return Err(OpenError::UnsupportedSubtype("no supported slice in universal binary".into()));
    }
    Ok((architectures, Some(slices)))
}

fn to_offset(value: u64) -> Result<usize, OpenError> {
    usize::try_from(value).map_err(|_| OpenError::Truncated(format!("offset {value:#x}")))
}

fn fat_slices(data: &[u8], wide: bool) -> Result<Vec<FatSlice>, OpenError> {
    let header = read_pod::<FatHeader>(data, 0, "universal header")?;
    let magic = header.magic.get(BigEndian);
    if magic != FAT_MAGIC && magic != FAT_MAGIC_64 {
        return Err(OpenError::MalformedHeader(format!("universal magic {magic:#x}")));
    }
    let count = header.nfat_arch.get(BigEndian) as usize;
    let table = std::mem::size_of::<FatHeader>() as u64;
    let slices = if wide {
        read_pod_slice::<FatArch64>(data, table, count, "slice entries")?
            .iter()
            .map(|a| FatSlice {
                cputype: a.cputype.get(BigEndian),
                cpusubtype: a.cpusubtype.get(BigEndian),
                offset: a.offset.get(BigEndian),
                size: a.size.get(BigEndian),
                align: a.align.get(BigEndian),
            })
            .collect()
    } else {
        read_pod_slice::<FatArch32>(data, table, count, "slice entries")?
            .iter()
            .map(|a| FatSlice {
                cputype: a.cputype.get(BigEndian),
                cpusubtype: a.cpusubtype.get(BigEndian),
                offset: u64::from(a.offset.get(BigEndian)),
                size: u64::from(a.size.get(BigEndian)),
                align: a.align.get(BigEndian),
            })
            .collect()
    };
    Ok(slices)
}

/// Reads one thin Mach-O image.
pub fn read_slice(data: &[u8]) -> Result<Architecture, OpenError> {
    let magic = read_le(data, 0, 4).ok_or_else(|| OpenError::Truncated("Mach-O magic".into()))? as u32;
    let is64 = match magic {
        MH_MAGIC_64 => true,
        MH_MAGIC => false,
        _ => return Err(OpenError::UnsupportedSubtype(format!("Mach-O magic {magic:#x}"))),
    };
    let (cputype, filetype, ncmds, sizeofcmds, header_size) = if is64 {
        let h = read_pod::<MachHeader64<LE>>(data, 0, "Mach-O header")?;
        let size = std::mem::size_of::<MachHeader64<LE>>() as u64;
        (h.cputype.get(LE), h.filetype.get(LE), h.ncmds.get(LE), h.sizeofcmds.get(LE), size)
    } else {
        let h = read_pod::<MachHeader32<LE>>(data, 0, "Mach-O header")?;
        let size = std::mem::size_of::<MachHeader32<LE>>() as u64;
        (h.cputype.get(LE), h.filetype.get(LE), h.ncmds.get(LE), h.sizeofcmds.get(LE), size)
    };
    let (isa, address_size) = match (cputype, is64) {
        (CPU_TYPE_X86_64, true) => (Isa::X64, AddressSize::U64),
        (CPU_TYPE_X86, false) => (Isa::X86, AddressSize::U32),
        (cputype, _) => return Err(OpenError::UnsupportedSubtype(format!("Mach-O CPU type {cputype:#x}"))),
    };
    if !matches!(filetype, MH_EXECUTE | MH_DYLIB | MH_BUNDLE) {
        return Err(OpenError::UnsupportedSubtype(format!("Mach-O file type {filetype}")));
    }

    let mut arch = Architecture::new(isa.name(), isa, address_size, ImageHeader::None);
    arch.segment_alignment = 0x1000;
    arch.file_alignment = 0x1000;

    let commands_end = header_size + u64::from(sizeofcmds);
    let mut slack_limit = data.len() as u64;
    // Addresses of every segment command, in load-command order, for rebase opcodes.
    let mut segment_addresses = Vec::new();
    let mut text = None;
    let mut entry_offset = None;
    let mut thread_entry = None;
    let mut rebase = None;
    let mut function_starts = None;

    let mut at = header_size;
    for _ in 0..ncmds {
        let command = read_pod::<LoadCommand<LE>>(data, at, "load command")?;
        let (cmd, cmdsize) = (command.cmd.get(LE), u64::from(command.cmdsize.get(LE)));
        if cmdsize < 8 || at + cmdsize > commands_end {
            return Err(OpenError::MalformedHeader(format!("load command at {at:#x} has size {cmdsize}")));
        }
        match cmd {
            LC_SEGMENT_64 | LC_SEGMENT => {
                if (cmd == LC_SEGMENT_64) != is64 {
                    return Err(OpenError::UnsupportedFeature("segment command of the wrong width".into()));
                }
                let info = segment_command(data, at, is64)?;
                segment_addresses.push(info.vmaddr);
                for &offset in info.section_offsets.iter().filter(|&&o| o != 0) {
                    slack_limit = slack_limit.min(offset);
                }
                if info.fileoff != 0 && info.filesize != 0 {
                    slack_limit = slack_limit.min(info.fileoff);
                }
                if info.fileoff == 0 && info.filesize != 0 && text.is_none() {
                    text = Some((info.vmaddr, info.fileoff));
                }
                // __PAGEZERO reserves address space only.
                if info.initprot == 0 && info.filesize == 0 {
                    at += cmdsize;
                    continue;
                }
                let start = to_offset(info.fileoff)?;
                let bytes = start
                    .checked_add(to_offset(info.filesize)?)
                    .and_then(|end| data.get(start..end))
                    .ok_or_else(|| OpenError::Truncated(format!("segment {} data", info.name)))?;
                let mut segment = Segment::new(
                    info.name,
                    info.vmaddr,
                    info.vmsize.max(info.filesize),
                    info.fileoff,
                    bytes.to_vec(),
                    protection(info.initprot),
                );
                segment.header_index = Some(segment_addresses.len() - 1);
                arch.segments.push(segment);
            }
            LC_MAIN => {
                let entryoff = read_pod::<U64<LE>>(data, at + 8, "entry point")?.get(LE);
                entry_offset = Some(entryoff);
            }
            LC_UNIXTHREAD => {
                thread_entry = Some(if is64 {
                    read_pod::<U64<LE>>(data, at + 144, "thread state")?.get(LE)
                } else {
                    u64::from(read_pod::<U32<LE>>(data, at + 56, "thread state")?.get(LE))
                });
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                let info = read_pod::<DyldInfoCommand<LE>>(data, at, "dyld info")?;
                rebase = Some((u64::from(info.rebase_off.get(LE)), u64::from(info.rebase_size.get(LE))));
            }
            LC_FUNCTION_STARTS => {
                let info = read_pod::<LinkeditDataCommand<LE>>(data, at, "function starts")?;
                function_starts = Some((u64::from(info.dataoff.get(LE)), u64::from(info.datasize.get(LE))));
            }
            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                let info = read_pod::<EncryptionInfoCommand32<LE>>(data, at, "encryption info")?;
                if info.cryptid.get(LE) != 0 {
                    return Err(OpenError::UnsupportedFeature("encrypted image".into()));
                }
            }
            LC_DYLD_CHAINED_FIXUPS => {
                tracing::warn!("chained fixups are not tracked");
            }
            _ => {}
        }
        at += cmdsize;
    }
    if arch.segments.is_empty() {
        return Err(OpenError::MalformedHeader("no mapped segments".into()));
    }

    arch.image_base = match text {
        Some((vmaddr, _)) => vmaddr,
        None => arch.segments.iter().map(|s| s.address).min().unwrap_or(0),
    };
    arch.entry_point = match (entry_offset, text) {
        (Some(entryoff), Some((vmaddr, fileoff))) => vmaddr + entryoff - fileoff,
        _ => thread_entry.unwrap_or(0),
    };
    arch.size = data.len() as u64;
    arch.header = ImageHeader::MachO(MachOHeader {
        is64,
        ncmds,
        sizeofcmds,
        commands_end,
        slack_limit,
    });

    read_symbols(&mut arch, data)?;
    read_unwind_info(&mut arch, data)?;
    if arch.entry_point != 0 && arch.function_by_address(arch.entry_point).is_none() {
        arch.add_function("entry", arch.entry_point, None);
    }
    if let Some((offset, size)) = function_starts {
        read_function_starts(&mut arch, data, offset, size);
    }
    if let Some((offset, size)) = rebase {
        read_rebases(&mut arch, data, offset, size, &segment_addresses);
    }
    Ok(arch)
}

fn linkedit(data: &[u8], offset: u64, size: u64) -> &[u8] {
    let start = (offset as usize).min(data.len());
    let end = (offset.saturating_add(size) as usize).min(data.len());
    &data[start..end]
}

/// Adds a function for every entry of `LC_FUNCTION_STARTS` not already known.
fn read_function_starts(arch: &mut Architecture, data: &[u8], offset: u64, size: u64) {
    let stream = linkedit(data, offset, size);
    let mut address = arch.image_base;
    let mut at = 0;
    while let Some(delta) = uleb128(stream, &mut at) {
        if delta == 0 {
            break;
        }
        address += delta;
        if arch.is_executable(address) && arch.function_by_address(address).is_none() {
            arch.add_function(format!("sub_{address:x}"), address, None);
        }
    }
}

/// Expands the rebase opcode stream into relocations.
fn read_rebases(arch: &mut Architecture, data: &[u8], offset: u64, size: u64, segments: &[u64]) {
    let stream = linkedit(data, offset, size);
    let word = arch.address_size.bytes();
    let mut address = 0u64;
    let mut slots = Vec::new();
    let mut at = 0;
    while let Some(&byte) = stream.get(at) {
        at += 1;
        let immediate = byte & REBASE_IMMEDIATE_MASK;
        match byte & REBASE_OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => {}
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                let Some(base) = segments.get(usize::from(immediate)) else {
                    break;
                };
                let Some(offset) = uleb128(stream, &mut at) else {
                    break;
                };
                address = base + offset;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => match uleb128(stream, &mut at) {
                Some(delta) => address = address.wrapping_add(delta),
                None => break,
            },
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => address += u64::from(immediate) * word,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..immediate {
                    slots.push(address);
                    address += word;
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let Some(count) = uleb128(stream, &mut at) else {
                    break;
                };
                for _ in 0..count {
                    slots.push(address);
                    address += word;
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                slots.push(address);
                match uleb128(stream, &mut at) {
                    Some(delta) => address = address.wrapping_add(delta + word),
                    None => break,
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let (Some(count), Some(skip)) = (uleb128(stream, &mut at), uleb128(stream, &mut at)) else {
                    break;
                };
                for _ in 0..count {
                    slots.push(address);
                    address = address.wrapping_add(skip + word);
                }
            }
            opcode => {
                tracing::debug!(opcode, "unknown rebase opcode");
                break;
            }
        }
    }
    let size = arch.address_size.operand_size();
    for address in slots {
        let target = arch.read_word(address);
        arch.relocations.push(Relocation {
            address,
            size,
            target,
            entry: RelocationEntry::MachORebase,
            deleted: false,
        });
    }
}

pub fn check(arch: &Architecture, header: &MachOHeader) -> Result<(), WriteError> {
    if arch.vm_segment.is_none() {
        return Ok(());
    }
    let needed = header.segment_command_size();
    let available = header.slack_limit.saturating_sub(header.commands_end);
    if needed > available {
        return Err(WriteError::NoHeaderRoom { needed, available });
    }
    Ok(())
}

/// Writes one thin image.
pub fn write_slice(original: &[u8], arch: &Architecture, header: &MachOHeader) -> Result<Vec<u8>, WriteError> {
    let mut image = original.to_vec();
    write_segments(&mut image, &arch.segments)?;
    let Some(segment) = arch.vm_segment.and_then(|id| arch.segment(id)) else {
        return Ok(image);
    };
    let filesize = align_up(segment.data.len() as u64, arch.file_alignment);
    let end = to_usize(segment.offset + filesize)?;
    if image.len() < end {
        image.resize(end, 0);
    }
    let vmsize = align_up(segment.size, arch.segment_alignment);
    let prot = if segment.flags.contains(SegmentFlags::EXECUTE) {
        VM_PROT_READ | VM_PROT_EXECUTE
    } else {
        VM_PROT_READ
    };
    let cmdsize = header.segment_command_size();
    if header.is64 {
        put_pod(
            &mut image,
            header.commands_end,
            &SegmentCommand64 {
                cmd: U32::new(LE, LC_SEGMENT_64),
                cmdsize: U32::new(LE, cmdsize as u32),
                segname: name_field::<16>(&segment.name),
                vmaddr: U64::new(LE, segment.address),
                vmsize: U64::new(LE, vmsize),
                fileoff: U64::new(LE, segment.offset),
                filesize: U64::new(LE, filesize),
                maxprot: U32::new(LE, prot),
                initprot: U32::new(LE, prot),
                nsects: U32::new(LE, 0),
                flags: U32::new(LE, 0),
            },
        )?;
        edit_pod::<MachHeader64<LE>>(&mut image, 0, |h| {
            h.ncmds = U32::new(LE, header.ncmds + 1);
            h.sizeofcmds = U32::new(LE, header.sizeofcmds + cmdsize as u32);
        })?;
    } else {
        put_pod(
            &mut image,
            header.commands_end,
            &SegmentCommand32 {
                cmd: U32::new(LE, LC_SEGMENT),
                cmdsize: U32::new(LE, cmdsize as u32),
                segname: name_field::<16>(&segment.name),
                vmaddr: U32::new(LE, segment.address as u32),
                vmsize: U32::new(LE, vmsize as u32),
                fileoff: U32::new(LE, segment.offset as u32),
                filesize: U32::new(LE, filesize as u32),
                maxprot: U32::new(LE, prot),
                initprot: U32::new(LE, prot),
                nsects: U32::new(LE, 0),
                flags: U32::new(LE, 0),
            },
        )?;
        edit_pod::<MachHeader32<LE>>(&mut image, 0, |h| {
            h.ncmds = U32::new(LE, header.ncmds + 1);
            h.sizeofcmds = U32::new(LE, header.sizeofcmds + cmdsize as u32);
        })?;
    }
    tracing::debug!(segment = %segment.name, "segment command inserted");
    Ok(image)
}

fn slice_image(file: &File, arch: &Architecture) -> Result<Vec<u8>, WriteError> {
    let ImageHeader::MachO(header) = &arch.header else {
        return Err(WriteError::Layout("Mach-O image without its header".into()));
    };
    let start = to_usize(arch.offset)?;
    let end = to_usize(arch.offset + arch.size)?;
    let original = file
        .data
        .get(start..end)
        .ok_or_else(|| WriteError::Layout(format!("slice at {start:#x} is out of bounds")))?;
    write_slice(original, arch, header)
}

/// Produces the output container, rebuilding the slice table of universal files.
pub fn write_container(file: &File) -> Result<Vec<u8>, WriteError> {
    let Some(slices) = &file.fat else {
        let arch = file
            .architectures
            .first()
            .ok_or_else(|| WriteError::Layout("no architecture".into()))?;
        return slice_image(file, arch);
    };

    let wide = FileKind::parse(&*file.data).is_ok_and(|kind| kind == FileKind::MachOFat64);
    let entry_size = if wide {
        std::mem::size_of::<FatArch64>()
    } else {
        std::mem::size_of::<FatArch32>()
    };
    let table = std::mem::size_of::<FatHeader>();
    let mut out = file.data[..table + entry_size * slices.len()].to_vec();
    for (i, slice) in slices.iter().enumerate() {
        let bytes = match file.architectures.iter().find(|a| a.offset == slice.offset) {
            Some(arch) => slice_image(file, arch)?,
            None => {
                let start = to_usize(slice.offset)?;
                file.data[start..start + to_usize(slice.size)?].to_vec()
            }
        };
        // Slices keep their offset while they still fit.
        let offset = slice.offset.max(align_up(out.len() as u64, 1u64 << slice.align.min(31)));
        let size = bytes.len() as u64;
        out.resize(to_usize(offset)?, 0);
        out.extend_from_slice(&bytes);

        let entry = (table + entry_size * i) as u64;
        if wide {
            edit_pod::<FatArch64>(&mut out, entry, |a| {
                a.offset = U64::new(BigEndian, offset);
                a.size = U64::new(BigEndian, size);
            })?;
        } else {
            let (Ok(offset32), Ok(size32)) = (u32::try_from(offset), u32::try_from(size)) else {
                return Err(WriteError::AddressSpace {
                    end: u128::from(offset + size),
                });
            };
            edit_pod::<FatArch32>(&mut out, entry, |a| {
                a.offset = U32::new(BigEndian, offset32);
                a.size = U32::new(BigEndian, size32);
            })?;
        }
    }
    Ok(out)
}
