//! Synthetic executables for integration tests.
//!
//! Each builder lays out the given functions back to back in one code section,
//! padding every body with `int3` up to a 16-byte boundary, and emits just enough
//! container structure for the reader to find them.

#![allow(dead_code)]

use object::elf::{
    FileHeader64, Ident, ProgramHeader64, SectionHeader64, Sym64, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64,
    ET_EXEC, EV_CURRENT, PF_R, PF_X, PT_LOAD, SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB,
    STB_GLOBAL, STT_FUNC,
};
use object::endian::{U16, U32, U64, U64Bytes};
use object::macho::{
    EntryPointCommand, Nlist64, Section64, SegmentCommand64, SymtabCommand, LC_MAIN, LC_SEGMENT_64, LC_SYMTAB,
    N_EXT, N_SECT,
};
use object::pe::{ImageFileHeader, ImageSectionHeader, IMAGE_FILE_MACHINE_AMD64};
use object::pod::{bytes_of, Pod};
use object::LittleEndian as LE;

use uvm::compiler::{AbortFlag, CompileOptions, Compiler, Directive, Summary};
use uvm::error::CompileError;
use uvm::format;
use uvm::log::MemoryLog;
use uvm::model::File;
use uvm::vm::profile::VmProfile;
use uvm::watermark::FramedSigner;

pub const ELF_BASE: u64 = 0x40_0000;
pub const ELF_TEXT: u64 = 0x40_1000;
pub const PE_BASE: u64 = 0x1_4000_0000;
pub const MACHO_BASE: u64 = 0x1_0000_0000;

const INT3: u8 = 0xCC;

// Function bodies (x86-64, System V arguments in rdi/rsi).

/// `push rbp; mov rbp, rsp; mov eax, edi; add eax, esi; pop rbp; ret`: six
/// instructions, no branches.
pub const ADD: &[u8] = &[0x55, 0x48, 0x89, 0xE5, 0x89, 0xF8, 0x01, 0xF0, 0x5D, 0xC3];

/// `push rbp; mov rbp, rsp; sub rsp, 0x20; mov eax, edi; add eax, esi; leave; ret`
pub const FRAME: &[u8] = &[0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0x89, 0xF8, 0x01, 0xF0, 0xC9, 0xC3];

/// `mov rax, rdi; jmp rax`
pub const JUMP_REG: &[u8] = &[0x48, 0x89, 0xF8, 0xFF, 0xE0];

/// Sum of `1..=n`: `xor eax, eax; test edi, edi; je done; add eax, edi; dec edi; jne loop; ret`
pub const SUM: &[u8] = &[0x31, 0xC0, 0x85, 0xFF, 0x74, 0x06, 0x01, 0xF8, 0xFF, 0xCF, 0x75, 0xFA, 0xC3];

/// `lea eax, [rdi + rdi]; ret`
pub const DOUBLE: &[u8] = &[0x8D, 0x04, 0x3F, 0xC3];

/// `mov eax, edi; bswap eax; ret`: decodes, but has no lowering.
pub const BSWAP: &[u8] = &[0x89, 0xF8, 0x0F, 0xC8, 0xC3];

/// `push rbx; mov ebx, edi; call <target>; add eax, ebx; pop rbx; ret`, placed at `at`.
pub fn call_out(at: u64, target: u64) -> Vec<u8> {
    let rel = (target as i64 - (at as i64 + 8)) as i32;
    let mut code = vec![0x53, 0x89, 0xFB, 0xE8];
    code.extend_from_slice(&rel.to_le_bytes());
    code.extend_from_slice(&[0x01, 0xD8, 0x5B, 0xC3]);
    code
}

/// `max(a, b)` for signed ints: `mov eax, edi; cmp edi, esi; jge done; mov eax, esi; done: ret`
pub const MAX: &[u8] = &[0x89, 0xF8, 0x39, 0xF7, 0x7D, 0x02, 0x89, 0xF0, 0xC3];

/// Process entry placed at `at`: calls `target(a, b)` and exits with its result
/// through the `exit` system call.
pub fn start(at: u64, target: u64, a: u32, b: u32) -> Vec<u8> {
    let mut code = vec![0xBF];
    code.extend_from_slice(&a.to_le_bytes());
    code.push(0xBE);
    code.extend_from_slice(&b.to_le_bytes());
    code.push(0xE8);
    let rel = (target as i64 - (at as i64 + 15)) as i32;
    code.extend_from_slice(&rel.to_le_bytes());
    // mov edi, eax; mov eax, 60; syscall
    code.extend_from_slice(&[0x89, 0xC7, 0xB8, 0x3C, 0x00, 0x00, 0x00, 0x0F, 0x05]);
    code
}

fn padded_len(code: &[u8]) -> usize {
    (code.len() + 15) & !15
}

/// Addresses each function lands at when code starts at `text`.
pub fn addresses(functions: &[(&str, &[u8])], text: u64) -> Vec<u64> {
    let mut at = text;
    functions
        .iter()
        .map(|(_, code)| {
            let address = at;
            at += padded_len(code) as u64;
            address
        })
        .collect()
}

/// Concatenated, padded code plus `(name, address, size)` for each function.
fn place(functions: &[(&str, &[u8])], text: u64) -> (Vec<u8>, Vec<(String, u64, u64)>) {
    let mut code = Vec::new();
    let mut symbols = Vec::new();
    for ((name, body), address) in functions.iter().zip(addresses(functions, text)) {
        let len = padded_len(body);
        code.extend_from_slice(body);
        code.resize(code.len() + len - body.len(), INT3);
        symbols.push((name.to_string(), address, len as u64));
    }
    (code, symbols)
}

fn put<T: Pod>(image: &mut Vec<u8>, offset: usize, value: &T) {
    let bytes = bytes_of(value);
    if image.len() < offset + bytes.len() {
        image.resize(offset + bytes.len(), 0);
    }
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn put_u16(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(image: &mut [u8], offset: usize, value: u64) {
    image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

fn string_table(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut table = vec![0u8];
    let offsets = names
        .iter()
        .map(|name| {
            let offset = table.len() as u32;
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            offset
        })
        .collect();
    (table, offsets)
}

fn section64(
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: usize,
    size: usize,
    link: u32,
    entsize: u64,
) -> SectionHeader64<LE> {
    SectionHeader64 {
        sh_name: U32::new(LE, name),
        sh_type: U32::new(LE, sh_type),
        sh_flags: U64::new(LE, flags),
        sh_addr: U64::new(LE, addr),
        sh_offset: U64::new(LE, offset as u64),
        sh_size: U64::new(LE, size as u64),
        sh_link: U32::new(LE, link),
        sh_info: U32::new(LE, if sh_type == SHT_SYMTAB { 1 } else { 0 }),
        sh_addralign: U64::new(LE, if entsize > 0 { 8 } else { 1 }),
        sh_entsize: U64::new(LE, entsize),
    }
}

/// An x86-64 `ET_EXEC` with one `PT_LOAD` covering the whole file and a `.symtab`
/// carrying a sized `STT_FUNC` symbol per function. Code starts at [`ELF_TEXT`].
pub fn elf64(functions: &[(&str, &[u8])]) -> Vec<u8> {
    let (code, symbols) = place(functions, ELF_TEXT);
    let text_offset = (ELF_TEXT - ELF_BASE) as usize;
    let mut image = vec![0u8; text_offset];
    image.extend_from_slice(&code);

    let names: Vec<&str> = symbols.iter().map(|(n, _, _)| n.as_str()).collect();
    let (strtab, name_offsets) = string_table(&names);
    let symtab_offset = align(image.len(), 8);
    // Entry 0 is the null symbol.
    image.resize(symtab_offset + 24, 0);
    for (i, ((_, address, size), name)) in symbols.iter().zip(&name_offsets).enumerate() {
        let sym = Sym64 {
            st_name: U32::new(LE, *name),
            st_info: (STB_GLOBAL << 4) | STT_FUNC,
            st_other: 0,
            st_shndx: U16::new(LE, 1),
            st_value: U64::new(LE, *address),
            st_size: U64::new(LE, *size),
        };
        put(&mut image, symtab_offset + (i + 1) * 24, &sym);
    }
    let symtab_size = (symbols.len() + 1) * 24;
    let strtab_offset = image.len();
    image.extend_from_slice(&strtab);
    let (shstrtab, sh_names) = string_table(&[".text", ".symtab", ".strtab", ".shstrtab"]);
    let shstrtab_offset = image.len();
    image.extend_from_slice(&shstrtab);

    let shoff = align(image.len(), 8);
    let sections = [
        section64(sh_names[0], SHT_PROGBITS, u64::from(SHF_ALLOC | SHF_EXECINSTR), ELF_TEXT, text_offset, code.len(), 0, 0),
        section64(sh_names[1], SHT_SYMTAB, 0, 0, symtab_offset, symtab_size, 3, 24),
        section64(sh_names[2], SHT_STRTAB, 0, 0, strtab_offset, strtab.len(), 0, 0),
        section64(sh_names[3], SHT_STRTAB, 0, 0, shstrtab_offset, shstrtab.len(), 0, 0),
    ];
    // Section 0 is the null section.
    image.resize(shoff + 64, 0);
    for (i, section) in sections.iter().enumerate() {
        put(&mut image, shoff + (i + 1) * 64, section);
    }
    let len = image.len() as u64;

    let header = FileHeader64 {
        e_ident: Ident {
            magic: ELFMAG,
            class: ELFCLASS64,
            data: ELFDATA2LSB,
            version: EV_CURRENT,
            os_abi: 0,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(LE, ET_EXEC),
        e_machine: U16::new(LE, EM_X86_64),
        e_version: U32::new(LE, u32::from(EV_CURRENT)),
        e_entry: U64::new(LE, symbols.first().map_or(ELF_TEXT, |s| s.1)),
        e_phoff: U64::new(LE, 64),
        e_shoff: U64::new(LE, shoff as u64),
        e_flags: U32::new(LE, 0),
        e_ehsize: U16::new(LE, 64),
        e_phentsize: U16::new(LE, 56),
        e_phnum: U16::new(LE, 1),
        e_shentsize: U16::new(LE, 64),
        e_shnum: U16::new(LE, sections.len() as u16 + 1),
        e_shstrndx: U16::new(LE, 4),
    };
    put(&mut image, 0, &header);
    let load = ProgramHeader64 {
        p_type: U32::new(LE, PT_LOAD),
        p_flags: U32::new(LE, PF_R | PF_X),
        p_offset: U64::new(LE, 0),
        p_vaddr: U64::new(LE, ELF_BASE),
        p_paddr: U64::new(LE, ELF_BASE),
        p_filesz: U64::new(LE, len),
        p_memsz: U64::new(LE, len),
        p_align: U64::new(LE, 0x1000),
    };
    put(&mut image, 64, &load);
    image
}

/// A PE32+ AMD64 image with `.text` at RVA 0x1000 and a `.pdata` table giving every
/// function its size. `headers` is `SizeOfHeaders`; the first section's data
/// starts at 0x400 regardless.
pub fn pe64(functions: &[(&str, &[u8])], headers: u32) -> Vec<u8> {
    let (code, symbols) = place(functions, PE_BASE + 0x1000);
    let file_alignment = 0x200usize;
    let text_raw = align(code.len(), file_alignment);
    let pdata_len = symbols.len() * 12;
    let pdata_raw = align(pdata_len.max(1), file_alignment);
    let text_offset = 0x400usize;
    let pdata_offset = text_offset + text_raw;
    let mut image = vec![0u8; pdata_offset + pdata_raw];

    image[0] = b'M';
    image[1] = b'Z';
    put_u32(&mut image, 0x3c, 0x80);
    image[0x80..0x84].copy_from_slice(b"PE\0\0");
    let file_header = ImageFileHeader {
        machine: U16::new(LE, IMAGE_FILE_MACHINE_AMD64),
        number_of_sections: U16::new(LE, 2),
        time_date_stamp: U32::new(LE, 0x5EED),
        pointer_to_symbol_table: U32::new(LE, 0),
        number_of_symbols: U32::new(LE, 0),
        size_of_optional_header: U16::new(LE, 240),
        characteristics: U16::new(LE, 0x22),
    };
    put(&mut image, 0x84, &file_header);

    let opt = 0x98;
    put_u16(&mut image, opt, 0x20b);
    put_u32(&mut image, opt + 4, text_raw as u32);
    put_u32(&mut image, opt + 16, symbols.first().map_or(0x1000, |s| (s.1 - PE_BASE) as u32));
    put_u32(&mut image, opt + 20, 0x1000);
    put_u64(&mut image, opt + 24, PE_BASE);
    put_u32(&mut image, opt + 32, 0x1000);
    put_u32(&mut image, opt + 36, file_alignment as u32);
    put_u16(&mut image, opt + 40, 6);
    put_u16(&mut image, opt + 48, 6);
    put_u32(&mut image, opt + 56, 0x3000);
    put_u32(&mut image, opt + 60, headers);
    put_u16(&mut image, opt + 68, 3);
    put_u32(&mut image, opt + 108, 16);
    // Exception directory.
    let directories = opt + 112;
    put_u32(&mut image, directories + 3 * 8, 0x2000);
    put_u32(&mut image, directories + 3 * 8 + 4, pdata_len as u32);

    let section_table = opt + 240;
    let section = |name: &[u8], rva: u32, size: usize, raw: usize, offset: usize, characteristics: u32| {
        let mut field = [0u8; 8];
        field[..name.len()].copy_from_slice(name);
        ImageSectionHeader {
            name: field,
            virtual_size: U32::new(LE, size as u32),
            virtual_address: U32::new(LE, rva),
            size_of_raw_data: U32::new(LE, raw as u32),
            pointer_to_raw_data: U32::new(LE, offset as u32),
            pointer_to_relocations: U32::new(LE, 0),
            pointer_to_linenumbers: U32::new(LE, 0),
            number_of_relocations: U16::new(LE, 0),
            number_of_linenumbers: U16::new(LE, 0),
            characteristics: U32::new(LE, characteristics),
        }
    };
    put(&mut image, section_table, &section(b".text", 0x1000, code.len(), text_raw, text_offset, 0x6000_0020));
    put(&mut image, section_table + 40, &section(b".pdata", 0x2000, pdata_len, pdata_raw, pdata_offset, 0x4000_0040));

    image[text_offset..text_offset + code.len()].copy_from_slice(&code);
    for (i, (_, address, size)) in symbols.iter().enumerate() {
        let begin = (address - PE_BASE) as u32;
        put_u32(&mut image, pdata_offset + i * 12, begin);
        put_u32(&mut image, pdata_offset + i * 12 + 4, begin + *size as u32);
    }
    image
}

/// A thin x86-64 `MH_EXECUTE`: `__PAGEZERO`, a `__TEXT` segment mapping the
/// first 0x2000 bytes with `__text` at file offset 0x1000, `LC_SYMTAB` and `LC_MAIN`.
pub fn macho64(functions: &[(&str, &[u8])]) -> Vec<u8> {
    let text = MACHO_BASE + 0x1000;
    let (code, symbols) = place(functions, text);
    let mut image = vec![0u8; 0x2000];

    let segment = |name: &[u8], vmaddr: u64, vmsize: u64, filesize: u64, prot: u32, nsects: u32| {
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name);
        SegmentCommand64 {
            cmd: U32::new(LE, LC_SEGMENT_64),
            cmdsize: U32::new(LE, 72 + 80 * nsects),
            segname,
            vmaddr: U64::new(LE, vmaddr),
            vmsize: U64::new(LE, vmsize),
            fileoff: U64::new(LE, 0),
            filesize: U64::new(LE, filesize),
            maxprot: U32::new(LE, prot),
            initprot: U32::new(LE, prot),
            nsects: U32::new(LE, nsects),
            flags: U32::new(LE, 0),
        }
    };
    let mut at = 32;
    put(&mut image, at, &segment(b"__PAGEZERO", 0, MACHO_BASE, 0, 0, 0));
    at += 72;
    put(&mut image, at, &segment(b"__TEXT", MACHO_BASE, 0x2000, 0x2000, 5, 1));
    at += 72;
    let mut sectname = [0u8; 16];
    sectname[..6].copy_from_slice(b"__text");
    let mut segname = [0u8; 16];
    segname[..6].copy_from_slice(b"__TEXT");
    let section = Section64 {
        sectname,
        segname,
        addr: U64::new(LE, text),
        size: U64::new(LE, code.len() as u64),
        offset: U32::new(LE, 0x1000),
        align: U32::new(LE, 4),
        reloff: U32::new(LE, 0),
        nreloc: U32::new(LE, 0),
        flags: U32::new(LE, 0x8000_0400),
        reserved1: U32::new(LE, 0),
        reserved2: U32::new(LE, 0),
        reserved3: U32::new(LE, 0),
    };
    put(&mut image, at, &section);
    at += 80;

    let names: Vec<String> = symbols.iter().map(|(n, _, _)| format!("_{n}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let (strtab, name_offsets) = string_table(&names);
    let symoff = 0x1800usize;
    let stroff = symoff + symbols.len() * 16;
    let symtab = SymtabCommand {
        cmd: U32::new(LE, LC_SYMTAB),
        cmdsize: U32::new(LE, 24),
        symoff: U32::new(LE, symoff as u32),
        nsyms: U32::new(LE, symbols.len() as u32),
        stroff: U32::new(LE, stroff as u32),
        strsize: U32::new(LE, strtab.len() as u32),
    };
    put(&mut image, at, &symtab);
    at += 24;
    let main = EntryPointCommand {
        cmd: U32::new(LE, LC_MAIN),
        cmdsize: U32::new(LE, 24),
        entryoff: U64::new(LE, 0x1000),
        stacksize: U64::new(LE, 0),
    };
    put(&mut image, at, &main);
    at += 24;

    put_u32(&mut image, 0, 0xFEED_FACF);
    put_u32(&mut image, 4, 0x0100_0007);
    put_u32(&mut image, 8, 3);
    put_u32(&mut image, 12, 2);
    put_u32(&mut image, 16, 4);
    put_u32(&mut image, 20, (at - 32) as u32);

    image[0x1000..0x1000 + code.len()].copy_from_slice(&code);
    for (i, ((_, address, _), name)) in symbols.iter().zip(&name_offsets).enumerate() {
        let nlist = Nlist64 {
            n_strx: U32::new(LE, *name),
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            n_desc: U16::new(LE, 0),
            n_value: U64Bytes::new(LE, *address),
        };
        put(&mut image, symoff + i * 16, &nlist);
    }
    image[stroff..stroff + strtab.len()].copy_from_slice(&strtab);
    image
}

/// Options virtualizing every selector in `selectors`.
pub fn virtualize(selectors: &[&str]) -> CompileOptions {
    CompileOptions {
        directives: selectors
            .iter()
            .map(|s| Directive::virtualize(s.parse().expect("selector")))
            .collect(),
        ..CompileOptions::default()
    }
}

/// Runs the whole in-memory pipeline over `bytes`.
pub fn protect(bytes: Vec<u8>, options: CompileOptions, seed: u64) -> (Result<Vec<u8>, CompileError>, File, Summary, MemoryLog) {
    let mut file = format::parse("input".into(), bytes).expect("parses");
    let log = MemoryLog::new();
    let abort = AbortFlag::new();
    let (result, summary) = {
        let mut compiler = Compiler::new(options, VmProfile::new(seed), &log, &abort, &FramedSigner);
        let result = compiler.run(&mut file);
        (result, compiler.summary().clone())
    };
    (result, file, summary, log)
}
