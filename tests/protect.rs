//! End-to-end protection of synthetic executables.

mod common;

use common::*;
use uvm::compiler::{AbortFlag, CompileOptions, Compiler, Status};
use uvm::error::{CompileError, ResolveError, WriteError};
use uvm::format;
use uvm::log::{Event, MessageKind, MemoryLog};
use uvm::model::{
    Architecture, CompilationType, Fixup, FixupKind, FixupLocation, FixupTarget, OperandSize, ProgramId,
};
use uvm::resolver;
use uvm::vm::interp::{Cpu, Interpreter, SparseMemory, Trap};
use uvm::vm::profile::VmProfile;
use uvm::watermark::{self, FramedSigner, Signer};

const STACK: u64 = 0x7fff_0000;
const SEED: u64 = 0x5EED;

fn rel32(bytes: &[u8], at: usize) -> i64 {
    i64::from(i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()))
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

fn vm_entry(arch: &Architecture) -> u64 {
    let runtime = arch.vm_runtime.expect("runtime placed");
    runtime.address + runtime.entry_offset
}

/// Calls `function` of a protected image with System V integer arguments and
/// returns `eax`. Native callees are emulated by `native`.
fn call(
    arch: &Architecture,
    function: u64,
    args: &[u64],
    native: &mut dyn FnMut(u64, &mut Cpu, &mut SparseMemory) -> Result<(), Trap>,
) -> u64 {
    let mut memory = SparseMemory::from_image(arch);
    memory.map_zeroed(STACK, 0x10000);
    let mut interp = Interpreter::new(memory, OperandSize::Qword, vm_entry(arch), VmProfile::new(SEED).opcodes);
    let mut cpu = Cpu::native();
    cpu.regs[4] = STACK + 0x8000;
    for (reg, &arg) in [7usize, 6, 2, 1].iter().zip(args) {
        cpu.regs[*reg] = arg;
    }
    interp.call(&mut cpu, function, native).expect("runs");
    assert_eq!(cpu.regs[4], STACK + 0x8000, "stack is balanced");
    cpu.regs[0] & 0xffff_ffff
}

fn no_natives(pc: u64, _: &mut Cpu, _: &mut SparseMemory) -> Result<(), Trap> {
    Err(Trap::Unmapped { address: pc })
}

fn warnings_from(log: &MemoryLog, sender: &str) -> Vec<String> {
    log.events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Notify {
                kind: MessageKind::Warning,
                sender: Some(s),
                message,
            } if s == sender => Some(message),
            _ => None,
        })
        .collect()
}

#[test]
fn elf_function_becomes_a_trampoline() {
    let input = elf64(&[("f", ADD), ("sum", SUM)]);
    let (result, file, summary, _) = protect(input.clone(), virtualize(&["f"]), SEED);
    let output = result.expect("protects");
    assert_eq!(summary.status(), Status::Success);
    assert_eq!(summary.virtualized, 1);

    let arch = &file.architectures[0];
    let vm = &arch.segments[arch.vm_segment.expect("segment").index()];
    assert_eq!(vm.address, 0x40_2000);
    assert_eq!(vm.name, ".uvm0");

    // call vm_entry; program header; start index
    let at = (ELF_TEXT - ELF_BASE) as usize;
    assert_eq!(output[at], 0xE8);
    assert_eq!((ELF_TEXT as i64 + 5 + rel32(&output, at + 1)) as u64, vm_entry(arch));
    let program = (ELF_TEXT as i64 + 5 + rel32(&output, at + 5)) as u64;
    assert_eq!(Some(program), arch.vm_programs[0].header_address());
    assert!(vm.contains(program));
    assert_eq!(u32_at(&output, at + 9), 0);
    assert!(output[at + 13..at + 16].iter().all(|&b| b == 0xCC));

    // sum is untouched.
    assert_eq!(output[at + 16..at + 32], input[at + 16..at + 32]);

    // One more PT_LOAD, mapping the VM segment.
    assert_eq!(u16_at(&output, 56), 2);
    let phoff = u64_at(&output, 32) as usize;
    assert_eq!(u32_at(&output, phoff + 56), 1);
    assert_eq!(u64_at(&output, phoff + 56 + 8), vm.offset);
    assert_eq!(u64_at(&output, phoff + 56 + 16), vm.address);

    let reread = format::parse("out".into(), output).expect("output parses");
    assert!(reread.architectures[0].segment_by_address(vm.address).is_some());
}

#[test]
fn computed_jump_is_left_alone() {
    let input = elf64(&[("f", ADD), ("g", JUMP_REG)]);
    let (result, file, summary, log) = protect(input.clone(), virtualize(&["f", "g"]), SEED);
    let output = result.expect("protects");
    assert_eq!(summary.status().code(), 0);
    assert_eq!((summary.selected, summary.virtualized, summary.rejected), (2, 1, 1));

    let arch = &file.architectures[0];
    let g = arch.function_by_address(ELF_TEXT + 16).expect("g");
    assert_eq!(arch.functions[g.index()].compilation_type, CompilationType::Unmodified);
    assert_eq!(warnings_from(&log, "g").len(), 1);
    let at = (ELF_TEXT - ELF_BASE) as usize + 16;
    assert_eq!(output[at..at + 16], input[at..at + 16]);
}

#[test]
fn missing_lowering_falls_back() {
    let input = elf64(&[("u", BSWAP)]);
    let (result, file, summary, log) = protect(input.clone(), virtualize(&["u"]), SEED);
    assert_eq!(result.expect("serializes"), input);
    assert_eq!(summary.fallbacks, 1);
    assert_eq!(summary.status(), Status::Fallback);
    assert_eq!(summary.status().code(), 3);
    assert!(file.architectures[0].vm_segment.is_none());
    let warnings = warnings_from(&log, "u");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("left unmodified"));
}

#[test]
fn undecodable_selection_reports_status_two() {
    // mov eax, edi; (invalid in 64-bit mode); ret
    let input = elf64(&[("bad", &[0x89u8, 0xF8, 0x06, 0xC3][..]), ("u", BSWAP)]);
    let (result, _, summary, log) = protect(input, virtualize(&["bad", "u"]), SEED);
    assert!(result.is_ok());
    assert_eq!(summary.decode_failures, 1);
    assert_eq!(summary.fallbacks, 1);
    assert_eq!(summary.status().code(), 2);
    assert_eq!(warnings_from(&log, "bad").len(), 1);
}

#[test]
fn virtualized_code_computes_the_same_results() {
    let functions: &[(&str, &[u8])] = &[("add", ADD), ("frame", FRAME), ("sum", SUM)];
    let at = addresses(functions, ELF_TEXT);
    let (result, file, summary, _) = protect(elf64(functions), virtualize(&["add", "frame", "sum"]), SEED);
    result.expect("protects");
    assert_eq!(summary.virtualized, 3);
    let arch = &file.architectures[0];

    for (a, b) in [(2u64, 3u64), (0, 0), (0xFFFF_FFFF, 1), (1234, 0x8000_0000)] {
        let expected = (a as u32).wrapping_add(b as u32) as u64;
        assert_eq!(call(arch, at[0], &[a, b], &mut no_natives), expected);
        assert_eq!(call(arch, at[1], &[a, b], &mut no_natives), expected);
    }
    for n in [0u64, 1, 5, 100] {
        assert_eq!(call(arch, at[2], &[n], &mut no_natives), n * (n + 1) / 2);
    }
}

#[test]
fn calls_leave_and_reenter_the_vm() {
    let h = ELF_TEXT + 16;
    let c = call_out(ELF_TEXT, h);
    let (result, file, _, _) = protect(elf64(&[("c", c.as_slice()), ("h", DOUBLE)]), virtualize(&["c"]), SEED);
    result.expect("protects");
    let arch = &file.architectures[0];
    assert_eq!(arch.vm_programs[0].stubs.len(), 1);

    let mut calls = 0;
    let mut double = |pc: u64, cpu: &mut Cpu, _: &mut SparseMemory| {
        if pc != h {
            return Err(Trap::Unmapped { address: pc });
        }
        calls += 1;
        cpu.regs[0] = u64::from((cpu.regs[7] as u32).wrapping_mul(2));
        Ok(())
    };
    assert_eq!(call(arch, ELF_TEXT, &[7], &mut double), 21);
    assert_eq!(call(arch, ELF_TEXT, &[0x1000], &mut double), 0x3000);
    assert_eq!(calls, 2);
}

#[test]
fn call_out_under_unwind_info_is_left_alone() {
    let text = PE_BASE + 0x1000;
    let c = call_out(text, text + 16);
    let input = pe64(&[("entry", c.as_slice()), ("h", DOUBLE)], 0x400);
    let (result, file, summary, log) = protect(input.clone(), virtualize(&["entry"]), SEED);
    assert_eq!(result.expect("serializes"), input);

    let arch = &file.architectures[0];
    assert!(arch.has_unwind_info(text, text + 16));
    assert_eq!(arch.functions[0].compilation_type, CompilationType::Unmodified);
    assert!(arch.vm_segment.is_none());
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.status(), Status::Success);
    let warnings = warnings_from(&log, "entry");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("unwind info"), "{warnings:?}");
}

#[test]
fn pe_gets_a_new_section() {
    let input = pe64(&[("entry", FRAME), ("add", ADD)], 0x400);
    let (result, file, summary, _) = protect(input.clone(), virtualize(&["entry"]), SEED);
    let output = result.expect("protects");
    assert_eq!(summary.virtualized, 1);

    assert_eq!(u16_at(&output, 0x86), 3);
    let header = 0x188 + 80;
    assert_eq!(&output[header..header + 5], b".uvm0");
    let arch = &file.architectures[0];
    let vm = &arch.segments[arch.vm_segment.expect("segment").index()];
    assert_eq!(u64::from(u32_at(&output, header + 12)), vm.address - PE_BASE);
    assert_eq!(vm.address % 0x1000, 0);
    assert_eq!(vm.offset % 0x200, 0);
    assert_ne!(u32_at(&output, 0x98 + 64), u32_at(&input, 0x98 + 64));

    let at = 0x400;
    assert_eq!(output[at], 0xE8);
    assert_eq!(call(arch, PE_BASE + 0x1000, &[40, 2], &mut no_natives), 42);
}

#[test]
fn macho_gets_a_new_segment_command() {
    let input = macho64(&[("f", FRAME)]);
    let (result, file, summary, _) = protect(input, virtualize(&["f"]), SEED);
    let output = result.expect("protects");
    assert_eq!(summary.virtualized, 1);

    assert_eq!(u32_at(&output, 16), 5);
    let command = 32 + 72 + 152 + 24 + 24;
    assert_eq!(u32_at(&output, command), 0x19);
    assert_eq!(&output[command + 8..command + 13], b".uvm0");
    let arch = &file.architectures[0];
    let vm = &arch.segments[arch.vm_segment.expect("segment").index()];
    assert_eq!(u64_at(&output, command + 24), vm.address);
    assert!(output.len() as u64 >= vm.offset + vm.data.len() as u64);
    assert_eq!(call(arch, MACHO_BASE + 0x1000, &[5, 6], &mut no_natives), 11);
}

#[test]
fn every_fixup_holds_its_value() {
    let functions: &[(&str, &[u8])] = &[("add", ADD), ("sum", SUM)];
    let (result, file, summary, _) = protect(elf64(functions), virtualize(&["add", "sum"]), SEED);
    result.expect("protects");
    let arch = &file.architectures[0];
    assert!(summary.fixups > 0);
    assert_eq!(arch.fixups.iter().count(), summary.fixups);
    for (id, fixup) in arch.fixups.iter() {
        let (location, value) = resolver::expected_value(arch, id, fixup).expect("resolvable");
        let len = fixup.size.bytes() as usize;
        let stored = arch.read(location, len).expect("mapped");
        assert_eq!(stored, &value.to_le_bytes()[..len]);
    }
    assert!(arch
        .fixups
        .iter()
        .any(|(_, f)| f.target == FixupTarget::VmEntry && f.location == FixupLocation::Native(ELF_TEXT + 1)));
}

#[test]
fn segments_never_overlap() {
    let functions: &[(&str, &[u8])] = &[("add", ADD), ("sum", SUM), ("frame", FRAME)];
    let images = [
        (elf64(functions), ELF_TEXT),
        (pe64(functions, 0x400), PE_BASE + 0x1000),
        (macho64(functions), MACHO_BASE + 0x1000),
    ];
    for (input, text) in images {
        let selectors: Vec<String> = addresses(functions, text).iter().map(|a| format!("{a:#x}")).collect();
        let selectors: Vec<&str> = selectors.iter().map(String::as_str).collect();
        let (result, file, summary, _) = protect(input, virtualize(&selectors), SEED);
        result.expect("protects");
        assert!(summary.virtualized >= 2);

        let arch = &file.architectures[0];
        let mut segments: Vec<_> = arch.segments.iter().filter(|s| s.size > 0).collect();
        segments.sort_by_key(|s| s.address);
        for pair in segments.windows(2) {
            assert!(!pair[0].overlaps(pair[1]), "{} overlaps {}", pair[0].name, pair[1].name);
        }
        let vm = &arch.segments[arch.vm_segment.expect("segment").index()];
        for segment in arch.segments.iter().filter(|s| s.name != vm.name && s.physical_len() > 0) {
            assert!(segment.file_end() <= vm.offset, "{} runs into the VM segment", segment.name);
        }
    }
}

#[test]
fn same_seed_same_output() {
    let functions: &[(&str, &[u8])] = &[("add", ADD), ("sum", SUM)];
    let first = protect(elf64(functions), virtualize(&["add", "sum"]), SEED).0.expect("first");
    let second = protect(elf64(functions), virtualize(&["add", "sum"]), SEED).0.expect("second");
    assert_eq!(first, second);
}

#[test]
fn watermark_is_signed_into_the_segment() {
    let options = CompileOptions {
        watermark: Some("licensed to acme".into()),
        ..virtualize(&["add"])
    };
    let (result, file, _, _) = protect(elf64(&[("add", ADD)]), options, SEED);
    let output = result.expect("protects");
    let blob = FramedSigner.sign(b"licensed to acme");
    let at = output
        .windows(blob.len())
        .position(|w| w == blob.as_slice())
        .expect("watermark present");
    let arch = &file.architectures[0];
    let vm = &arch.segments[arch.vm_segment.expect("segment").index()];
    assert!(at as u64 >= vm.offset);
    assert_eq!(watermark::verify(&output[at..]), Some(&b"licensed to acme"[..]));
}

#[test]
fn dangling_fixup_fails_the_run() {
    let mut file = format::parse("in".into(), elf64(&[("add", ADD)])).expect("parses");
    file.architectures[0].fixups.register(Fixup::new(
        FixupLocation::Native(ELF_TEXT + 4),
        FixupTarget::Program(ProgramId(99)),
        FixupKind::Absolute,
        OperandSize::Dword,
        0,
    ));
    let (log, abort) = (MemoryLog::new(), AbortFlag::new());
    let mut compiler = Compiler::new(CompileOptions::default(), VmProfile::new(0), &log, &abort, &FramedSigner);
    assert!(matches!(
        compiler.run(&mut file),
        Err(CompileError::Resolve(ResolveError::Dangling { .. }))
    ));
}

#[test]
fn no_header_room_leaves_the_output_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("tight.exe");
    let output = dir.path().join("tight.protected.exe");
    std::fs::write(&input, pe64(&[("entry", FRAME)], 0x1D8)).expect("writes input");

    let (log, abort) = (MemoryLog::new(), AbortFlag::new());
    let mut compiler = Compiler::new(virtualize(&["entry"]), VmProfile::new(0), &log, &abort, &FramedSigner);
    let err = compiler.compile(&input, &output).expect_err("no room");
    assert!(matches!(
        err,
        CompileError::Write(WriteError::NoHeaderRoom { needed: 40, available: 0 })
    ));
    assert!(!output.exists());

    std::fs::write(&output, b"previous").expect("writes output");
    let mut compiler = Compiler::new(virtualize(&["entry"]), VmProfile::new(0), &log, &abort, &FramedSigner);
    assert!(compiler.compile(&input, &output).is_err());
    assert_eq!(std::fs::read(&output).expect("reads"), b"previous");
}

#[test]
fn compile_writes_the_protected_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("app");
    let output = dir.path().join("app.protected");
    let original = elf64(&[("add", ADD), ("sum", SUM)]);
    std::fs::write(&input, &original).expect("writes input");

    let (log, abort) = (MemoryLog::new(), AbortFlag::new());
    let mut compiler = Compiler::new(virtualize(&["sum"]), VmProfile::new(SEED), &log, &abort, &FramedSigner);
    let summary = compiler.compile(&input, &output).expect("compiles");
    assert_eq!(summary.virtualized, 1);
    assert_eq!(std::fs::read(&input).expect("input"), original);
    let written = std::fs::read(&output).expect("output");
    assert!(written.len() > original.len());
    assert!(log
        .events()
        .iter()
        .any(|e| matches!(e, Event::StartProgress { .. })));
}
