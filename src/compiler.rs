//! Protection pipeline.
//!
//! The `Compiler` drives one input file through every stage:
//! 1. Selection: marks the functions named by the directives.
//! 2. Decoding: builds a command list for every function, in parallel.
//! 3. Virtualization: lowers the selected functions, in parallel, then merges the
//!    results into the image one at a time.
//! 4. Layout: appends the VM segment.
//! 5. Resolution: patches every fixup against final addresses.
//! 6. Output: serializes the container and replaces the output file atomically.
//!
//! Per-function failures are logged and leave the function unmodified. Anything
//! else unwinds the whole run before a byte of output is written.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::disasm::{self, CommandList};
use crate::error::{CompileError, DecodeError, VirtualizeError, WriteError};
use crate::format;
use crate::layout;
use crate::log::Log;
use crate::model::{Architecture, CompilationType, File, Function, FunctionId, ProgramId};
use crate::resolver;
use crate::vm::compiler::{self as vmc, Virtualized};
use crate::vm::lower::ImageFacts;
use crate::vm::profile::VmProfile;
use crate::watermark::Signer;
use crate::writer;

/// Picks functions by name or by entry address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Name(String),
    Address(u64),
}

impl FromStr for Selector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty function selector".into());
        }
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16)
                .map(Selector::Address)
                .map_err(|e| format!("invalid address `{s}`: {e}")),
            None => Ok(Selector::Name(s.to_owned())),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Name(name) => f.write_str(name),
            Selector::Address(address) => write!(f, "{address:#x}"),
        }
    }
}

impl Selector {
    fn matches(&self, function: &Function) -> bool {
        match self {
            Selector::Name(name) => {
                function.name == *name
                    || function.display_name == *name
                    || function.name.strip_prefix('_') == Some(name.as_str())
            }
            Selector::Address(address) => function.address == *address,
        }
    }
}

/// A virtualization request for the functions a selector picks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub selector: Selector,
}

impl Directive {
    pub fn virtualize(selector: Selector) -> Self {
        Self { selector }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Name of the appended VM segment.
    pub section_name: String,
    /// Payload signed into the VM segment.
    pub watermark: Option<String>,
    pub directives: Vec<Directive>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            section_name: ".uvm0".into(),
            watermark: None,
            directives: Vec::new(),
        }
    }
}

/// Overall outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// A selected function could not be decoded.
    DecodeError,
    /// A selected function fell back because lowering could not preserve its semantics.
    Fallback,
}

impl Status {
    /// Process exit code. Hard failures exit with 1 and never produce a status.
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::DecodeError => 2,
            Status::Fallback => 3,
        }
    }
}

/// Counters collected over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub selected: usize,
    pub virtualized: usize,
    pub decode_failures: usize,
    /// Lowering failures.
    pub fallbacks: usize,
    /// Eligibility rejections.
    pub rejected: usize,
    pub fixups: usize,
}

impl Summary {
    pub fn status(&self) -> Status {
        if self.decode_failures > 0 {
            Status::DecodeError
        } else if self.fallbacks > 0 {
            Status::Fallback
        } else {
            Status::Success
        }
    }
}

/// User-level abort. Raising it stops scheduling new functions; work in flight
/// finishes and the run returns [`CompileError::Aborted`].
#[derive(Debug, Default)]
pub struct AbortFlag(AtomicBool);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Compiler<'a> {
    options: CompileOptions,
    profile: VmProfile,
    log: &'a dyn Log,
    abort: &'a AbortFlag,
    signer: &'a dyn Signer,
    summary: Summary,
}

impl<'a> Compiler<'a> {
    pub fn new(
        options: CompileOptions,
        profile: VmProfile,
        log: &'a dyn Log,
        abort: &'a AbortFlag,
        signer: &'a dyn Signer,
    ) -> Self {
        Self {
            options,
            profile,
            log,
            abort,
            signer,
            summary: Summary::default(),
        }
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    fn checkpoint(&self) -> Result<(), CompileError> {
        if self.abort.is_raised() {
            tracing::info!("abort requested, discarding the image");
            return Err(CompileError::Aborted);
        }
        Ok(())
    }

    /// Reads `input`, protects it and writes the result to `output`.
    ///
    /// The input file is only read. On any error the output path is left as it was.
    pub fn compile(&mut self, input: &Path, output: &Path) -> Result<Summary, CompileError> {
        let mut file = format::open(input)?;
        tracing::info!(
            path = %input.display(),
            format = file.format.name(),
            images = file.architectures.len(),
            "input loaded"
        );
        let bytes = self.run(&mut file)?;
        writer::write_output(output, &bytes, Some(input))?;
        tracing::info!(path = %output.display(), "output written");
        Ok(self.summary.clone())
    }

    /// Runs every in-memory stage and returns the serialized container.
    pub fn run(&mut self, file: &mut File) -> Result<Vec<u8>, CompileError> {
        self.select(file);
        self.checkpoint()?;
        self.decode(file)?;
        self.checkpoint()?;
        self.virtualize(file)?;
        self.checkpoint()?;
        self.layout(file)?;
        self.resolve(file)?;
        self.checkpoint()?;
        self.serialize(file)
    }

    /// Marks the functions picked by each directive.
    ///
    /// An address that no known function starts at becomes a new function when it
    /// lies in executable memory.
    pub fn select(&mut self, file: &mut File) {
        let directives = &self.options.directives;
        let mut matched = vec![false; directives.len()];
        for arch in &mut file.architectures {
            for (directive, hit) in directives.iter().zip(&mut matched) {
                let mut ids: Vec<FunctionId> = arch
                    .functions
                    .iter()
                    .filter(|f| directive.selector.matches(f))
                    .map(|f| f.id)
                    .collect();
                if let (true, Selector::Address(address)) = (ids.is_empty(), &directive.selector) {
                    if arch.is_executable(*address) {
                        ids.push(arch.add_function(format!("sub_{address:x}"), *address, None));
                    }
                }
                *hit |= !ids.is_empty();
                for id in ids {
                    let function = &mut arch.functions[id.index()];
                    if !function.need_compile {
                        self.summary.selected += 1;
                    }
                    function.need_compile = true;
                }
            }
        }
        for (directive, _) in directives.iter().zip(&matched).filter(|(_, m)| !**m) {
            self.log
                .warning(None, &format!("no function matches `{}`", directive.selector));
        }
        tracing::debug!(selected = self.summary.selected, "functions selected");
    }

    /// Decodes every function and links references between them.
    pub fn decode(&mut self, file: &mut File) -> Result<(), CompileError> {
        for arch in &mut file.architectures {
            let results = self.decode_architecture(arch);
            self.checkpoint()?;
            for (function, result) in arch.functions.iter_mut().zip(results) {
                match result {
                    Some(Ok(list)) => {
                        let handlers = list.has_handlers;
                        apply_commands(function, list);
                        if handlers && function.need_compile {
                            self.summary.rejected += 1;
                            self.log
                                .warning(Some(&function.display_name), "left unmodified: method has exception handlers");
                        }
                    }
                    Some(Err(err)) => {
                        function.decode_failed = true;
                        function.compilation_type = CompilationType::Unmodified;
                        function.ineligible = Some(err.to_string());
                        if function.need_compile {
                            self.summary.decode_failures += 1;
                            self.log.warning(Some(&function.display_name), &err.to_string());
                        } else {
                            tracing::debug!(function = %function.display_name, %err, "not decoded");
                        }
                    }
                    None => {}
                }
            }
            let links = disasm::link_external_references(arch);
            tracing::debug!(arch = %arch.name, links, "external references linked");
        }
        Ok(())
    }

    fn decode_architecture(&self, arch: &Architecture) -> Vec<Option<Result<CommandList, DecodeError>>> {
        let bounds = disasm::function_bounds(arch);
        let slots = disasm::relocation_slots(arch);
        let (log, abort) = (self.log, self.abort);
        log.start_progress(&format!("Decoding {}", arch.name), arch.functions.len() as u64);
        let results = arch
            .functions
            .par_iter()
            .zip(bounds.par_iter())
            .map(|(function, bounds)| {
                if abort.is_raised() || function.is_decoded() || function.decode_failed {
                    return None;
                }
                let result = disasm::decode_function(arch, function.id, *bounds, &slots);
                log.step_progress(1);
                Some(result)
            })
            .collect();
        log.end_progress();
        results
    }

    /// Virtualizes every selected function that is still unmodified.
    pub fn virtualize(&mut self, file: &mut File) -> Result<(), CompileError> {
        for arch in &mut file.architectures {
            let candidates: Vec<FunctionId> = arch
                .functions
                .iter()
                .filter(|f| f.need_compile && !f.decode_failed && f.program.is_none())
                .map(|f| f.id)
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let results = self.virtualize_architecture(arch, &candidates);
            self.checkpoint()?;
            for (id, result) in candidates.into_iter().zip(results) {
                match result {
                    Some(Ok(virtualized)) => self.accept(arch, id, virtualized)?,
                    Some(Err(err)) => self.reject(&mut arch.functions[id.index()], err),
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Lowers `candidates` in parallel. Program ids are provisional slots in the
    /// candidate list; [`Compiler::accept`] renumbers them.
    fn virtualize_architecture(
        &self,
        arch: &Architecture,
        candidates: &[FunctionId],
    ) -> Vec<Option<Result<Virtualized, VirtualizeError>>> {
        let facts = ImageFacts::new(arch);
        let (log, abort, profile) = (self.log, self.abort, &self.profile);
        log.start_progress(&format!("Virtualizing {}", arch.name), candidates.len() as u64);
        let results = candidates
            .par_iter()
            .enumerate()
            .map(|(slot, &id)| {
                if abort.is_raised() {
                    return None;
                }
                let function = &arch.functions[id.index()];
                let result = vmc::virtualize(arch, function, ProgramId::from_index(slot), &facts, profile);
                log.step_progress(1);
                Some(result)
            })
            .collect();
        log.end_progress();
        results
    }

    fn accept(&mut self, arch: &mut Architecture, id: FunctionId, mut virtualized: Virtualized) -> Result<(), CompileError> {
        let function = &arch.functions[id.index()];
        let (start, end) = (function.address, function.end);
        let overlap = arch
            .functions
            .iter()
            .find(|g| g.id != id && g.program.is_some() && g.address < end && start < g.end)
            .map(|g| g.display_name.clone());
        if let Some(other) = overlap {
            let err = VirtualizeError::PreviouslyRejected(format!("overlaps virtualized {other}"));
            self.reject(&mut arch.functions[id.index()], err);
            return Ok(());
        }

        let from = virtualized.program.id;
        let to = ProgramId::from_index(arch.vm_programs.len());
        virtualized.program.renumber(to);
        for fixup in &mut virtualized.trampoline.fixups {
            fixup.renumber_program(from, to);
        }
        merge(arch, id, virtualized)?;

        self.summary.virtualized += 1;
        let function = &arch.functions[id.index()];
        tracing::debug!(
            function = %function.display_name,
            address = format_args!("{:#x}", function.address),
            program = to.0,
            "virtualized"
        );
        Ok(())
    }

    fn reject(&mut self, function: &mut Function, err: VirtualizeError) {
        function.compilation_type = CompilationType::Unmodified;
        if let VirtualizeError::PreviouslyRejected(reason) = &err {
            if function.ineligible.is_some() {
                tracing::debug!(function = %function.display_name, %reason, "skipped");
                return;
            }
        }
        if err.is_ineligible() {
            self.summary.rejected += 1;
        } else {
            self.summary.fallbacks += 1;
        }
        let reason = err.to_string();
        self.log.warning(
            Some(&function.display_name),
            &format!("left unmodified: {reason}"),
        );
        function.ineligible = Some(reason);
    }

    /// Appends the VM segment of every image that has programs.
    pub fn layout(&mut self, file: &mut File) -> Result<(), CompileError> {
        let watermark = self
            .options
            .watermark
            .as_deref()
            .map(|payload| self.signer.sign(payload.as_bytes()));
        for arch in &mut file.architectures {
            match layout::relayout(arch, &self.options.section_name, &self.profile, watermark.as_deref())? {
                Some(plan) => tracing::info!(
                    arch = %arch.name,
                    segment = %self.options.section_name,
                    address = format_args!("{:#x}", plan.address),
                    size = plan.size,
                    programs = plan.programs.len(),
                    "VM segment appended"
                ),
                None => tracing::debug!(arch = %arch.name, "nothing virtualized"),
            }
        }
        Ok(())
    }

    /// Patches and verifies every live fixup.
    pub fn resolve(&mut self, file: &mut File) -> Result<(), CompileError> {
        for arch in &mut file.architectures {
            self.summary.fixups += resolver::resolve_all(arch)?;
            resolver::verify(arch)?;
        }
        Ok(())
    }

    pub fn serialize(&self, file: &File) -> Result<Vec<u8>, CompileError> {
        format::check_limits(file)?;
        Ok(format::serialize(file)?)
    }
}

fn apply_commands(function: &mut Function, list: CommandList) {
    function.commands = list.commands;
    function.end = list.end;
    function.unresolved = list.unresolved;
    function.max_stack = list.max_stack;
    if list.has_handlers && function.ineligible.is_none() {
        function.ineligible = Some("method has exception handlers".into());
    }
}

/// Splices a virtualized function into the image: the trampoline replaces the
/// body, fixups inside the old body are retired and load-time rebases inside it
/// are dropped.
fn merge(arch: &mut Architecture, id: FunctionId, virtualized: Virtualized) -> Result<(), WriteError> {
    let Virtualized { program, trampoline } = virtualized;
    let (start, end) = {
        let function = &arch.functions[id.index()];
        (function.address, function.end)
    };
    let retired = arch.fixups.retire_range(start, end);
    for relocation in arch.relocations.iter_mut().filter(|r| r.overlaps(start, end)) {
        relocation.deleted = true;
    }

    let edits = std::iter::once((trampoline.address, &trampoline.bytes))
        .chain(trampoline.patches.iter().map(|(address, bytes)| (*address, bytes)));
    for (address, bytes) in edits {
        if !arch.write(address, bytes) {
            return Err(WriteError::Layout(format!(
                "{} bytes at {address:#x} are not file-backed",
                bytes.len()
            )));
        }
    }
    for fixup in trampoline.fixups.into_iter().chain(program.fixups.iter().copied()) {
        arch.fixups.register(fixup);
    }

    let function = &mut arch.functions[id.index()];
    function.compilation_type = CompilationType::Virtualization;
    function.program = Some(program.id);
    tracing::trace!(retired, program = program.id.0, "merged");
    arch.vm_programs.push(program);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::log::{Event, MemoryLog, MessageKind};
    use crate::model::tests::test_arch;
    use crate::model::Isa;
    use crate::watermark::FramedSigner;

    // push rbp; mov rbp, rsp; sub rsp, 0x20; mov eax, edi; add eax, esi; leave; ret
    const F: [u8; 16] = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0x89, 0xF8, 0x01, 0xF0, 0xC9, 0xC3, 0xCC, 0xCC,
    ];
    // mov rax, rdi; jmp rax
    const G: [u8; 16] = [
        0x48, 0x89, 0xF8, 0xFF, 0xE0, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC,
    ];

    fn test_file() -> File {
        let code: Vec<u8> = F.iter().chain(&G).copied().collect();
        let mut arch = test_arch(Isa::X64, 0x400000, &code);
        arch.add_function("f", 0x401000, Some(16));
        arch.add_function("_g", 0x401010, Some(16));
        File {
            path: "test".into(),
            format: Format::Elf,
            data: Vec::new(),
            fat: None,
            architectures: vec![arch],
        }
    }

    fn options(selectors: &[&str]) -> CompileOptions {
        CompileOptions {
            directives: selectors
                .iter()
                .map(|s| Directive::virtualize(s.parse().expect("selector")))
                .collect(),
            ..CompileOptions::default()
        }
    }

    fn run_in_memory(compiler: &mut Compiler<'_>, file: &mut File) -> Result<(), CompileError> {
        compiler.select(file);
        compiler.decode(file)?;
        compiler.virtualize(file)?;
        compiler.layout(file)?;
        compiler.resolve(file)
    }

    #[test]
    fn selectors_parse_names_and_addresses() {
        assert_eq!("0x401000".parse(), Ok(Selector::Address(0x401000)));
        assert_eq!("main".parse(), Ok(Selector::Name("main".into())));
        assert!("0xzz".parse::<Selector>().is_err());
        assert!("".parse::<Selector>().is_err());
        assert_eq!(Selector::Address(0x10).to_string(), "0x10");
    }

    #[test]
    fn status_prefers_decode_errors() {
        let mut summary = Summary::default();
        assert_eq!(summary.status().code(), 0);
        summary.fallbacks = 1;
        assert_eq!(summary.status(), Status::Fallback);
        summary.decode_failures = 1;
        assert_eq!(summary.status().code(), 2);
    }

    #[test]
    fn virtualizes_selected_and_rejects_computed_jumps() {
        let (log, abort) = (MemoryLog::new(), AbortFlag::new());
        let mut compiler = Compiler::new(options(&["f", "g"]), VmProfile::new(7), &log, &abort, &FramedSigner);
        let mut file = test_file();
        run_in_memory(&mut compiler, &mut file).expect("compiles");

        let arch = &file.architectures[0];
        let f = &arch.functions[0];
        assert_eq!(f.compilation_type, CompilationType::Virtualization);
        assert_eq!(f.program, Some(ProgramId(0)));
        let g = &arch.functions[1];
        assert_eq!(g.compilation_type, CompilationType::Unmodified);
        assert!(g.ineligible.is_some());
        assert_eq!(arch.read(0x401010, 16), Some(&G[..]));

        let warned = log.events().into_iter().any(|e| {
            matches!(e, Event::Notify { kind: MessageKind::Warning, sender: Some(s), .. } if s == "_g")
        });
        assert!(warned);
        let summary = compiler.summary();
        assert_eq!((summary.selected, summary.virtualized, summary.rejected), (2, 1, 1));
        assert_eq!(summary.status(), Status::Success);
        assert_eq!(arch.vm_segment.map(|s| arch.segments[s.index()].address), Some(0x402000));
    }

    #[test]
    fn second_pass_leaves_rejected_functions_alone() {
        let (log, abort) = (MemoryLog::new(), AbortFlag::new());
        let mut compiler = Compiler::new(options(&["g"]), VmProfile::new(0), &log, &abort, &FramedSigner);
        let mut file = test_file();
        compiler.select(&mut file);
        compiler.decode(&mut file).expect("decodes");
        compiler.virtualize(&mut file).expect("first pass");
        let warnings = log.messages(MessageKind::Warning).len();
        compiler.virtualize(&mut file).expect("second pass");

        let g = &file.architectures[0].functions[1];
        assert_eq!(g.compilation_type, CompilationType::Unmodified);
        assert!(file.architectures[0].vm_programs.is_empty());
        assert_eq!(log.messages(MessageKind::Warning).len(), warnings);
        assert_eq!(compiler.summary().rejected, 1);
    }

    #[test]
    fn undecodable_selection_stays_unmodified() {
        let (log, abort) = (MemoryLog::new(), AbortFlag::new());
        let mut compiler = Compiler::new(options(&["h"]), VmProfile::new(0), &log, &abort, &FramedSigner);
        let mut arch = test_arch(Isa::X64, 0x400000, &[0x06; 16]);
        arch.add_function("h", 0x401000, Some(16));
        let mut file = File {
            path: "test".into(),
            format: Format::Elf,
            data: Vec::new(),
            fat: None,
            architectures: vec![arch],
        };
        compiler.select(&mut file);
        assert_eq!(file.architectures[0].functions[0].compilation_type, CompilationType::Unmodified);
        compiler.decode(&mut file).expect("decode stage");
        compiler.virtualize(&mut file).expect("first pass");
        compiler.virtualize(&mut file).expect("second pass");

        let h = &file.architectures[0].functions[0];
        assert!(h.decode_failed);
        assert_eq!(h.compilation_type, CompilationType::Unmodified);
        assert!(h.program.is_none());
        assert_eq!(compiler.summary().decode_failures, 1);
        assert_eq!(compiler.summary().status(), Status::DecodeError);
    }

    #[test]
    fn unmatched_selector_is_a_warning() {
        let (log, abort) = (MemoryLog::new(), AbortFlag::new());
        let mut compiler = Compiler::new(options(&["nope"]), VmProfile::new(0), &log, &abort, &FramedSigner);
        let mut file = test_file();
        compiler.select(&mut file);
        assert_eq!(log.messages(MessageKind::Warning), vec!["no function matches `nope`".to_string()]);
        assert_eq!(compiler.summary().selected, 0);
    }

    #[test]
    fn address_selector_creates_a_function() {
        let (log, abort) = (MemoryLog::new(), AbortFlag::new());
        let mut compiler = Compiler::new(options(&["0x401004"]), VmProfile::new(0), &log, &abort, &FramedSigner);
        let mut file = test_file();
        compiler.select(&mut file);
        let arch = &file.architectures[0];
        let id = arch.function_by_address(0x401004).expect("created");
        assert!(arch.functions[id.index()].need_compile);
        assert_eq!(arch.functions[id.index()].name, "sub_401004");
    }

    #[test]
    fn raised_abort_discards_the_run() {
        let (log, abort) = (MemoryLog::new(), AbortFlag::new());
        abort.raise();
        let mut compiler = Compiler::new(options(&["f"]), VmProfile::new(0), &log, &abort, &FramedSigner);
        let mut file = test_file();
        assert!(matches!(compiler.run(&mut file), Err(CompileError::Aborted)));
        assert!(file.architectures[0].vm_programs.is_empty());
    }
}
