//! Instruction-set abstraction.
//!
//! This module defines the `InstructionSet` trait, which encapsulates everything the
//! pipeline needs to know about one ISA: how to find a function body, how to decode a
//! single instruction into a [`Command`], and how to emit the entry trampoline that
//! replaces a virtualized body.

use std::ops::Range;

use crate::error::{DecodeError, VirtualizeError};
use crate::model::{AddressSize, Command, Fixup, Function, Isa, ProgramId};
use crate::vm::profile::VmProfile;

pub mod cil;
pub mod x86;

/// Read-only facts about the image that decoding consults.
#[derive(Debug, Clone)]
pub struct DecodeContext<'a> {
    /// Sorted addresses of load-time relocation slots.
    pub relocations: &'a [u64],
    /// Virtual address range covered by the image.
    pub image: Range<u64>,
}

impl DecodeContext<'_> {
    pub fn is_relocated(&self, address: u64) -> bool {
        self.relocations.binary_search(&address).is_ok()
    }
}

/// One decoded instruction plus the control-flow successors the builder must follow.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub command: Command,
    /// Direct branch targets (calls are not followed).
    pub targets: Vec<u64>,
}

/// Location of the instruction stream inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Body {
    pub code_start: u64,
    /// End of the stream when the format records it.
    pub code_end: Option<u64>,
    /// Exception clauses follow the body.
    pub has_handlers: bool,
    /// Evaluation-stack depth the header declares.
    pub max_stack: Option<u16>,
}

/// Bytes that replace a function's entry, plus the fixups inside them.
#[derive(Debug, Clone)]
pub struct Trampoline {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub fixups: Vec<Fixup>,
    /// Additional in-place edits (e.g. a method header's stack depth).
    pub patches: Vec<(u64, Vec<u8>)>,
}

/// A trait representing an instruction set (e.g. x86, x86-64, CIL).
pub trait InstructionSet: Sync {
    fn isa(&self) -> Isa;

    /// Locates the instruction stream of a function starting at `address`.
    ///
    /// # Arguments
    /// * `bytes` - The file-backed bytes from `address` to the end of its segment.
    /// * `address` - The function's entry address.
    fn body(&self, _bytes: &[u8], address: u64) -> Result<Body, DecodeError> {
        Ok(Body {
            code_start: address,
            code_end: None,
            has_handlers: false,
            max_stack: None,
        })
    }

    /// Decodes the instruction at the start of `bytes`.
    ///
    /// # Arguments
    /// * `bytes` - Code bytes beginning at `address`.
    /// * `address` - The virtual address of the instruction.
    /// * `ctx` - Relocation and image facts used to classify operands.
    fn decode(&self, bytes: &[u8], address: u64, ctx: &DecodeContext<'_>) -> Result<Decoded, DecodeError>;

    /// Number of bytes the entry trampoline needs.
    fn trampoline_size(&self, function: &Function) -> u64;

    /// Emits the entry trampoline that transfers control to `program`.
    fn trampoline(
        &self,
        function: &Function,
        program: ProgramId,
        profile: &VmProfile,
    ) -> Result<Trampoline, VirtualizeError>;
}

/// The backend for an instruction set.
pub fn backend(isa: Isa, address_size: AddressSize) -> &'static dyn InstructionSet {
    match (isa, address_size) {
        (Isa::X86, _) => &x86::X86_32,
        (Isa::X64, _) => &x86::X86_64,
        (Isa::Cil, AddressSize::U32) => &cil::CIL_32,
        (Isa::Cil, AddressSize::U64) => &cil::CIL_64,
    }
}
