//! Virtualizing binary protector.
//!
//! This library provides the core components for the `uvm` protector.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `model`: Format-agnostic object model (images, segments, functions, fixups).
//! - `format`: PE, ELF and Mach-O readers and writers.
//! - `isa`: Instruction-set backends (x86, x86-64, CIL).
//! - `disasm`: Command-list construction.
//! - `vm`: Virtual machine: bytecode, lowering, interpreter runtime.
//! - `resolver`: Fixup table and post-layout patching.
//! - `layout`: VM segment placement.
//! - `compiler`: The protection pipeline.
//! - `writer`: Atomic output.

pub mod compiler;
pub mod config;
pub mod demangle;
pub mod disasm;
pub mod error;
pub mod format;
pub mod isa;
pub mod layout;
pub mod log;
pub mod model;
pub mod resolver;
pub mod utils;
pub mod vm;
pub mod watermark;
pub mod writer;
