//! Error types.
//!
//! Each pipeline stage has its own enum. Stage errors that are fatal for the whole
//! run are wrapped by [`CompileError`]; per-function failures ([`DecodeError`],
//! [`VirtualizeError`]) are recovered from by leaving the function unmodified.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::FixupId;

/// Failure to load a container.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown file format")]
    UnknownFormat,

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported subtype: {0}")]
    UnsupportedSubtype(String),

    #[error("truncated file: {0}")]
    Truncated(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl From<object::read::Error> for OpenError {
    fn from(err: object::read::Error) -> Self {
        OpenError::MalformedHeader(err.to_string())
    }
}

/// Failure to decode a function body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid instruction at {address:#x}")]
    Invalid { address: u64 },

    #[error("instruction at {address:#x} runs past the end of the available bytes")]
    Truncated { address: u64 },

    #[error("instructions overlap at {address:#x}")]
    Overlap { address: u64 },

    #[error("{address:#x} is not backed by file data")]
    Unmapped { address: u64 },

    #[error("malformed method body at {address:#x}: {reason}")]
    MalformedBody { address: u64, reason: String },
}

/// Why a function was not virtualized.
///
/// Variants up to [`VirtualizeError::NoDispatch`] are eligibility rejections;
/// the rest are lowering failures detected after eligibility passed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VirtualizeError {
    #[error("{0}")]
    PreviouslyRejected(String),

    #[error("function was not decoded")]
    NotDecoded,

    #[error("computed control flow at {address:#x}")]
    UnresolvedControlFlow { address: u64 },

    #[error("excluded instruction `{text}` at {address:#x}")]
    Excluded { address: u64, text: String },

    #[error("body is {size} bytes, trampoline needs {required}")]
    TooSmall { size: u64, required: u64 },

    #[error("{site:#x} refers into the body at {target:#x}")]
    ExternalEntry { site: u64, target: u64 },

    #[error("stack frame of {frame} bytes exceeds the limit of {limit}")]
    StackFrame { frame: u64, limit: u64 },

    #[error("dynamic stack adjustment at {address:#x}")]
    DynamicStack { address: u64 },

    #[error("load-time rebase at {address:#x} cannot be removed")]
    Rebased { address: u64 },

    #[error("call at {address:#x} would return through a stub without unwind info")]
    UnwindCallOut { address: u64 },

    #[error("managed method has no signature")]
    NoSignature,

    #[error("no managed dispatch method for signature `{shape}`")]
    NoDispatch { shape: String },

    #[error("unsupported instruction `{text}` at {address:#x}")]
    Unsupported { address: u64, text: String },

    #[error("operand at {address:#x} cannot be lowered")]
    Operand { address: u64 },

    #[error("inconsistent evaluation stack at {address:#x}")]
    StackShape { address: u64 },

    #[error("{count} virtual registers exceed the limit of 256")]
    RegisterLimit { count: usize },

    #[error("program has {count} instructions, more than an index can address")]
    ProgramTooLarge { count: usize },
}

impl VirtualizeError {
    /// Whether this is an eligibility rejection rather than a lowering failure.
    pub fn is_ineligible(&self) -> bool {
        !matches!(
            self,
            VirtualizeError::Unsupported { .. }
                | VirtualizeError::Operand { .. }
                | VirtualizeError::StackShape { .. }
                | VirtualizeError::RegisterLimit { .. }
                | VirtualizeError::ProgramTooLarge { .. }
        )
    }
}

/// Failure to resolve a fixup after layout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{fixup}: target {target} has no address")]
    Dangling { fixup: FixupId, target: String },

    #[error("{fixup}: location {location} is not writable")]
    Location { fixup: FixupId, location: String },

    #[error("{fixup}: value {value:#x} does not fit {bytes} bytes")]
    Overflow { fixup: FixupId, value: i128, bytes: u64 },

    #[error("{fixup}: stored value {found:#x}, expected {expected:#x}")]
    Mismatch { fixup: FixupId, found: u64, expected: u64 },
}

/// Failure to lay out or serialize the output.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no room for a new header entry: need {needed} bytes, {available} available")]
    NoHeaderRoom { needed: u64, available: u64 },

    #[error("too many segments: {count} exceeds the format limit of {max}")]
    TooManySegments { count: usize, max: usize },

    #[error("segment end {end:#x} exceeds the address space")]
    AddressSpace { end: u128 },

    #[error("image layout is inconsistent: {0}")]
    Layout(String),
}

/// A failure that aborts the whole run.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("failed to assemble the interpreter: {0}")]
    Runtime(String),

    #[error("compilation aborted")]
    Aborted,
}

impl From<iced_x86::IcedError> for CompileError {
    fn from(err: iced_x86::IcedError) -> Self {
        CompileError::Runtime(err.to_string())
    }
}
