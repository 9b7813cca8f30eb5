//! Errors raised while building, installing and decoding code objects

use thiserror::Error;

use crate::kind::{Builtin, CodeKind};

/// Errors that can occur during code operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// Table offsets in a code descriptor are out of order or out of bounds
    #[error("Malformed code descriptor: {0}")]
    MalformedDesc(String),

    /// Code object larger than the configured maximum
    #[error("Code object of {size} bytes exceeds maximum of {max}")]
    TooLarge {
        /// Requested object size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The allocator could not provide aligned code memory
    #[error("Failed to allocate {0} bytes of code memory")]
    AllocationFailed(usize),

    /// A flag word or field value does not fit its bit field
    #[error("Value {value} out of range for {field}")]
    FlagOutOfRange {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u64,
    },

    /// Translation program is truncated or contains an unknown opcode
    #[error("Invalid translation at index {index}: {reason}")]
    InvalidTranslation {
        /// Byte index where decoding failed
        index: usize,
        /// What went wrong
        reason: String,
    },

    /// A builtin body refers to something outside the embedded blob
    #[error("Builtin {0:?} is not isolate independent")]
    NotIsolateIndependent(Builtin),

    /// A builtin was supplied twice when building the embedded blob
    #[error("Builtin {0:?} supplied more than once")]
    DuplicateBuiltin(Builtin),

    /// Code of this kind never deoptimizes, so it cannot depend on objects
    #[error("{0} code cannot depend on heap objects")]
    CannotDeoptimize(CodeKind),

    /// A handle that no longer resolves was passed in
    #[error("Stale {0} handle")]
    StaleHandle(&'static str),

    /// Bytecode-level failure
    #[error(transparent)]
    Bytecode(#[from] otter_vm_bytecode::BytecodeError),
}

/// Result type for code operations
pub type Result<T> = std::result::Result<T, CodeError>;
