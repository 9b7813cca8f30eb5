//! Bytecode errors

use thiserror::Error;

/// Errors that can occur during bytecode operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    /// Invalid opcode
    #[error("Invalid opcode 0x{byte:02x} at offset {offset}")]
    InvalidOpcode {
        /// Offset of the offending byte
        offset: usize,
        /// The byte itself
        byte: u8,
    },

    /// Operands run past the end of the array
    #[error("Truncated operands for bytecode at offset {0}")]
    TruncatedOperands(usize),

    /// Unexpected end of an encoded stream
    #[error("Unexpected end of bytecode")]
    UnexpectedEnd,

    /// VLQ value does not fit in 32 bits
    #[error("VLQ value overflows u32 at position {0}")]
    VlqOverflow(usize),

    /// Array length beyond the maximum
    #[error("Bytecode array of {length} bytes exceeds maximum of {max}")]
    TooLong {
        /// Requested length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Offset does not start a bytecode
    #[error("Offset {0} is not at a bytecode boundary")]
    InvalidOffset(usize),

    /// JSON dump failed
    #[error("JSON error: {0}")]
    Json(String),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
