//! # Otter VM Bytecode
//!
//! Interpreter bytecode as it lives on the code heap.
//!
//! ## Design Principles
//!
//! - **Accumulator-based**: Most bytecodes read or write an implicit accumulator
//! - **Fixed-size**: Every operand is one byte, so an opcode fixes its size
//! - **Immutable**: A `BytecodeArray` only changes its age after creation
//! - **Compact tables**: Side tables use VLQ encoding

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod bytecode;
pub mod bytecode_array;
pub mod constant;
pub mod error;
pub mod iterator;
pub mod operand;
pub mod vlq;

pub use bytecode::Bytecode;
pub use bytecode_array::{BytecodeArray, SourcePositions};
pub use constant::{Constant, ConstantPool};
pub use error::{BytecodeError, Result};
pub use iterator::BytecodeArrayIterator;
pub use operand::{OperandType, Register};
