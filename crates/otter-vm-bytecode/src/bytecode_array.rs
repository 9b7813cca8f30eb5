//! Heap representation of a compiled function's bytecode.
//!
//! A `BytecodeArray` is created once by the bytecode generator and is
//! immutable afterwards, except for its age (bumped by the GC to decide
//! flushing) and the one-way "source positions failed" state.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use serde::Serialize;

use crate::bytecode::Bytecode;
use crate::constant::ConstantPool;
use crate::error::{BytecodeError, Result};
use crate::iterator::BytecodeArrayIterator;
use crate::operand::{OperandType, Register};

/// Size of a tagged slot
pub const SYSTEM_POINTER_SIZE: usize = 8;

/// Object header: map, length, constant pool, handler table, source
/// positions, frame size, parameter size, incoming register, age + padding.
pub const HEADER_SIZE: usize = 48;

/// Maximal memory consumption for a single array
pub const MAX_SIZE: usize = 512 * 1024 * 1024;

/// Maximal length of a single array
pub const MAX_LENGTH: usize = MAX_SIZE - HEADER_SIZE;

/// Fill pattern for bytes nobody has written yet
const ZAP_BYTE: u8 = 0xCC;

const fn object_pointer_align(size: usize) -> usize {
    (size + SYSTEM_POINTER_SIZE - 1) & !(SYSTEM_POINTER_SIZE - 1)
}

/// State of the source position table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SourcePositions {
    /// Never collected; positions are computed lazily on demand
    #[default]
    NotCollected,
    /// Encoded table
    Collected(Vec<u8>),
    /// Collection was attempted and failed, usually on stack exhaustion
    FailedToCollect,
}

/// Immutable interpreter bytecode plus frame metadata.
#[derive(Debug)]
pub struct BytecodeArray {
    /// Bytecodes followed by alignment padding
    data: Box<[u8]>,
    length: usize,
    frame_size: i32,
    parameter_count: i32,
    incoming_new_target_or_generator_register: Register,
    age: AtomicU16,
    constant_pool: ConstantPool,
    handler_table: Vec<u8>,
    source_positions: SourcePositions,
}

impl BytecodeArray {
    /// Object size for an array of `length` bytecodes
    pub const fn size_for(length: usize) -> usize {
        object_pointer_align(HEADER_SIZE + length)
    }

    /// Validate `bytecodes` and build the array.
    ///
    /// `frame_size` is in bytes and must be a multiple of the pointer size.
    /// `parameter_count` includes the receiver.
    pub fn new(
        bytecodes: &[u8],
        frame_size: i32,
        parameter_count: i32,
        constant_pool: ConstantPool,
    ) -> Result<Self> {
        if bytecodes.len() > MAX_LENGTH {
            return Err(BytecodeError::TooLong {
                length: bytecodes.len(),
                max: MAX_LENGTH,
            });
        }
        validate(bytecodes)?;
        debug_assert!(frame_size >= 0 && frame_size as usize % SYSTEM_POINTER_SIZE == 0);
        debug_assert!(parameter_count >= 1, "parameter count includes the receiver");

        let body = Self::size_for(bytecodes.len()) - HEADER_SIZE;
        let mut data = vec![ZAP_BYTE; body].into_boxed_slice();
        data[..bytecodes.len()].copy_from_slice(bytecodes);

        Ok(Self {
            data,
            length: bytecodes.len(),
            frame_size,
            parameter_count,
            incoming_new_target_or_generator_register: Register::INVALID,
            age: AtomicU16::new(0),
            constant_pool,
            handler_table: Vec::new(),
            source_positions: SourcePositions::NotCollected,
        })
    }

    /// Number of bytecode bytes
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Byte at `index`
    #[inline]
    pub fn get(&self, index: usize) -> u8 {
        assert!(index < self.length, "bytecode index out of range");
        self.data[index]
    }

    /// Overwrite the byte at `index`. Only the bytecode generator and
    /// debugger patching call this.
    #[inline]
    pub fn set(&mut self, index: usize, value: u8) {
        assert!(index < self.length, "bytecode index out of range");
        self.data[index] = value;
    }

    /// The bytecodes without padding
    #[inline]
    pub fn bytecodes(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Address of the first bytecode, what the interpreter dispatches from
    pub fn first_bytecode_address(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Frame size in bytes
    #[inline]
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    /// Register count, derived from the frame size
    #[inline]
    pub fn register_count(&self) -> i32 {
        self.frame_size / SYSTEM_POINTER_SIZE as i32
    }

    /// Parameter count including the implicit receiver
    #[inline]
    pub fn parameter_count(&self) -> i32 {
        self.parameter_count
    }

    /// Set the parameter count (including the receiver)
    pub fn set_parameter_count(&mut self, count: i32) {
        debug_assert!(count >= 1);
        self.parameter_count = count;
    }

    /// Register receiving `new.target` or the generator object, if any
    pub fn incoming_new_target_or_generator_register(&self) -> Register {
        self.incoming_new_target_or_generator_register
    }

    /// Set the incoming new target / generator register
    pub fn set_incoming_new_target_or_generator_register(&mut self, register: Register) {
        debug_assert!(!register.is_valid() || register.index() < self.register_count());
        self.incoming_new_target_or_generator_register = register;
    }

    /// Current age
    #[inline]
    pub fn bytecode_age(&self) -> u16 {
        self.age.load(Ordering::Relaxed)
    }

    /// Reset or force the age
    #[inline]
    pub fn set_bytecode_age(&self, age: u16) {
        self.age.store(age, Ordering::Relaxed);
    }

    /// Age by one step, saturating at `old_age`.
    ///
    /// Races with a concurrent reset are resolved in favor of the reset.
    pub fn make_older(&self, old_age: u16) {
        let age = self.bytecode_age();
        if age < old_age {
            let _ = self
                .age
                .compare_exchange(age, age + 1, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    /// True once the array reached `old_age` and may be flushed
    #[inline]
    pub fn is_old(&self, old_age: u16) -> bool {
        self.bytecode_age() >= old_age
    }

    /// Source position state
    pub fn source_positions(&self) -> &SourcePositions {
        &self.source_positions
    }

    /// True if a table was collected
    pub fn has_source_position_table(&self) -> bool {
        matches!(self.source_positions, SourcePositions::Collected(_))
    }

    /// True if collection was attempted and failed
    pub fn did_source_position_generation_fail(&self) -> bool {
        self.source_positions == SourcePositions::FailedToCollect
    }

    /// The encoded table, or an empty slice when not collected or failed
    pub fn source_position_table(&self) -> &[u8] {
        match &self.source_positions {
            SourcePositions::Collected(table) => table,
            _ => &[],
        }
    }

    /// Attach the collected table. Ignored once collection has failed.
    pub fn set_source_position_table(&mut self, table: Vec<u8>) {
        if self.did_source_position_generation_fail() {
            return;
        }
        self.source_positions = SourcePositions::Collected(table);
    }

    /// Record a failed collection attempt. There is no way back.
    pub fn set_source_positions_failed_to_collect(&mut self) {
        self.source_positions = SourcePositions::FailedToCollect;
    }

    /// Encoded handler table (range mode)
    pub fn handler_table(&self) -> &[u8] {
        &self.handler_table
    }

    /// Attach the handler table
    pub fn set_handler_table(&mut self, table: Vec<u8>) {
        self.handler_table = table;
    }

    /// Constant pool
    pub fn constant_pool(&self) -> &ConstantPool {
        &self.constant_pool
    }

    /// Size of this object alone
    pub fn bytecode_array_size(&self) -> usize {
        Self::size_for(self.length)
    }

    /// Size of this object plus constant pool, handler table and source
    /// position table
    pub fn size_including_metadata(&self) -> usize {
        self.bytecode_array_size()
            + self.constant_pool.size_in_bytes()
            + self.handler_table.len()
            + self.source_position_table().len()
    }

    /// Bytes between the last bytecode and the object end
    pub fn padding(&self) -> &[u8] {
        &self.data[self.length..]
    }

    /// Zero the alignment padding so snapshots are deterministic
    pub fn clear_padding(&mut self) {
        self.data[self.length..].fill(0);
    }

    /// Copy the bytecodes into `to`, which must have the same length.
    pub fn copy_bytecodes_to(&self, to: &mut BytecodeArray) {
        assert_eq!(self.length, to.length, "bytecode length mismatch");
        to.data[..self.length].copy_from_slice(self.bytecodes());
    }

    /// Iterator over the bytecodes
    pub fn iter(&self) -> BytecodeArrayIterator<'_> {
        BytecodeArrayIterator::new(self.bytecodes())
    }

    /// Human-readable listing, one bytecode per line
    pub fn disassemble(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "Parameter count {}", self.parameter_count)?;
        writeln!(out, "Register count {}", self.register_count())?;
        writeln!(out, "Frame size {}", self.frame_size)?;
        let mut iter = self.iter();
        while !iter.done() {
            write!(out, "{:>6} : {}", iter.current_offset(), iter.current_bytecode())?;
            for (index, operand) in iter.current_bytecode().operand_types().iter().enumerate() {
                let separator = if index == 0 { " " } else { ", " };
                write!(out, "{separator}{}", format_operand(&iter, index, *operand))?;
            }
            if iter.current_bytecode().is_jump() {
                write!(out, " (@{})", iter.jump_target_offset())?;
            }
            writeln!(out)?;
            iter.advance();
        }
        writeln!(out, "Constant pool (size = {})", self.constant_pool.len())?;
        for (index, constant) in self.constant_pool.iter().enumerate() {
            writeln!(out, "{index:>6}: {constant}")?;
        }
        Ok(())
    }

    /// Write a JSON description of the array to `out`.
    pub fn print_json(&self, out: &mut impl std::io::Write) -> Result<()> {
        let mut bytecodes = Vec::new();
        let mut iter = self.iter();
        while !iter.done() {
            let bytecode = iter.current_bytecode();
            let operands = (0..bytecode.operand_types().len())
                .map(|index| format_operand(&iter, index, bytecode.operand_types()[index]))
                .collect();
            bytecodes.push(JsonBytecode {
                offset: iter.current_offset(),
                disassembly: bytecode.name(),
                operands,
            });
            iter.advance();
        }
        let dump = JsonDump {
            parameter_count: self.parameter_count,
            register_count: self.register_count(),
            frame_size: self.frame_size,
            bytecode_age: self.bytecode_age(),
            data: bytecodes,
            constant_pool: &self.constant_pool,
        };
        serde_json::to_writer(out, &dump).map_err(|e| BytecodeError::Json(e.to_string()))
    }
}

fn validate(bytecodes: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < bytecodes.len() {
        let bytecode = Bytecode::decode(bytecodes, offset)?;
        if offset + bytecode.size() > bytecodes.len() {
            return Err(BytecodeError::TruncatedOperands(offset));
        }
        offset += bytecode.size();
    }
    Ok(())
}

fn format_operand(iter: &BytecodeArrayIterator<'_>, index: usize, kind: OperandType) -> String {
    match kind {
        OperandType::Reg => iter.register_operand(index).to_string(),
        OperandType::Imm => format!("[{}]", iter.immediate_operand(index)),
        OperandType::Idx => format!("[{}]", iter.operand(index)),
        OperandType::RegCount => format!("#{}", iter.operand(index)),
        OperandType::Slot => format!("s{}", iter.operand(index)),
        OperandType::JumpForward | OperandType::JumpBackward | OperandType::LoopDepth => {
            format!("[{}]", iter.operand(index))
        }
    }
}

#[derive(Serialize)]
struct JsonBytecode {
    offset: usize,
    disassembly: &'static str,
    operands: Vec<String>,
}

#[derive(Serialize)]
struct JsonDump<'a> {
    parameter_count: i32,
    register_count: i32,
    frame_size: i32,
    bytecode_age: u16,
    data: Vec<JsonBytecode>,
    constant_pool: &'a ConstantPool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::Constant;

    fn sample() -> BytecodeArray {
        let mut pool = ConstantPool::new();
        pool.add(Constant::string("x"));
        // LdaConstant [0]; Star r1; Return
        BytecodeArray::new(&[0x03, 0x00, 0x05, 0x01, 0x26], 16, 2, pool).unwrap()
    }

    #[test]
    fn test_size_for_is_pointer_aligned() {
        assert_eq!(BytecodeArray::size_for(0), HEADER_SIZE);
        assert_eq!(BytecodeArray::size_for(1), HEADER_SIZE + 8);
        assert_eq!(BytecodeArray::size_for(8), HEADER_SIZE + 8);
        assert_eq!(sample().bytecode_array_size(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_rejects_invalid_input() {
        assert!(matches!(
            BytecodeArray::new(&[0x05], 0, 1, ConstantPool::new()),
            Err(BytecodeError::TruncatedOperands(0))
        ));
        assert!(matches!(
            BytecodeArray::new(&[0x26, 0xFE], 0, 1, ConstantPool::new()),
            Err(BytecodeError::InvalidOpcode { offset: 1, byte: 0xFE })
        ));
    }

    #[test]
    fn test_frame_accessors() {
        let array = sample();
        assert_eq!(array.register_count(), 2);
        assert_eq!(array.parameter_count(), 2);
        assert_eq!(array.get(2), 0x05);
        assert!(!array.incoming_new_target_or_generator_register().is_valid());
    }

    #[test]
    fn test_aging_saturates() {
        let array = sample();
        for _ in 0..10 {
            array.make_older(5);
        }
        assert_eq!(array.bytecode_age(), 5);
        assert!(array.is_old(5));
        array.set_bytecode_age(0);
        assert!(!array.is_old(5));
    }

    #[test]
    fn test_source_position_failure_is_one_way() {
        let mut array = sample();
        assert!(!array.has_source_position_table());
        array.set_source_positions_failed_to_collect();
        array.set_source_position_table(vec![1, 2, 3]);
        assert!(array.did_source_position_generation_fail());
        assert!(array.source_position_table().is_empty());
    }

    #[test]
    fn test_clear_padding() {
        let mut array = sample();
        assert!(array.padding().iter().all(|&b| b == ZAP_BYTE));
        array.clear_padding();
        assert_eq!(array.padding(), &[0, 0, 0]);
        assert_eq!(array.bytecodes(), &[0x03, 0x00, 0x05, 0x01, 0x26]);
    }

    #[test]
    fn test_size_including_metadata() {
        let mut array = sample();
        array.set_handler_table(vec![0; 16]);
        array.set_source_position_table(vec![0; 4]);
        assert_eq!(array.size_including_metadata(), HEADER_SIZE + 8 + 8 + 16 + 4);
    }

    #[test]
    fn test_disassemble_and_json() {
        let array = sample();
        let mut text = String::new();
        array.disassemble(&mut text).unwrap();
        assert!(text.contains("0 : LdaConstant [0]"));
        assert!(text.contains("2 : Star r1"));

        let mut json = Vec::new();
        array.print_json(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["data"][1]["disassembly"], "Star");
        assert_eq!(value["parameter_count"], 2);
    }
}
