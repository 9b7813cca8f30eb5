//! Baseline pc to bytecode offset mapping
//!
//! Baseline code keeps no deoptimization data. Instead it records, as
//! unsigned VLQ deltas, the pc at which each bytecode's machine code ends.
//! The first delta covers the prologue, then one per bytecode in order.

use otter_vm_bytecode::{Bytecode, BytecodeArray, BytecodeArrayIterator, vlq};

/// Bytecode offset reported for pcs in the prologue
pub const FUNCTION_ENTRY_BYTECODE_OFFSET: i32 = -1;

/// Bytecode offset reported for the frame-leaving builtin
pub const FUNCTION_EXIT_BYTECODE_OFFSET: i32 = -2;

/// Which end of a bytecode's machine code to report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytecodeToPcPosition {
    /// First pc of the bytecode
    Start,
    /// One past the last pc of the bytecode
    End,
}

/// Records machine code positions while the baseline compiler emits code
#[derive(Debug, Default, Clone)]
pub struct BytecodeOffsetTableBuilder {
    bytes: Vec<u8>,
    previous_pc: usize,
}

impl BytecodeOffsetTableBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the end of the prologue, then the end of each bytecode.
    pub fn add_position(&mut self, pc_offset: usize) {
        assert!(pc_offset >= self.previous_pc, "positions must not decrease");
        vlq::encode_unsigned((pc_offset - self.previous_pc) as u32, &mut self.bytes);
        self.previous_pc = pc_offset;
    }

    /// Encoded table
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Walks a bytecode offset table in lockstep with its bytecode.
///
/// Starts on the prologue: pc range `[0, first delta)` at
/// [`FUNCTION_ENTRY_BYTECODE_OFFSET`].
#[derive(Debug, Clone)]
pub struct BytecodeOffsetIterator<'a> {
    table: &'a [u8],
    position: usize,
    bytecodes: BytecodeArrayIterator<'a>,
    pc_start: usize,
    pc_end: usize,
    bytecode_offset: i32,
}

impl<'a> BytecodeOffsetIterator<'a> {
    /// Position on the prologue
    pub fn new(table: &'a [u8], bytecodes: &'a BytecodeArray) -> Self {
        let mut iter = Self {
            table,
            position: 0,
            bytecodes: bytecodes.iter(),
            pc_start: 0,
            pc_end: 0,
            bytecode_offset: FUNCTION_ENTRY_BYTECODE_OFFSET,
        };
        iter.pc_end = iter.read_position();
        iter
    }

    fn read_position(&mut self) -> usize {
        match vlq::decode_unsigned(self.table, &mut self.position) {
            Ok(delta) => delta as usize,
            Err(err) => panic!("corrupt bytecode offset table: {err}"),
        }
    }

    /// True once every entry has been read
    pub fn done(&self) -> bool {
        self.position >= self.table.len()
    }

    /// Move to the next bytecode
    pub fn advance(&mut self) {
        assert!(!self.done(), "bytecode offset table exhausted");
        self.pc_start = self.pc_end;
        self.pc_end += self.read_position();
        self.bytecode_offset = self.bytecodes.current_offset() as i32;
        self.bytecodes.advance();
    }

    /// Advance until the current range contains `pc_offset`
    pub fn advance_to_pc_offset(&mut self, pc_offset: usize) {
        while self.pc_end < pc_offset {
            self.advance();
        }
        debug_assert!(pc_offset > self.pc_start || pc_offset == 0);
        debug_assert!(pc_offset <= self.pc_end);
    }

    /// Advance until the current bytecode is the one at `bytecode_offset`
    pub fn advance_to_bytecode_offset(&mut self, bytecode_offset: i32) {
        while self.bytecode_offset < bytecode_offset {
            self.advance();
        }
        assert_eq!(self.bytecode_offset, bytecode_offset, "not a bytecode boundary");
    }

    /// First pc of the current bytecode
    pub fn current_pc_start_offset(&self) -> usize {
        self.pc_start
    }

    /// One past the last pc of the current bytecode
    pub fn current_pc_end_offset(&self) -> usize {
        self.pc_end
    }

    /// Offset of the current bytecode
    pub fn current_bytecode_offset(&self) -> i32 {
        self.bytecode_offset
    }
}

/// Pc offset of one end of the bytecode at `bytecode_offset`
pub fn pc_for_bytecode_offset(
    table: &[u8],
    bytecodes: &BytecodeArray,
    bytecode_offset: i32,
    position: BytecodeToPcPosition,
) -> usize {
    let mut iter = BytecodeOffsetIterator::new(table, bytecodes);
    iter.advance_to_bytecode_offset(bytecode_offset);
    match position {
        BytecodeToPcPosition::Start => iter.current_pc_start_offset(),
        BytecodeToPcPosition::End => iter.current_pc_end_offset(),
    }
}

/// Pc offset execution continues at after the bytecode at `bytecode_offset`.
///
/// A `JumpLoop` continues at the start of its loop header. Other jumps have
/// no single successor and must not be passed.
pub fn pc_for_next_executed_bytecode(table: &[u8], bytecodes: &BytecodeArray, bytecode_offset: i32) -> usize {
    let iter = match BytecodeArrayIterator::at_offset(bytecodes.bytecodes(), bytecode_offset as usize) {
        Ok(iter) => iter,
        Err(err) => panic!("bad bytecode offset {bytecode_offset}: {err}"),
    };
    let bytecode = iter.current_bytecode();
    if bytecode == Bytecode::JumpLoop {
        pc_for_bytecode_offset(
            table,
            bytecodes,
            iter.jump_target_offset() as i32,
            BytecodeToPcPosition::Start,
        )
    } else {
        assert!(!bytecode.is_jump(), "{bytecode} has no single successor");
        pc_for_bytecode_offset(table, bytecodes, bytecode_offset, BytecodeToPcPosition::End)
    }
}

/// Bytecode offset whose machine code contains `pc_offset`
pub fn bytecode_offset_for_pc(table: &[u8], bytecodes: &BytecodeArray, pc_offset: usize) -> i32 {
    let mut iter = BytecodeOffsetIterator::new(table, bytecodes);
    iter.advance_to_pc_offset(pc_offset);
    iter.current_bytecode_offset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_vm_bytecode::ConstantPool;

    // 0: LdaZero        pc [8, 12)
    // 1: Star r0        pc [12, 20)
    // 3: JumpLoop -> 1  pc [20, 32)
    // 7: Return         pc [32, 36)
    fn fixture() -> (BytecodeArray, Vec<u8>) {
        let bytes = vec![0x00, 0x05, 0x00, 0x23, 0x02, 0x00, 0x00, 0x26];
        let array = BytecodeArray::new(&bytes, 8, 1, ConstantPool::new()).unwrap();
        let mut builder = BytecodeOffsetTableBuilder::new();
        for pc in [8, 12, 20, 32, 36] {
            builder.add_position(pc);
        }
        (array, builder.finish())
    }

    #[test]
    fn test_prologue_maps_to_function_entry() {
        let (array, table) = fixture();
        let iter = BytecodeOffsetIterator::new(&table, &array);
        assert_eq!(iter.current_pc_start_offset(), 0);
        assert_eq!(iter.current_pc_end_offset(), 8);
        assert_eq!(iter.current_bytecode_offset(), FUNCTION_ENTRY_BYTECODE_OFFSET);
        assert_eq!(bytecode_offset_for_pc(&table, &array, 4), FUNCTION_ENTRY_BYTECODE_OFFSET);
    }

    #[test]
    fn test_pc_to_bytecode() {
        let (array, table) = fixture();
        assert_eq!(bytecode_offset_for_pc(&table, &array, 9), 0);
        assert_eq!(bytecode_offset_for_pc(&table, &array, 12), 0);
        assert_eq!(bytecode_offset_for_pc(&table, &array, 13), 1);
        assert_eq!(bytecode_offset_for_pc(&table, &array, 32), 3);
        assert_eq!(bytecode_offset_for_pc(&table, &array, 36), 7);
    }

    #[test]
    fn test_bytecode_to_pc() {
        let (array, table) = fixture();
        assert_eq!(pc_for_bytecode_offset(&table, &array, 1, BytecodeToPcPosition::Start), 12);
        assert_eq!(pc_for_bytecode_offset(&table, &array, 1, BytecodeToPcPosition::End), 20);
        assert_eq!(pc_for_bytecode_offset(&table, &array, 7, BytecodeToPcPosition::End), 36);
    }

    #[test]
    fn test_next_executed_bytecode() {
        let (array, table) = fixture();
        // loop back edge resumes at the loop header
        assert_eq!(pc_for_next_executed_bytecode(&table, &array, 3), 12);
        assert_eq!(pc_for_next_executed_bytecode(&table, &array, 1), 20);
    }
}
