//! Linear walk over a bytecode sequence

use crate::bytecode::Bytecode;
use crate::error::{BytecodeError, Result};
use crate::operand::{OperandType, Register};

/// Cursor over bytecodes.
///
/// The input must already be validated (every opcode known, no truncated
/// operands), which [`BytecodeArray`](crate::BytecodeArray) guarantees.
#[derive(Debug, Clone)]
pub struct BytecodeArrayIterator<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BytecodeArrayIterator<'a> {
    /// Start at offset 0
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Start at `offset`, which must be a bytecode boundary.
    pub fn at_offset(bytes: &'a [u8], offset: usize) -> Result<Self> {
        let mut iter = Self::new(bytes);
        iter.set_offset(offset)?;
        Ok(iter)
    }

    /// Reposition to `offset`. Fails if it falls inside an instruction or
    /// past the end.
    pub fn set_offset(&mut self, offset: usize) -> Result<()> {
        self.offset = 0;
        while !self.done() && self.offset < offset {
            self.advance();
        }
        if self.offset != offset || self.done() {
            return Err(BytecodeError::InvalidOffset(offset));
        }
        Ok(())
    }

    /// Back to the first bytecode
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// True once every bytecode has been visited
    #[inline]
    pub fn done(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    /// Step to the next bytecode
    pub fn advance(&mut self) {
        self.offset += self.current_size();
    }

    /// Offset of the current bytecode
    #[inline]
    pub fn current_offset(&self) -> usize {
        self.offset
    }

    /// The current bytecode
    pub fn current_bytecode(&self) -> Bytecode {
        assert!(!self.done(), "iterator past the end");
        match Bytecode::from_u8(self.bytes[self.offset]) {
            Some(bytecode) => bytecode,
            None => panic!("unvalidated bytecode at offset {}", self.offset),
        }
    }

    /// Size of the current bytecode including operands
    #[inline]
    pub fn current_size(&self) -> usize {
        self.current_bytecode().size()
    }

    /// Raw byte of operand `index`
    pub fn operand(&self, index: usize) -> u8 {
        let operands = self.current_bytecode().operand_types();
        assert!(index < operands.len(), "operand index out of range");
        self.bytes[self.offset + 1 + index]
    }

    /// Operand `index` decoded as a register
    pub fn register_operand(&self, index: usize) -> Register {
        debug_assert_eq!(
            self.current_bytecode().operand_types()[index],
            OperandType::Reg
        );
        Register::from_operand(self.operand(index))
    }

    /// Operand `index` decoded as a signed immediate
    pub fn immediate_operand(&self, index: usize) -> i32 {
        self.operand(index) as i8 as i32
    }

    /// Offset the current jump transfers control to.
    pub fn jump_target_offset(&self) -> usize {
        let bytecode = self.current_bytecode();
        assert!(bytecode.is_jump(), "{bytecode} is not a jump");
        let distance = self.operand(0) as usize;
        if bytecode == Bytecode::JumpLoop {
            self.offset - distance
        } else {
            self.offset + distance
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0: LdaZero
    // 1: Star r0
    // 3: JumpLoop -2 (to 1)
    // 7: Return
    const CODE: [u8; 8] = [0x00, 0x05, 0x00, 0x23, 0x02, 0x00, 0x00, 0x26];

    #[test]
    fn test_walk_offsets() {
        let mut iter = BytecodeArrayIterator::new(&CODE);
        let mut seen = Vec::new();
        while !iter.done() {
            seen.push((iter.current_offset(), iter.current_bytecode()));
            iter.advance();
        }
        assert_eq!(
            seen,
            vec![
                (0, Bytecode::LdaZero),
                (1, Bytecode::Star),
                (3, Bytecode::JumpLoop),
                (7, Bytecode::Return),
            ]
        );
    }

    #[test]
    fn test_jump_loop_targets_header() {
        let iter = BytecodeArrayIterator::at_offset(&CODE, 3).unwrap();
        assert_eq!(iter.jump_target_offset(), 1);
        assert_eq!(iter.current_size(), 4);
    }

    #[test]
    fn test_set_offset_rejects_mid_instruction() {
        assert_eq!(
            BytecodeArrayIterator::at_offset(&CODE, 2).unwrap_err(),
            BytecodeError::InvalidOffset(2)
        );
        assert!(BytecodeArrayIterator::at_offset(&CODE, 8).is_err());
    }
}
