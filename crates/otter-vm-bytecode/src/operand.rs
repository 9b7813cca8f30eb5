//! Bytecode operands

use serde::{Deserialize, Serialize};

/// Interpreter frame register.
///
/// Non-negative indices are locals; parameters live below the frame and get
/// negative indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Register(pub i32);

impl Register {
    /// Marker for "no register"
    pub const INVALID: Register = Register(i32::MIN);

    /// Create a new register
    #[inline]
    pub const fn new(index: i32) -> Self {
        Self(index)
    }

    /// Register holding parameter `index`; index 0 is the receiver.
    #[inline]
    pub const fn from_parameter_index(index: i32, parameter_count: i32) -> Self {
        Self(index - parameter_count - FRAME_HEADER_SLOTS)
    }

    /// Get register index
    #[inline]
    pub const fn index(self) -> i32 {
        self.0
    }

    /// False for [`Register::INVALID`]
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != i32::MIN
    }

    /// True for registers below the frame
    #[inline]
    pub const fn is_parameter(self) -> bool {
        self.is_valid() && self.0 < 0
    }

    /// Decode an 8-bit register operand
    #[inline]
    pub const fn from_operand(byte: u8) -> Self {
        Self(byte as i8 as i32)
    }
}

impl From<i32> for Register {
    fn from(index: i32) -> Self {
        Self(index)
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_valid() {
            f.write_str("<invalid>")
        } else if self.is_parameter() {
            write!(f, "a{}", -self.0 - 1)
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// Fixed slots between the parameters and the first local register
/// (return address, caller frame pointer, context, closure).
pub const FRAME_HEADER_SLOTS: i32 = 4;

/// Kind of a single-byte operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperandType {
    /// Register, signed byte
    Reg,
    /// Signed immediate
    Imm,
    /// Unsigned index into the constant pool
    Idx,
    /// Unsigned count
    RegCount,
    /// Feedback vector slot
    Slot,
    /// Unsigned forward jump distance
    JumpForward,
    /// Unsigned backward jump distance
    JumpBackward,
    /// Loop nesting depth
    LoopDepth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_decoding() {
        assert_eq!(Register::from_operand(0x02), Register(2));
        assert_eq!(Register::from_operand(0xFF), Register(-1));
        assert!(Register::from_operand(0xFF).is_parameter());
        assert!(!Register::INVALID.is_valid());
        assert_eq!(Register(3).to_string(), "r3");
        assert_eq!(Register(-1).to_string(), "a0");
    }

    #[test]
    fn test_parameter_registers_are_negative() {
        let receiver = Register::from_parameter_index(0, 2);
        assert_eq!(receiver, Register(-6));
        assert!(receiver.is_parameter());
    }
}
