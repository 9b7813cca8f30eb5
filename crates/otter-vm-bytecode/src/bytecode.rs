//! Interpreter bytecodes
//!
//! Accumulator-based instruction set. Every operand is a single byte, so the
//! size of an instruction is fixed by its opcode.

use serde::{Deserialize, Serialize};

use crate::error::{BytecodeError, Result};
use crate::operand::OperandType;

macro_rules! define_bytecodes {
    ($(
        $(#[$doc:meta])*
        $name:ident = $value:literal => [$($operand:ident),*]
    ),* $(,)?) => {
        /// Bytecode opcodes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Bytecode {
            $(
                $(#[$doc])*
                $name = $value,
            )*
        }

        impl Bytecode {
            /// Decode an opcode byte
            pub const fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(Bytecode::$name),)*
                    _ => None,
                }
            }

            /// Operand layout of this bytecode
            pub const fn operand_types(self) -> &'static [OperandType] {
                match self {
                    $(Bytecode::$name => &[$(OperandType::$operand),*],)*
                }
            }

            /// Mnemonic used by the disassembler
            pub const fn name(self) -> &'static str {
                match self {
                    $(Bytecode::$name => stringify!($name),)*
                }
            }
        }
    };
}

define_bytecodes! {
    // ==================== Loads ====================
    /// acc = 0
    LdaZero = 0x00 => [],
    /// acc = imm8
    LdaSmi = 0x01 => [Imm],
    /// acc = undefined
    LdaUndefined = 0x02 => [],
    /// acc = constants\[idx\]
    LdaConstant = 0x03 => [Idx],
    /// acc = reg
    Ldar = 0x04 => [Reg],
    /// reg = acc
    Star = 0x05 => [Reg],
    /// dst = src
    Mov = 0x06 => [Reg, Reg],
    /// acc = reg.constants\[idx\]
    GetNamedProperty = 0x07 => [Reg, Idx, Slot],
    /// reg.constants\[idx\] = acc
    SetNamedProperty = 0x08 => [Reg, Idx, Slot],

    // ==================== Arithmetic ====================
    /// acc = reg + acc
    Add = 0x10 => [Reg, Slot],
    /// acc = reg - acc
    Sub = 0x11 => [Reg, Slot],
    /// acc = reg * acc
    Mul = 0x12 => [Reg, Slot],
    /// acc = acc + 1
    Inc = 0x13 => [Slot],
    /// acc = reg < acc
    TestLessThan = 0x14 => [Reg, Slot],
    /// acc = reg === acc
    TestEqualStrict = 0x15 => [Reg, Slot],

    // ==================== Control flow ====================
    /// pc += distance
    Jump = 0x20 => [JumpForward],
    /// if acc: pc += distance
    JumpIfTrue = 0x21 => [JumpForward],
    /// if !acc: pc += distance
    JumpIfFalse = 0x22 => [JumpForward],
    /// pc -= distance; back edge of a loop, also an interrupt and OSR check
    JumpLoop = 0x23 => [JumpBackward, LoopDepth, Slot],
    /// acc = callee(args...)
    CallProperty = 0x24 => [Reg, Reg, RegCount, Slot],
    /// Check for interrupts and stack overflow
    StackCheck = 0x25 => [],
    /// Return acc to the caller
    Return = 0x26 => [],
    /// Throw acc
    Throw = 0x27 => [],
    /// Resume a suspended generator in reg
    ResumeGenerator = 0x28 => [Reg, Reg, RegCount],
    /// Debugger statement
    Debugger = 0x29 => [],
}

impl Bytecode {
    /// Decode the opcode at `offset` in `bytes`.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self> {
        let byte = *bytes.get(offset).ok_or(BytecodeError::UnexpectedEnd)?;
        Self::from_u8(byte).ok_or(BytecodeError::InvalidOpcode { offset, byte })
    }

    /// Total size in bytes including operands
    #[inline]
    pub const fn size(self) -> usize {
        1 + self.operand_types().len()
    }

    /// Any jump, forward or backward
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Bytecode::Jump | Bytecode::JumpIfTrue | Bytecode::JumpIfFalse | Bytecode::JumpLoop
        )
    }

    /// Conditional forward jumps
    pub const fn is_conditional_jump(self) -> bool {
        matches!(self, Bytecode::JumpIfTrue | Bytecode::JumpIfFalse)
    }

    /// Bytecodes after which execution does not fall through
    pub const fn is_unconditional_exit(self) -> bool {
        matches!(self, Bytecode::Return | Bytecode::Throw)
    }
}

impl std::fmt::Display for Bytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
