//! Translation programs
//!
//! A translation describes how to rebuild interpreter frames from the state
//! of optimized code at one deoptimization point. All translations of a
//! compile share one byte array; each starts with a `Begin*` opcode.
//! Opcodes are single bytes, operands zig-zag VLQ.

use std::sync::Arc;

use otter_vm_bytecode::vlq;

use crate::deoptimization::BytecodeOffset;
use crate::error::{CodeError, Result};

macro_rules! define_translation_opcodes {
    ($($name:ident = $value:literal, $operands:literal;)*) => {
        /// Translation opcodes
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum TranslationOpcode {
            $(
                #[allow(missing_docs)]
                $name = $value,
            )*
        }

        impl TranslationOpcode {
            /// Decode an opcode byte
            pub const fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(TranslationOpcode::$name),)*
                    _ => None,
                }
            }

            /// Number of operands that follow the opcode
            pub const fn operand_count(self) -> usize {
                match self {
                    $(TranslationOpcode::$name => $operands,)*
                }
            }
        }
    };
}

define_translation_opcodes! {
    BeginWithFeedback = 0, 3;
    BeginWithoutFeedback = 1, 3;
    InterpretedFrameWithReturn = 2, 5;
    InterpretedFrameWithoutReturn = 3, 3;
    Register = 4, 1;
    Int32Register = 5, 1;
    DoubleRegister = 6, 1;
    StackSlot = 7, 1;
    Int32StackSlot = 8, 1;
    DoubleStackSlot = 9, 1;
    Literal = 10, 1;
    OptimizedOut = 11, 0;
    CapturedObject = 12, 1;
    DuplicatedObject = 13, 1;
    UpdateFeedback = 14, 2;
}

impl TranslationOpcode {
    /// Starts a translation
    pub const fn is_begin(self) -> bool {
        matches!(
            self,
            TranslationOpcode::BeginWithFeedback | TranslationOpcode::BeginWithoutFeedback
        )
    }

    /// Starts an interpreted frame
    pub const fn is_frame(self) -> bool {
        matches!(
            self,
            TranslationOpcode::InterpretedFrameWithReturn
                | TranslationOpcode::InterpretedFrameWithoutReturn
        )
    }
}

/// Writes translations into one shared byte array
#[derive(Debug, Default)]
pub struct TranslationArrayBuilder {
    bytes: Vec<u8>,
}

impl TranslationArrayBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, opcode: TranslationOpcode, operands: &[i32]) {
        debug_assert_eq!(operands.len(), opcode.operand_count());
        self.bytes.push(opcode as u8);
        for operand in operands {
            vlq::encode_signed(*operand, &mut self.bytes);
        }
    }

    /// Start a translation and return its index, which deopt entries record.
    pub fn begin_translation(&mut self, frame_count: i32, jsframe_count: i32, update_feedback: bool) -> usize {
        let start = self.bytes.len();
        let opcode = if update_feedback {
            TranslationOpcode::BeginWithFeedback
        } else {
            TranslationOpcode::BeginWithoutFeedback
        };
        self.add(opcode, &[frame_count, jsframe_count, update_feedback as i32]);
        start
    }

    /// Interpreted frame whose result lands in registers
    pub fn interpreted_frame_with_return(
        &mut self,
        bytecode_offset: BytecodeOffset,
        literal_id: i32,
        height: i32,
        return_value_offset: i32,
        return_value_count: i32,
    ) -> &mut Self {
        self.add(
            TranslationOpcode::InterpretedFrameWithReturn,
            &[
                bytecode_offset.to_int(),
                literal_id,
                height,
                return_value_offset,
                return_value_count,
            ],
        );
        self
    }

    /// Interpreted frame without a pending result
    pub fn interpreted_frame(&mut self, bytecode_offset: BytecodeOffset, literal_id: i32, height: i32) -> &mut Self {
        self.add(
            TranslationOpcode::InterpretedFrameWithoutReturn,
            &[bytecode_offset.to_int(), literal_id, height],
        );
        self
    }

    /// Tagged value in a machine register
    pub fn store_register(&mut self, reg: i32) -> &mut Self {
        self.add(TranslationOpcode::Register, &[reg]);
        self
    }

    /// Untagged int32 in a machine register
    pub fn store_int32_register(&mut self, reg: i32) -> &mut Self {
        self.add(TranslationOpcode::Int32Register, &[reg]);
        self
    }

    /// Float64 in a machine register
    pub fn store_double_register(&mut self, reg: i32) -> &mut Self {
        self.add(TranslationOpcode::DoubleRegister, &[reg]);
        self
    }

    /// Tagged value in a stack slot
    pub fn store_stack_slot(&mut self, slot: i32) -> &mut Self {
        self.add(TranslationOpcode::StackSlot, &[slot]);
        self
    }

    /// Untagged int32 in a stack slot
    pub fn store_int32_stack_slot(&mut self, slot: i32) -> &mut Self {
        self.add(TranslationOpcode::Int32StackSlot, &[slot]);
        self
    }

    /// Float64 in a stack slot
    pub fn store_double_stack_slot(&mut self, slot: i32) -> &mut Self {
        self.add(TranslationOpcode::DoubleStackSlot, &[slot]);
        self
    }

    /// Entry of the literal array
    pub fn store_literal(&mut self, literal_id: i32) -> &mut Self {
        self.add(TranslationOpcode::Literal, &[literal_id]);
        self
    }

    /// Value the optimizer proved dead
    pub fn store_optimized_out(&mut self) -> &mut Self {
        self.add(TranslationOpcode::OptimizedOut, &[]);
        self
    }

    /// Escape-analyzed object; its `length` fields follow
    pub fn begin_captured_object(&mut self, length: i32) -> &mut Self {
        self.add(TranslationOpcode::CapturedObject, &[length]);
        self
    }

    /// Reference to an object materialized earlier in this translation
    pub fn duplicate_object(&mut self, object_index: i32) -> &mut Self {
        self.add(TranslationOpcode::DuplicatedObject, &[object_index]);
        self
    }

    /// Feedback slot to update on deoptimization
    pub fn add_update_feedback(&mut self, vector_literal: i32, slot: i32) -> &mut Self {
        self.add(TranslationOpcode::UpdateFeedback, &[vector_literal, slot]);
        self
    }

    /// Current size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True before anything was written
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Freeze into the shared array
    pub fn finish(self) -> Arc<[u8]> {
        Arc::from(self.bytes)
    }
}

/// Reads opcodes and operands from a translation array
#[derive(Debug, Clone)]
pub struct TranslationArrayIterator<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> TranslationArrayIterator<'a> {
    /// Start reading at `index`
    pub fn new(bytes: &'a [u8], index: usize) -> Self {
        Self { bytes, index }
    }

    /// Current byte index
    pub fn index(&self) -> usize {
        self.index
    }

    /// True at the end of the array
    pub fn done(&self) -> bool {
        self.index >= self.bytes.len()
    }

    /// Opcode at the cursor, without consuming it
    pub fn peek_opcode(&self) -> Option<TranslationOpcode> {
        self.bytes.get(self.index).copied().and_then(TranslationOpcode::from_u8)
    }

    /// Read an opcode
    pub fn next_opcode(&mut self) -> Result<TranslationOpcode> {
        let byte = *self.bytes.get(self.index).ok_or_else(|| self.error("truncated opcode"))?;
        let opcode = TranslationOpcode::from_u8(byte).ok_or_else(|| self.error("unknown opcode"))?;
        self.index += 1;
        Ok(opcode)
    }

    /// Read one operand
    pub fn next_operand(&mut self) -> Result<i32> {
        let mut pos = self.index;
        let value =
            vlq::decode_signed(self.bytes, &mut pos).map_err(|err| self.error(&err.to_string()))?;
        self.index = pos;
        Ok(value)
    }

    fn error(&self, reason: &str) -> CodeError {
        CodeError::InvalidTranslation {
            index: self.index,
            reason: reason.to_string(),
        }
    }
}

/// A value of a translated frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatedValue {
    /// Tagged register
    Register(i32),
    /// Int32 register
    Int32Register(i32),
    /// Double register
    DoubleRegister(i32),
    /// Tagged stack slot
    StackSlot(i32),
    /// Int32 stack slot
    Int32StackSlot(i32),
    /// Double stack slot
    DoubleStackSlot(i32),
    /// Literal array entry
    Literal(i32),
    /// Dead value
    OptimizedOut,
    /// Start of a captured object with this many fields
    CapturedObject(i32),
    /// Earlier object
    DuplicatedObject(i32),
}

/// One interpreter frame to materialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedFrame {
    /// Bytecode offset to resume at
    pub bytecode_offset: BytecodeOffset,
    /// Literal id of the frame's shared function info
    pub shared_info_literal: i32,
    /// Number of interpreter registers
    pub height: i32,
    /// Register receiving the call result, if the frame expects one
    pub return_value_offset: Option<i32>,
    /// Number of result registers
    pub return_value_count: i32,
    /// Values in order
    pub values: Vec<TranslatedValue>,
}

/// Decoded translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedState {
    /// Frames, outermost first
    pub frames: Vec<TranslatedFrame>,
    /// Frames that are JS frames
    pub jsframe_count: i32,
    /// Feedback to update: (vector literal, slot)
    pub update_feedback: Option<(i32, i32)>,
}

/// Decode the translation starting at `index`.
pub fn decode_translation(bytes: &[u8], index: usize) -> Result<TranslatedState> {
    let mut iter = TranslationArrayIterator::new(bytes, index);
    let begin = iter.next_opcode()?;
    if !begin.is_begin() {
        return Err(CodeError::InvalidTranslation {
            index,
            reason: format!("expected begin, found {begin:?}"),
        });
    }
    let frame_count = iter.next_operand()?;
    let jsframe_count = iter.next_operand()?;
    let _update_feedback = iter.next_operand()?;

    let mut state = TranslatedState {
        frames: Vec::new(),
        jsframe_count,
        update_feedback: None,
    };
    while let Some(opcode) = iter.peek_opcode() {
        if opcode.is_begin() {
            break;
        }
        let at = iter.index();
        iter.next_opcode()?;
        let mut operands = [0i32; 5];
        for operand in operands.iter_mut().take(opcode.operand_count()) {
            *operand = iter.next_operand()?;
        }
        let value = match opcode {
            TranslationOpcode::InterpretedFrameWithReturn
            | TranslationOpcode::InterpretedFrameWithoutReturn => {
                let with_return = opcode == TranslationOpcode::InterpretedFrameWithReturn;
                state.frames.push(TranslatedFrame {
                    bytecode_offset: BytecodeOffset::new(operands[0]),
                    shared_info_literal: operands[1],
                    height: operands[2],
                    return_value_offset: with_return.then_some(operands[3]),
                    return_value_count: if with_return { operands[4] } else { 0 },
                    values: Vec::new(),
                });
                continue;
            }
            TranslationOpcode::UpdateFeedback => {
                state.update_feedback = Some((operands[0], operands[1]));
                continue;
            }
            TranslationOpcode::Register => TranslatedValue::Register(operands[0]),
            TranslationOpcode::Int32Register => TranslatedValue::Int32Register(operands[0]),
            TranslationOpcode::DoubleRegister => TranslatedValue::DoubleRegister(operands[0]),
            TranslationOpcode::StackSlot => TranslatedValue::StackSlot(operands[0]),
            TranslationOpcode::Int32StackSlot => TranslatedValue::Int32StackSlot(operands[0]),
            TranslationOpcode::DoubleStackSlot => TranslatedValue::DoubleStackSlot(operands[0]),
            TranslationOpcode::Literal => TranslatedValue::Literal(operands[0]),
            TranslationOpcode::OptimizedOut => TranslatedValue::OptimizedOut,
            TranslationOpcode::CapturedObject => TranslatedValue::CapturedObject(operands[0]),
            TranslationOpcode::DuplicatedObject => TranslatedValue::DuplicatedObject(operands[0]),
            TranslationOpcode::BeginWithFeedback | TranslationOpcode::BeginWithoutFeedback => {
                unreachable!("begin handled above")
            }
        };
        match state.frames.last_mut() {
            Some(frame) => frame.values.push(value),
            None => {
                return Err(CodeError::InvalidTranslation {
                    index: at,
                    reason: "value before the first frame".to_string(),
                });
            }
        }
    }
    if iter.peek_opcode().is_none() && !iter.done() {
        return Err(CodeError::InvalidTranslation {
            index: iter.index(),
            reason: "unknown opcode".to_string(),
        });
    }
    if state.frames.len() != frame_count as usize {
        return Err(CodeError::InvalidTranslation {
            index,
            reason: format!("expected {frame_count} frames, found {}", state.frames.len()),
        });
    }
    Ok(state)
}
