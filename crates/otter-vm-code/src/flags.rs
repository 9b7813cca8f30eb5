//! Flag words of Code and InstructionStream
//!
//! In memory the flags are plain validated structs. The packed forms are only
//! produced for the snapshot writer, whose byte layout is fixed:
//!
//! ```text
//! Code:               Kind:4 | IsTurbofanned:1 | IsOffHeapTrampoline:1
//! InstructionStream:  Kind:4 | IsTurbofanned:1 | StackSlots:24 | IsOffHeapTrampoline:1
//! ```

use bitflags::bitflags;

use crate::error::{CodeError, Result};
use crate::kind::CodeKind;

const KIND_BITS: u32 = 4;
const KIND_MASK: u32 = (1 << KIND_BITS) - 1;
const TURBOFANNED_SHIFT: u32 = KIND_BITS;
const CODE_OFF_HEAP_SHIFT: u32 = TURBOFANNED_SHIFT + 1;
const STACK_SLOTS_SHIFT: u32 = TURBOFANNED_SHIFT + 1;
const STACK_SLOTS_BITS: u32 = 24;
const STACK_SLOTS_MASK: u32 = (1 << STACK_SLOTS_BITS) - 1;
const STREAM_OFF_HEAP_SHIFT: u32 = STACK_SLOTS_SHIFT + STACK_SLOTS_BITS;

/// Largest stack slot count an InstructionStream can record
pub const MAX_STACK_SLOTS: u32 = STACK_SLOTS_MASK;

fn decode_kind(bits: u32) -> Result<CodeKind> {
    let raw = bits & KIND_MASK;
    CodeKind::from_u8(raw as u8).ok_or(CodeError::FlagOutOfRange {
        field: "kind",
        value: raw as u64,
    })
}

/// Flags stored on a Code object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeFlags {
    /// Code kind
    pub kind: CodeKind,
    /// Produced by the top-tier optimizing compiler
    pub is_turbofanned: bool,
    /// Body lives in the embedded builtins blob
    pub is_off_heap_trampoline: bool,
}

impl CodeFlags {
    /// Build the flag set for a new Code object
    pub const fn new(kind: CodeKind, is_turbofanned: bool, is_off_heap_trampoline: bool) -> Self {
        Self {
            kind,
            is_turbofanned,
            is_off_heap_trampoline,
        }
    }

    /// Snapshot encoding
    pub const fn pack(self) -> u32 {
        (self.kind as u32)
            | ((self.is_turbofanned as u32) << TURBOFANNED_SHIFT)
            | ((self.is_off_heap_trampoline as u32) << CODE_OFF_HEAP_SHIFT)
    }

    /// Decode a snapshot flag word
    pub fn unpack(bits: u32) -> Result<Self> {
        if bits >> (CODE_OFF_HEAP_SHIFT + 1) != 0 {
            return Err(CodeError::FlagOutOfRange {
                field: "code flags",
                value: bits as u64,
            });
        }
        Ok(Self {
            kind: decode_kind(bits)?,
            is_turbofanned: bits & (1 << TURBOFANNED_SHIFT) != 0,
            is_off_heap_trampoline: bits & (1 << CODE_OFF_HEAP_SHIFT) != 0,
        })
    }
}

/// Flags stored on an InstructionStream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionStreamFlags {
    kind: CodeKind,
    is_turbofanned: bool,
    stack_slots: u32,
    is_off_heap_trampoline: bool,
}

impl InstructionStreamFlags {
    /// Validated constructor; `stack_slots` must fit in 24 bits.
    pub fn new(kind: CodeKind, is_turbofanned: bool, stack_slots: u32) -> Result<Self> {
        if stack_slots > MAX_STACK_SLOTS {
            return Err(CodeError::FlagOutOfRange {
                field: "stack_slots",
                value: stack_slots as u64,
            });
        }
        Ok(Self {
            kind,
            is_turbofanned,
            stack_slots,
            is_off_heap_trampoline: false,
        })
    }

    /// Code kind
    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    /// Produced by the top-tier optimizing compiler
    #[inline]
    pub fn is_turbofanned(&self) -> bool {
        self.is_turbofanned
    }

    /// Spill slots used by the frame
    #[inline]
    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    /// Always false for on-heap streams; kept for the snapshot layout
    #[inline]
    pub fn is_off_heap_trampoline(&self) -> bool {
        self.is_off_heap_trampoline
    }

    /// Snapshot encoding
    pub fn pack(self) -> u32 {
        (self.kind as u32)
            | ((self.is_turbofanned as u32) << TURBOFANNED_SHIFT)
            | (self.stack_slots << STACK_SLOTS_SHIFT)
            | ((self.is_off_heap_trampoline as u32) << STREAM_OFF_HEAP_SHIFT)
    }

    /// Decode a snapshot flag word
    pub fn unpack(bits: u32) -> Result<Self> {
        if bits >> (STREAM_OFF_HEAP_SHIFT + 1) != 0 {
            return Err(CodeError::FlagOutOfRange {
                field: "instruction stream flags",
                value: bits as u64,
            });
        }
        Ok(Self {
            kind: decode_kind(bits)?,
            is_turbofanned: bits & (1 << TURBOFANNED_SHIFT) != 0,
            stack_slots: (bits >> STACK_SLOTS_SHIFT) & STACK_SLOTS_MASK,
            is_off_heap_trampoline: bits & (1 << STREAM_OFF_HEAP_SHIFT) != 0,
        })
    }
}

bitflags! {
    /// Flags whose meaning depends on the code kind.
    ///
    /// Only meaningful for code that can deoptimize, except
    /// `IS_PROMISE_REJECTION` which applies to builtins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KindSpecificFlags: u32 {
        /// Must not be entered again; the deoptimizer will replace it
        const MARKED_FOR_DEOPTIMIZATION = 1 << 0;
        /// Embedded object slots were wiped by the GC
        const EMBEDDED_OBJECTS_CLEARED = 1 << 1;
        /// Maps, property cells and receivers are embedded weakly
        const CAN_HAVE_WEAK_OBJECTS = 1 << 2;
        /// Exceptions thrown here reject a promise
        const IS_PROMISE_REJECTION = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_flags_pack() {
        let flags = CodeFlags::new(CodeKind::Turbofan, true, false);
        let bits = flags.pack();
        assert_eq!(bits, 13 | (1 << 4));
        assert_eq!(CodeFlags::unpack(bits).unwrap(), flags);

        let trampoline = CodeFlags::new(CodeKind::Builtin, false, true);
        assert_eq!(trampoline.pack(), 2 | (1 << 5));
    }

    #[test]
    fn test_stream_flags_layout() {
        let flags = InstructionStreamFlags::new(CodeKind::Maglev, false, 0x00AB_CDEF).unwrap();
        let bits = flags.pack();
        assert_eq!(bits & 0xF, CodeKind::Maglev as u32);
        assert_eq!((bits >> 5) & 0xFF_FFFF, 0x00AB_CDEF);
        assert_eq!(bits >> 29, 0);
        assert_eq!(InstructionStreamFlags::unpack(bits).unwrap(), flags);
    }

    #[test]
    fn test_stack_slots_out_of_range() {
        let err = InstructionStreamFlags::new(CodeKind::Turbofan, true, 1 << 24).unwrap_err();
        assert_eq!(
            err,
            CodeError::FlagOutOfRange {
                field: "stack_slots",
                value: 1 << 24
            }
        );
        assert!(InstructionStreamFlags::new(CodeKind::Turbofan, true, MAX_STACK_SLOTS).is_ok());
    }

    #[test]
    fn test_unpack_rejects_unknown_kind() {
        assert!(CodeFlags::unpack(15).is_err());
        assert!(InstructionStreamFlags::unpack(1 << 31).is_err());
    }
}
