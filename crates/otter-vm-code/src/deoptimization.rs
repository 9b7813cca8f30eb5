//! Deoptimization data
//!
//! Maps every deoptimization point of an optimized compile back to the
//! interpreter state it replaces. The layout mirrors a fixed array: a header
//! of scalar slots followed by fixed-stride entries.

use std::fmt;
use std::sync::Arc;

use otter_vm_gc::{Strength, Trace, Visitor};

use crate::heap::HeapRef;

/// Offset into a BytecodeArray, or none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BytecodeOffset(i32);

impl BytecodeOffset {
    /// No bytecode offset
    pub const NONE: BytecodeOffset = BytecodeOffset(-1);

    /// Wrap a raw offset
    #[inline]
    pub const fn new(offset: i32) -> Self {
        Self(offset)
    }

    /// Raw value
    #[inline]
    pub const fn to_int(self) -> i32 {
        self.0
    }

    /// True for [`BytecodeOffset::NONE`]
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }
}

impl Default for BytecodeOffset {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for BytecodeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiteralSlot {
    Strong(HeapRef),
    Weak(HeapRef),
    Cleared,
}

/// Literals referenced by translations and inlined functions.
///
/// Each literal is held with the strength decided when it was added; weak
/// literals are cleared by the collector once their target dies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeoptimizationLiteralArray {
    slots: Vec<LiteralSlot>,
}

impl DeoptimizationLiteralArray {
    /// Create an empty literal array
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a literal, returning its index
    pub fn push(&mut self, target: HeapRef, strength: Strength) -> usize {
        self.slots.push(match strength {
            Strength::Strong => LiteralSlot::Strong(target),
            Strength::Weak => LiteralSlot::Weak(target),
        });
        self.slots.len() - 1
    }

    /// Number of literals, cleared ones included
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Literal `index`. A weak literal must not have been cleared; callers
    /// only read literals of code that is still valid.
    pub fn get(&self, index: usize) -> HeapRef {
        match self.try_get(index) {
            Some(target) => target,
            None => panic!("deoptimization literal {index} was cleared"),
        }
    }

    /// Literal `index`, or `None` once cleared
    pub fn try_get(&self, index: usize) -> Option<HeapRef> {
        match self.slots[index] {
            LiteralSlot::Strong(target) | LiteralSlot::Weak(target) => Some(target),
            LiteralSlot::Cleared => None,
        }
    }

    /// Strength literal `index` is held with, `None` once cleared
    pub fn strength(&self, index: usize) -> Option<Strength> {
        match self.slots[index] {
            LiteralSlot::Strong(_) => Some(Strength::Strong),
            LiteralSlot::Weak(_) => Some(Strength::Weak),
            LiteralSlot::Cleared => None,
        }
    }

    /// Clear weak literals whose target is dead, returning how many were
    /// cleared.
    pub fn clear_dead(&mut self, is_live: impl Fn(HeapRef) -> bool) -> usize {
        let mut cleared = 0;
        for slot in &mut self.slots {
            if let LiteralSlot::Weak(target) = *slot {
                if !is_live(target) {
                    *slot = LiteralSlot::Cleared;
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

impl Trace<HeapRef> for DeoptimizationLiteralArray {
    fn trace(&self, visitor: &mut dyn Visitor<HeapRef>) {
        for slot in &self.slots {
            match *slot {
                LiteralSlot::Strong(target) => visitor.visit(target, Strength::Strong),
                LiteralSlot::Weak(target) => visitor.visit(target, Strength::Weak),
                LiteralSlot::Cleared => {}
            }
        }
    }
}

/// Source position of an inlined call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InliningPosition {
    /// Script offset of the call
    pub position: i32,
    /// Index into the literal array, or [`NOT_INLINED_INDEX`]
    pub inlined_function_id: i32,
}

/// Inlined-function index denoting the outermost function
pub const NOT_INLINED_INDEX: i32 = -1;

/// Header slot indices
pub const TRANSLATION_BYTE_ARRAY_INDEX: usize = 0;
#[allow(missing_docs)]
pub const INLINED_FUNCTION_COUNT_INDEX: usize = 1;
#[allow(missing_docs)]
pub const LITERAL_ARRAY_INDEX: usize = 2;
#[allow(missing_docs)]
pub const OSR_BYTECODE_OFFSET_INDEX: usize = 3;
#[allow(missing_docs)]
pub const OSR_PC_OFFSET_INDEX: usize = 4;
#[allow(missing_docs)]
pub const OPTIMIZATION_ID_INDEX: usize = 5;
#[allow(missing_docs)]
pub const SHARED_FUNCTION_INFO_INDEX: usize = 6;
#[allow(missing_docs)]
pub const INLINING_POSITIONS_INDEX: usize = 7;
#[allow(missing_docs)]
pub const DEOPT_EXIT_START_INDEX: usize = 8;
#[allow(missing_docs)]
pub const EAGER_DEOPT_COUNT_INDEX: usize = 9;
#[allow(missing_docs)]
pub const LAZY_DEOPT_COUNT_INDEX: usize = 10;
/// First slot after the header
pub const FIRST_DEOPT_ENTRY_INDEX: usize = 11;

/// Entry field offsets
pub const BYTECODE_OFFSET_RAW_OFFSET: usize = 0;
#[allow(missing_docs)]
pub const TRANSLATION_INDEX_OFFSET: usize = 1;
#[allow(missing_docs)]
pub const PC_OFFSET: usize = 2;
/// Compiler node id, recorded in debug builds only
#[cfg(debug_assertions)]
pub const NODE_ID_OFFSET: usize = 3;

/// Slots per entry
#[cfg(debug_assertions)]
pub const DEOPT_ENTRY_SIZE: usize = 4;
/// Slots per entry
#[cfg(not(debug_assertions))]
pub const DEOPT_ENTRY_SIZE: usize = 3;

/// Deoptimization data of one optimized compile
#[derive(Debug, Clone, PartialEq)]
pub struct DeoptimizationData {
    translation_byte_array: Arc<[u8]>,
    inlined_function_count: i32,
    literal_array: DeoptimizationLiteralArray,
    osr_bytecode_offset: BytecodeOffset,
    osr_pc_offset: i32,
    optimization_id: i32,
    shared_function_info: Option<HeapRef>,
    inlining_positions: Vec<InliningPosition>,
    deopt_exit_start: i32,
    eager_deopt_count: i32,
    lazy_deopt_count: i32,
    entries: Vec<i32>,
}

macro_rules! entry_accessors {
    ($($get:ident, $set:ident, $offset:expr;)*) => {
        $(
            #[allow(missing_docs)]
            #[inline]
            pub fn $get(&self, i: usize) -> i32 {
                self.entries[self.entry_slot(i, $offset)]
            }

            #[allow(missing_docs)]
            #[inline]
            pub fn $set(&mut self, i: usize, value: i32) {
                let slot = self.entry_slot(i, $offset);
                self.entries[slot] = value;
            }
        )*
    };
}

impl DeoptimizationData {
    /// Data with `deopt_entry_count` entries, every bytecode offset none
    pub fn new(deopt_entry_count: usize) -> Self {
        let mut entries = vec![0; deopt_entry_count * DEOPT_ENTRY_SIZE];
        for entry in entries.chunks_exact_mut(DEOPT_ENTRY_SIZE) {
            entry[BYTECODE_OFFSET_RAW_OFFSET] = BytecodeOffset::NONE.to_int();
            entry[PC_OFFSET] = -1;
        }
        Self {
            translation_byte_array: Arc::from(Vec::new()),
            inlined_function_count: 0,
            literal_array: DeoptimizationLiteralArray::new(),
            osr_bytecode_offset: BytecodeOffset::NONE,
            osr_pc_offset: -1,
            optimization_id: 0,
            shared_function_info: None,
            inlining_positions: Vec::new(),
            deopt_exit_start: 0,
            eager_deopt_count: 0,
            lazy_deopt_count: 0,
            entries,
        }
    }

    /// Data without any entry
    pub fn empty() -> Self {
        Self::new(0)
    }

    /// True if there is no entry
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slot count of a data array with `entry_count` entries
    pub const fn length_for(entry_count: usize) -> usize {
        FIRST_DEOPT_ENTRY_INDEX + entry_count * DEOPT_ENTRY_SIZE
    }

    /// Slot count, header included
    pub fn len(&self) -> usize {
        FIRST_DEOPT_ENTRY_INDEX + self.entries.len()
    }

    /// Number of deoptimization entries
    pub fn deopt_count(&self) -> usize {
        debug_assert_eq!(self.entries.len() % DEOPT_ENTRY_SIZE, 0);
        self.entries.len() / DEOPT_ENTRY_SIZE
    }

    #[inline]
    fn entry_slot(&self, i: usize, offset: usize) -> usize {
        assert!(i < self.deopt_count(), "deopt entry {i} out of range");
        i * DEOPT_ENTRY_SIZE + offset
    }

    entry_accessors! {
        bytecode_offset_raw, set_bytecode_offset_raw, BYTECODE_OFFSET_RAW_OFFSET;
        translation_index, set_translation_index, TRANSLATION_INDEX_OFFSET;
        pc, set_pc, PC_OFFSET;
    }

    #[cfg(debug_assertions)]
    entry_accessors! {
        node_id, set_node_id, NODE_ID_OFFSET;
    }

    /// Bytecode offset of entry `i`
    pub fn get_bytecode_offset(&self, i: usize) -> BytecodeOffset {
        BytecodeOffset::new(self.bytecode_offset_raw(i))
    }

    /// Set the bytecode offset of entry `i`
    pub fn set_bytecode_offset(&mut self, i: usize, offset: BytecodeOffset) {
        self.set_bytecode_offset_raw(i, offset.to_int());
    }

    /// Shared translation program
    pub fn translation_byte_array(&self) -> &Arc<[u8]> {
        &self.translation_byte_array
    }

    #[allow(missing_docs)]
    pub fn set_translation_byte_array(&mut self, translations: Arc<[u8]>) {
        self.translation_byte_array = translations;
    }

    #[allow(missing_docs)]
    pub fn inlined_function_count(&self) -> i32 {
        self.inlined_function_count
    }

    #[allow(missing_docs)]
    pub fn set_inlined_function_count(&mut self, count: i32) {
        self.inlined_function_count = count;
    }

    /// Literal array
    pub fn literal_array(&self) -> &DeoptimizationLiteralArray {
        &self.literal_array
    }

    /// Literal array, for weak processing
    pub fn literal_array_mut(&mut self) -> &mut DeoptimizationLiteralArray {
        &mut self.literal_array
    }

    #[allow(missing_docs)]
    pub fn set_literal_array(&mut self, literals: DeoptimizationLiteralArray) {
        self.literal_array = literals;
    }

    #[allow(missing_docs)]
    pub fn osr_bytecode_offset(&self) -> BytecodeOffset {
        self.osr_bytecode_offset
    }

    #[allow(missing_docs)]
    pub fn set_osr_bytecode_offset(&mut self, offset: BytecodeOffset) {
        self.osr_bytecode_offset = offset;
    }

    #[allow(missing_docs)]
    pub fn osr_pc_offset(&self) -> i32 {
        self.osr_pc_offset
    }

    #[allow(missing_docs)]
    pub fn set_osr_pc_offset(&mut self, offset: i32) {
        self.osr_pc_offset = offset;
    }

    #[allow(missing_docs)]
    pub fn optimization_id(&self) -> i32 {
        self.optimization_id
    }

    #[allow(missing_docs)]
    pub fn set_optimization_id(&mut self, id: i32) {
        self.optimization_id = id;
    }

    /// Shared function info of the outermost function
    pub fn shared_function_info(&self) -> Option<HeapRef> {
        self.shared_function_info
    }

    #[allow(missing_docs)]
    pub fn set_shared_function_info(&mut self, shared: HeapRef) {
        self.shared_function_info = Some(shared);
    }

    #[allow(missing_docs)]
    pub fn inlining_positions(&self) -> &[InliningPosition] {
        &self.inlining_positions
    }

    #[allow(missing_docs)]
    pub fn set_inlining_positions(&mut self, positions: Vec<InliningPosition>) {
        self.inlining_positions = positions;
    }

    #[allow(missing_docs)]
    pub fn deopt_exit_start(&self) -> i32 {
        self.deopt_exit_start
    }

    #[allow(missing_docs)]
    pub fn set_deopt_exit_start(&mut self, start: i32) {
        self.deopt_exit_start = start;
    }

    #[allow(missing_docs)]
    pub fn eager_deopt_count(&self) -> i32 {
        self.eager_deopt_count
    }

    #[allow(missing_docs)]
    pub fn set_eager_deopt_count(&mut self, count: i32) {
        self.eager_deopt_count = count;
    }

    #[allow(missing_docs)]
    pub fn lazy_deopt_count(&self) -> i32 {
        self.lazy_deopt_count
    }

    #[allow(missing_docs)]
    pub fn set_lazy_deopt_count(&mut self, count: i32) {
        self.lazy_deopt_count = count;
    }

    /// Function at inlining `index`; [`NOT_INLINED_INDEX`] is the outermost.
    pub fn get_inlined_function(&self, index: i32) -> HeapRef {
        if index == NOT_INLINED_INDEX {
            match self.shared_function_info {
                Some(shared) => shared,
                None => panic!("deoptimization data without a shared function info"),
            }
        } else {
            assert!(index >= 0, "bad inlined function index {index}");
            self.literal_array.get(index as usize)
        }
    }

    /// True if some entry with a bytecode offset sits at `pc_offset`
    pub fn has_entry_at(&self, pc_offset: usize) -> bool {
        (0..self.deopt_count()).any(|i| {
            let pc = self.pc(i);
            pc != -1 && pc as usize == pc_offset && !self.get_bytecode_offset(i).is_none()
        })
    }
}

impl Trace<HeapRef> for DeoptimizationData {
    fn trace(&self, visitor: &mut dyn Visitor<HeapRef>) {
        self.literal_array.trace(visitor);
        if let Some(shared) = self.shared_function_info {
            visitor.visit(shared, Strength::Strong);
        }
    }
}
