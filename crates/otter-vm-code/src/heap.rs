//! Heap objects the code layer refers to
//!
//! Every collectible object lives in a [`Space`] and is addressed by a
//! generational handle. [`HeapRef`] is the untyped edge the tracer walks.

use std::collections::BTreeMap;
use std::ops::Bound;

use otter_vm_bytecode::BytecodeArray;
use otter_vm_gc::{Handle, Space, Strength, Trace, Visitor};
use parking_lot::RwLock;

use crate::code::Code;
use crate::dependent_code::DependentCode;
use crate::globals::Address;
use crate::instruction_stream::InstructionStream;

/// Reference to any collectible object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapRef {
    /// Plain heap object
    Object(Handle<HeapObject>),
    /// Code handle
    Code(Handle<Code>),
    /// Instruction stream
    Stream(Handle<InstructionStream>),
    /// Interpreter bytecode
    Bytecode(Handle<BytecodeArray>),
}

impl From<Handle<HeapObject>> for HeapRef {
    fn from(handle: Handle<HeapObject>) -> Self {
        HeapRef::Object(handle)
    }
}

impl From<Handle<Code>> for HeapRef {
    fn from(handle: Handle<Code>) -> Self {
        HeapRef::Code(handle)
    }
}

impl From<Handle<BytecodeArray>> for HeapRef {
    fn from(handle: Handle<BytecodeArray>) -> Self {
        HeapRef::Bytecode(handle)
    }
}

/// Shape of a plain heap object, as far as code cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Hidden class
    Map,
    /// Global property cell
    PropertyCell,
    /// Any JS object
    JsReceiver,
    /// Function metadata shared between closures
    SharedFunctionInfo,
    /// Allocation site feedback
    AllocationSite,
    /// Everything else
    Other,
}

impl ObjectKind {
    /// Optimized code that may hold weak objects embeds these weakly
    pub const fn is_weak_embedding_target(self) -> bool {
        matches!(
            self,
            ObjectKind::Map | ObjectKind::PropertyCell | ObjectKind::JsReceiver
        )
    }

    /// Deoptimization literals of these kinds are held weakly
    pub const fn is_weak_deopt_literal(self) -> bool {
        matches!(self, ObjectKind::PropertyCell | ObjectKind::JsReceiver)
    }
}

/// A plain heap object: a kind, strong fields and the code depending on it
#[derive(Debug, Clone)]
pub struct HeapObject {
    kind: ObjectKind,
    /// Strong outgoing references
    pub fields: Vec<HeapRef>,
    dependent_code: DependentCode,
}

impl HeapObject {
    /// Object without fields or dependents
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
            dependent_code: DependentCode::new(),
        }
    }

    /// Object kind
    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Code depending on this object
    #[inline]
    pub fn dependent_code(&self) -> &DependentCode {
        &self.dependent_code
    }

    /// Mutable dependent code list
    #[inline]
    pub fn dependent_code_mut(&mut self) -> &mut DependentCode {
        &mut self.dependent_code
    }
}

impl Trace<HeapRef> for HeapObject {
    fn trace(&self, visitor: &mut dyn Visitor<HeapRef>) {
        for field in &self.fields {
            visitor.visit(*field, Strength::Strong);
        }
        self.dependent_code.trace(visitor);
    }
}

impl Trace<HeapRef> for BytecodeArray {
    // constant pool entries are immediates, nothing to report
    fn trace(&self, _visitor: &mut dyn Visitor<HeapRef>) {}
}

/// Instruction ranges of installed streams, keyed by instruction start
#[derive(Debug, Default)]
pub struct CodeRangeMap {
    ranges: RwLock<BTreeMap<Address, (Address, Handle<InstructionStream>)>>,
}

impl CodeRangeMap {
    /// Register `[start, end)`
    pub fn register(&self, start: Address, end: Address, stream: Handle<InstructionStream>) {
        debug_assert!(start <= end);
        let previous = self.ranges.write().insert(start, (end, stream));
        debug_assert!(previous.is_none(), "code range registered twice at {start:#x}");
    }

    /// Forget the range starting at `start`
    pub fn unregister(&self, start: Address) -> Option<Handle<InstructionStream>> {
        self.ranges.write().remove(&start).map(|(_, stream)| stream)
    }

    /// Stream whose instructions contain `pc`
    pub fn find(&self, pc: Address) -> Option<Handle<InstructionStream>> {
        let ranges = self.ranges.read();
        let (_, &(end, stream)) = ranges.range((Bound::Unbounded, Bound::Included(pc))).next_back()?;
        (pc < end).then_some(stream)
    }

    /// Number of registered ranges
    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All spaces of one isolate
#[derive(Debug)]
pub struct Heap {
    /// Plain objects
    pub objects: Space<HeapObject>,
    /// Code handles
    pub codes: Space<Code>,
    /// Instruction streams
    pub streams: Space<InstructionStream>,
    /// Bytecode arrays
    pub bytecodes: Space<BytecodeArray>,
    /// Instruction ranges of `streams`
    pub code_ranges: CodeRangeMap,
}

impl Heap {
    /// Empty heap with `capacity` slots reserved per space
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            objects: Space::with_capacity("objects", capacity),
            codes: Space::with_capacity("code", capacity),
            streams: Space::with_capacity("instruction_streams", capacity),
            bytecodes: Space::with_capacity("bytecode", capacity),
            code_ranges: CodeRangeMap::default(),
        }
    }

    /// True if `target` still resolves
    pub fn contains(&self, target: HeapRef) -> bool {
        match target {
            HeapRef::Object(handle) => self.objects.contains(handle),
            HeapRef::Code(handle) => self.codes.contains(handle),
            HeapRef::Stream(handle) => self.streams.contains(handle),
            HeapRef::Bytecode(handle) => self.bytecodes.contains(handle),
        }
    }

    /// Kind of the plain object behind `target`, if it is one
    pub fn object_kind(&self, target: HeapRef) -> Option<ObjectKind> {
        match target {
            HeapRef::Object(handle) => self.objects.get(handle).map(HeapObject::kind),
            _ => None,
        }
    }

    /// Total number of live objects
    pub fn len(&self) -> usize {
        self.objects.len() + self.codes.len() + self.streams.len() + self.bytecodes.len()
    }

    /// True if every space is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_policy_by_kind() {
        assert!(ObjectKind::Map.is_weak_embedding_target());
        assert!(!ObjectKind::Map.is_weak_deopt_literal());
        assert!(ObjectKind::PropertyCell.is_weak_deopt_literal());
        assert!(ObjectKind::JsReceiver.is_weak_deopt_literal());
        assert!(!ObjectKind::SharedFunctionInfo.is_weak_embedding_target());
        assert!(!ObjectKind::Other.is_weak_deopt_literal());
    }

    #[test]
    fn test_code_range_lookup() {
        let a = Handle::from_bits(1);
        let b = Handle::from_bits(2);
        let map = CodeRangeMap::default();
        map.register(0x1000, 0x1040, a);
        map.register(0x2000, 0x2100, b);

        assert_eq!(map.find(0x0fff), None);
        assert_eq!(map.find(0x1000), Some(a));
        assert_eq!(map.find(0x103f), Some(a));
        assert_eq!(map.find(0x1040), None);
        assert_eq!(map.find(0x20ff), Some(b));
        assert_eq!(map.unregister(0x1000), Some(a));
        assert_eq!(map.find(0x1000), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_object_fields_are_strong() {
        struct Collect(Vec<(HeapRef, Strength)>);
        impl Visitor<HeapRef> for Collect {
            fn visit(&mut self, target: HeapRef, strength: Strength) {
                self.0.push((target, strength));
            }
        }

        let mut objects = Space::new("objects");
        let leaf = objects.insert(HeapObject::new(ObjectKind::Other));
        let mut object = HeapObject::new(ObjectKind::JsReceiver);
        object.fields.push(leaf.into());

        let mut seen = Collect(Vec::new());
        object.trace(&mut seen);
        assert_eq!(seen.0, vec![(HeapRef::Object(leaf), Strength::Strong)]);
    }
}
