//! Isolate: the context every code lookup goes through
//!
//! An `Isolate` owns one heap, the builtin blobs it executes from, the Code
//! handles of those builtins and the queue background compilers hand their
//! results to. There is no process-wide code table; whoever needs to resolve
//! a pc or a builtin is given the isolate.
//!
//! # Thread Safety Model
//!
//! - **`Isolate`** has a single writer. It may move between threads but is
//!   mutated through `&mut self` only.
//! - **`InstallQueue`** is shared as an `Arc` and accepts finished jobs from
//!   any thread; the isolate installs them in [`Isolate::install_pending`].
//! - **Entry points** of installed Code are published with a release store,
//!   so a reader holding `&Code` sees the old or the new entry, never a mix.

use std::sync::Arc;

use otter_vm_bytecode::BytecodeArray;
use otter_vm_gc::{CycleSummary, GcStats, Handle, Strength};

use crate::code::{Code, CodeView};
use crate::config::IsolateConfig;
use crate::dependent_code::DependencyGroups;
use crate::deoptimization::DeoptimizationLiteralArray;
use crate::deoptimizer::Deoptimizer;
use crate::embedded::{BuiltinBlobs, EmbeddedData};
use crate::error::{CodeError, Result};
use crate::factory::CodeBuilder;
use crate::flags::CodeFlags;
use crate::globals::Address;
use crate::heap::{Heap, HeapObject, HeapRef, ObjectKind};
use crate::install_queue::{InstallQueue, InstallTicket};
use crate::kind::{BUILTIN_COUNT, Builtin, CodeKind};
use crate::lookup::CodeLookupResult;

/// One independent heap with its code
#[derive(Debug)]
pub struct Isolate {
    pub(crate) config: IsolateConfig,
    pub(crate) heap: Heap,
    pub(crate) blobs: BuiltinBlobs,
    /// Indexed by builtin id
    pub(crate) builtin_codes: Vec<Option<Handle<Code>>>,
    pub(crate) roots: Vec<HeapRef>,
    pub(crate) stats: GcStats,
    install_queue: Arc<InstallQueue>,
}

impl Isolate {
    /// Create an isolate executing builtins from `embedded`.
    ///
    /// Every builtin in the blob gets an off-heap Code handle whose entry
    /// point is in the isolate's canonical blob.
    pub fn new(config: IsolateConfig, embedded: Arc<EmbeddedData>) -> Result<Self> {
        let blobs = BuiltinBlobs::new(embedded, config.short_builtin_calls)?;
        let mut heap = Heap::with_capacity(config.gc.initial_space_capacity);
        let mut builtin_codes = vec![None; BUILTIN_COUNT];

        let canonical = blobs.canonical();
        for builtin in canonical.builtins() {
            let code = Code::new(CodeFlags::new(CodeKind::Builtin, false, true), Some(builtin));
            code.set_is_promise_rejection(builtin.is_promise_rejection());
            code.set_entry_point_for_off_heap_builtin(canonical.instruction_start_of(builtin));
            builtin_codes[builtin.id() as usize] = Some(heap.codes.insert(code));
        }

        tracing::debug!(
            target: "otter::code",
            builtins = heap.codes.len(),
            short_builtin_calls = blobs.is_short_builtin_calls_enabled(),
            "created isolate"
        );
        Ok(Self {
            config,
            heap,
            blobs,
            builtin_codes,
            roots: Vec::new(),
            stats: GcStats::default(),
            install_queue: Arc::new(InstallQueue::new()),
        })
    }

    /// Configuration the isolate was created with
    #[inline]
    pub fn config(&self) -> &IsolateConfig {
        &self.config
    }

    /// The heap
    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap. Use the isolate's allocation methods to add objects so
    /// collection is triggered on schedule.
    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The builtin blobs
    #[inline]
    pub fn blobs(&self) -> &BuiltinBlobs {
        &self.blobs
    }

    /// Collection statistics
    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub(crate) fn note_allocation(&mut self) {
        self.stats.note_allocation();
    }

    /// Keep `root` alive across collections
    pub fn add_root(&mut self, root: impl Into<HeapRef>) {
        self.roots.push(root.into());
    }

    /// Drop one registration of `root`. Returns false if it was not a root.
    pub fn remove_root(&mut self, root: impl Into<HeapRef>) -> bool {
        let root = root.into();
        match self.roots.iter().position(|r| *r == root) {
            Some(index) => {
                self.roots.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Registered roots
    pub fn roots(&self) -> &[HeapRef] {
        &self.roots
    }

    /// Allocate a plain object
    pub fn allocate_object(&mut self, kind: ObjectKind) -> Handle<HeapObject> {
        self.note_allocation();
        self.heap.objects.insert(HeapObject::new(kind))
    }

    /// Move `bytecode` onto the heap
    pub fn allocate_bytecode(&mut self, bytecode: BytecodeArray) -> Handle<BytecodeArray> {
        self.note_allocation();
        self.heap.bytecodes.insert(bytecode)
    }

    /// Code behind `handle`
    pub fn code(&self, handle: Handle<Code>) -> Option<&Code> {
        self.heap.codes.get(handle)
    }

    /// `handle` resolved against this isolate
    pub fn code_view(&self, handle: Handle<Code>) -> Option<CodeView<'_>> {
        CodeView::new(handle, &self.heap, &self.blobs)
    }

    /// Code handle of an embedded builtin
    pub fn builtin_code(&self, builtin: Builtin) -> Option<Handle<Code>> {
        self.builtin_codes[builtin.id() as usize]
    }

    /// Handles of every embedded builtin
    pub fn builtin_codes(&self) -> impl Iterator<Item = Handle<Code>> + '_ {
        self.builtin_codes.iter().flatten().copied()
    }

    /// Resolve `pc` to the code executing there: embedded builtins first,
    /// in whichever blob copy the pc falls, then installed streams.
    pub fn lookup_code(&self, pc: Address) -> CodeLookupResult<'_> {
        if let Some(view) = self
            .blobs
            .try_lookup_builtin(pc)
            .and_then(|builtin| self.builtin_code(builtin))
            .and_then(|handle| self.code_view(handle))
        {
            return CodeLookupResult::Code(view);
        }
        match self.heap.code_ranges.find(pc).and_then(|h| self.heap.streams.get(h)) {
            Some(stream) => CodeLookupResult::InstructionStream(stream),
            None => CodeLookupResult::NotFound,
        }
    }

    /// Record that `code` relies on `groups` of `object`'s properties
    pub fn install_dependency(
        &mut self,
        code: Handle<Code>,
        object: Handle<HeapObject>,
        groups: DependencyGroups,
    ) -> Result<()> {
        let Heap { objects, codes, .. } = &mut self.heap;
        let kind = codes.get(code).ok_or(CodeError::StaleHandle("code"))?.kind();
        if !kind.can_deoptimize() {
            return Err(CodeError::CannotDeoptimize(kind));
        }
        let object = objects.get_mut(object).ok_or(CodeError::StaleHandle("object"))?;
        object.dependent_code_mut().insert_weak_code(code, groups, codes);
        Ok(())
    }

    /// Mark every live code depending on `groups` of `object` for
    /// deoptimization. The deoptimizer is only invoked if something was
    /// newly marked; the return value says whether it was.
    pub fn deoptimize_dependency_groups(
        &mut self,
        object: Handle<HeapObject>,
        groups: DependencyGroups,
        deoptimizer: &mut dyn Deoptimizer,
    ) -> bool {
        let Heap { objects, codes, .. } = &mut self.heap;
        let Some(object) = objects.get_mut(object) else {
            return false;
        };
        let marked = object
            .dependent_code_mut()
            .mark_code_for_deoptimization(groups, codes);
        if marked {
            tracing::debug!(
                target: "otter::deopt",
                groups = groups.group_name(),
                "dependency groups invalidated"
            );
            deoptimizer.deoptimize_marked_code(self);
        }
        marked
    }

    /// Strength a deoptimization literal pointing at `target` is held with
    pub fn deoptimization_literal_strength(&self, target: HeapRef) -> Strength {
        match self.heap.object_kind(target) {
            Some(kind) if kind.is_weak_deopt_literal() => Strength::Weak,
            _ => Strength::Strong,
        }
    }

    /// Append `target` to `literals` with the strength its kind calls for
    pub fn add_deoptimization_literal(
        &self,
        literals: &mut DeoptimizationLiteralArray,
        target: HeapRef,
    ) -> usize {
        literals.push(target, self.deoptimization_literal_strength(target))
    }

    /// Queue shared with background compilers
    pub fn install_queue(&self) -> Arc<InstallQueue> {
        Arc::clone(&self.install_queue)
    }

    /// Install every queued job, oldest first
    pub fn install_pending(&mut self) -> Vec<(InstallTicket, Result<Handle<Code>>)> {
        let jobs = self.install_queue.drain();
        if jobs.is_empty() {
            return Vec::new();
        }
        tracing::debug!(target: "otter::code", jobs = jobs.len(), "installing queued code");
        jobs.into_iter()
            .map(|(ticket, job)| {
                let result = job.build(self);
                if let Err(error) = &result {
                    tracing::warn!(
                        target: "otter::code",
                        ticket = ticket.as_u64(),
                        %error,
                        "queued code failed to install"
                    );
                }
                (ticket, result)
            })
            .collect()
    }

    /// Collect if enough allocations happened since the last collection
    pub fn maybe_collect_garbage(&mut self) -> Option<CycleSummary> {
        self.stats
            .should_collect(self.config.gc.collection_threshold)
            .then(|| self.collect_garbage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{CodeDesc, CodeDescBuilder};
    use crate::deoptimizer::DeoptimizationLog;
    use crate::handler_table::CatchPrediction;

    fn builtin_desc(len: usize) -> CodeDesc {
        let mut builder = CodeDescBuilder::new();
        builder.emit(&vec![0xCC; len]);
        builder.finish()
    }

    fn embedded() -> Arc<EmbeddedData> {
        Arc::new(
            EmbeddedData::new(vec![
                (Builtin::CEntry, builtin_desc(16)),
                (Builtin::PromiseReject, builtin_desc(8)),
            ])
            .unwrap(),
        )
    }

    fn code_desc() -> CodeDesc {
        let mut builder = CodeDescBuilder::new();
        builder.emit(&[0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3]);
        builder.finish()
    }

    #[test]
    fn test_builtins_get_off_heap_codes() {
        let isolate = Isolate::new(IsolateConfig::default(), embedded()).unwrap();
        let handle = isolate.builtin_code(Builtin::PromiseReject).unwrap();
        let code = isolate.code(handle).unwrap();
        assert!(code.is_off_heap_trampoline());
        assert!(!code.has_instruction_stream());
        assert_eq!(code.get_builtin_catch_prediction(), CatchPrediction::Promise);
        assert_eq!(
            code.entry_point(),
            isolate.blobs().canonical().instruction_start_of(Builtin::PromiseReject)
        );
        assert!(isolate.builtin_code(Builtin::StackCheck).is_none());
        assert_eq!(isolate.builtin_codes().count(), 2);
    }

    #[test]
    fn test_lookup_prefers_builtins_then_streams() {
        let mut isolate = Isolate::new(IsolateConfig::default(), embedded()).unwrap();
        let entry = isolate.blobs().canonical().instruction_start_of(Builtin::CEntry);
        let found = isolate.lookup_code(entry + 3);
        assert_eq!(found.builtin(), Some(Builtin::CEntry));
        assert!(found.code().is_some());

        let handle = CodeBuilder::new(CodeKind::ForTesting, code_desc())
            .build(&mut isolate)
            .unwrap();
        let start = isolate.code(handle).unwrap().entry_point();
        let found = isolate.lookup_code(start + 5);
        assert_eq!(found.code_handle(), Some(handle));
        assert_eq!(found.get_offset_from_instruction_start(start + 5), 5);
        assert!(!isolate.lookup_code(start + 6).is_found());
    }

    #[test]
    fn test_roots() {
        let mut isolate = Isolate::new(IsolateConfig::default(), embedded()).unwrap();
        let object = isolate.allocate_object(ObjectKind::Map);
        isolate.add_root(object);
        assert_eq!(isolate.roots(), &[HeapRef::Object(object)]);
        assert!(isolate.remove_root(object));
        assert!(!isolate.remove_root(object));
    }

    #[test]
    fn test_deoptimizer_runs_only_when_something_was_marked() {
        let mut isolate = Isolate::new(IsolateConfig::default(), embedded()).unwrap();
        let code = CodeBuilder::new(CodeKind::Maglev, code_desc())
            .build(&mut isolate)
            .unwrap();
        let map = isolate.allocate_object(ObjectKind::Map);
        isolate
            .install_dependency(code, map, DependencyGroups::FIELD_TYPE)
            .unwrap();

        let mut log = DeoptimizationLog::new();
        assert!(!isolate.deoptimize_dependency_groups(map, DependencyGroups::TRANSITION, &mut log));
        assert_eq!(log.requests(), 0);
        assert!(isolate.deoptimize_dependency_groups(map, DependencyGroups::FIELD_TYPE, &mut log));
        assert_eq!(log.requests(), 1);
        assert!(log.contains(code));
        assert_eq!(log.events()[0].reason, "code dependencies");
    }

    #[test]
    fn test_literal_strength_follows_kind() {
        let mut isolate = Isolate::new(IsolateConfig::default(), embedded()).unwrap();
        let cell = isolate.allocate_object(ObjectKind::PropertyCell);
        let map = isolate.allocate_object(ObjectKind::Map);
        let mut literals = DeoptimizationLiteralArray::new();
        let weak = isolate.add_deoptimization_literal(&mut literals, cell.into());
        let strong = isolate.add_deoptimization_literal(&mut literals, map.into());
        assert_eq!(literals.strength(weak), Some(Strength::Weak));
        assert_eq!(literals.strength(strong), Some(Strength::Strong));
    }

    #[test]
    fn test_install_pending() {
        let mut isolate = Isolate::new(IsolateConfig::default(), embedded()).unwrap();
        let queue = isolate.install_queue();
        let ticket = queue.submit(CodeBuilder::new(CodeKind::ForTesting, code_desc()));
        let installed = isolate.install_pending();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].0, ticket);
        assert!(installed[0].1.is_ok());
        assert!(isolate.install_pending().is_empty());
    }
}
