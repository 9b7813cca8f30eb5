//! Code: the small handle every caller goes through
//!
//! A Code caches its entry point and either owns an [`InstructionStream`]
//! or, for builtins, redirects into the embedded blob. The entry point is
//! published with a release store once everything it points at is written;
//! readers use an acquire load.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use otter_vm_bytecode::BytecodeArray;
use otter_vm_gc::{Handle, Space, Strength, Trace, Visitor};

use crate::baseline::{
    BytecodeToPcPosition, FUNCTION_EXIT_BYTECODE_OFFSET, bytecode_offset_for_pc,
    pc_for_bytecode_offset, pc_for_next_executed_bytecode,
};
use crate::deoptimization::DeoptimizationData;
use crate::embedded::BuiltinBlobs;
use crate::flags::{CodeFlags, KindSpecificFlags};
use crate::globals::{Address, NULL_ADDRESS};
use crate::handler_table::{CatchPrediction, HandlerInfo, HandlerTable};
use crate::heap::{Heap, HeapRef};
use crate::instruction_stream::{CodeMetadata, InstructionStream};
use crate::kind::{Builtin, CodeKind};
use crate::layout::CodeRegion;
use crate::safepoint::{MaglevSafepointEntry, MaglevSafepointTable, SafepointEntry, SafepointTable};

/// Handle object for one piece of compiled code
#[derive(Debug)]
pub struct Code {
    instruction_stream: Option<Handle<InstructionStream>>,
    entry_point: AtomicUsize,
    flags: CodeFlags,
    builtin: Option<Builtin>,
    kind_specific_flags: AtomicU32,
    deopt_reason: OnceLock<String>,
}

impl Code {
    pub(crate) fn new(flags: CodeFlags, builtin: Option<Builtin>) -> Self {
        Self {
            instruction_stream: None,
            entry_point: AtomicUsize::new(NULL_ADDRESS),
            flags,
            builtin,
            kind_specific_flags: AtomicU32::new(0),
            deopt_reason: OnceLock::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_testing(kind: CodeKind) -> Self {
        Self::new(CodeFlags::new(kind, kind == CodeKind::Turbofan, false), None)
    }

    /// Flag word
    #[inline]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// Code kind
    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.flags.kind
    }

    /// Builtin id, if this is a builtin
    #[inline]
    pub fn builtin(&self) -> Option<Builtin> {
        self.builtin
    }

    /// True for builtins
    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.builtin.is_some()
    }

    /// Produced by the top-tier optimizing compiler
    #[inline]
    pub fn is_turbofanned(&self) -> bool {
        self.flags.is_turbofanned
    }

    /// Body lives in the embedded blob
    #[inline]
    pub fn is_off_heap_trampoline(&self) -> bool {
        self.flags.is_off_heap_trampoline
    }

    /// Owned body, absent for off-heap builtins
    #[inline]
    pub fn instruction_stream(&self) -> Option<Handle<InstructionStream>> {
        self.instruction_stream
    }

    /// True if this code owns a body
    #[inline]
    pub fn has_instruction_stream(&self) -> bool {
        self.instruction_stream.is_some()
    }

    /// Published entry point
    #[inline]
    pub fn entry_point(&self) -> Address {
        self.entry_point.load(Ordering::Acquire)
    }

    /// Attach the body and publish its entry point
    pub fn set_instruction_stream_and_entry_point(
        &mut self,
        stream: Handle<InstructionStream>,
        entry_point: Address,
    ) {
        assert!(!self.is_off_heap_trampoline(), "off-heap builtins have no stream");
        self.instruction_stream = Some(stream);
        self.entry_point.store(entry_point, Ordering::Release);
    }

    /// Publish an entry point inside the embedded blob
    pub fn set_entry_point_for_off_heap_builtin(&self, entry_point: Address) {
        assert!(self.is_off_heap_trampoline(), "not an off-heap builtin");
        debug_assert!(self.instruction_stream.is_none());
        self.entry_point.store(entry_point, Ordering::Release);
    }

    /// Republish the entry point after the body moved
    pub fn update_code_entry_point(&self, entry_point: Address) {
        self.entry_point.store(entry_point, Ordering::Release);
    }

    /// Current kind-specific flags
    #[inline]
    pub fn kind_specific_flags(&self) -> KindSpecificFlags {
        KindSpecificFlags::from_bits_retain(self.kind_specific_flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: KindSpecificFlags) -> KindSpecificFlags {
        KindSpecificFlags::from_bits_retain(
            self.kind_specific_flags.fetch_or(flags.bits(), Ordering::AcqRel),
        )
    }

    fn clear_flags(&self, flags: KindSpecificFlags) {
        self.kind_specific_flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// True once the code must no longer be entered
    #[inline]
    pub fn marked_for_deoptimization(&self) -> bool {
        self.kind_specific_flags()
            .contains(KindSpecificFlags::MARKED_FOR_DEOPTIMIZATION)
    }

    /// Mark for deoptimization. Returns true if the flag was not set before;
    /// only the first reason is kept.
    pub fn set_marked_for_deoptimization(&self, reason: &str) -> bool {
        debug_assert!(self.kind().can_deoptimize(), "{} code cannot deoptimize", self.kind());
        let previous = self.set_flags(KindSpecificFlags::MARKED_FOR_DEOPTIMIZATION);
        if previous.contains(KindSpecificFlags::MARKED_FOR_DEOPTIMIZATION) {
            return false;
        }
        let _ = self.deopt_reason.set(reason.to_string());
        tracing::debug!(
            target: "otter::deopt",
            kind = %self.kind(),
            entry = format_args!("{:#x}", self.entry_point()),
            reason,
            "marked code for deoptimization"
        );
        true
    }

    /// Reason given when the code was first marked
    pub fn deopt_reason(&self) -> Option<&str> {
        self.deopt_reason.get().map(String::as_str)
    }

    /// True once the GC wiped the embedded object slots
    #[inline]
    pub fn embedded_objects_cleared(&self) -> bool {
        self.kind_specific_flags()
            .contains(KindSpecificFlags::EMBEDDED_OBJECTS_CLEARED)
    }

    /// Record that embedded objects were cleared. Only valid on code that is
    /// already marked for deoptimization.
    pub fn set_embedded_objects_cleared(&self) {
        assert!(
            self.marked_for_deoptimization(),
            "embedded objects cleared on live code"
        );
        self.set_flags(KindSpecificFlags::EMBEDDED_OBJECTS_CLEARED);
    }

    /// True if maps, property cells and receivers are embedded weakly
    #[inline]
    pub fn can_have_weak_objects(&self) -> bool {
        self.kind_specific_flags()
            .contains(KindSpecificFlags::CAN_HAVE_WEAK_OBJECTS)
    }

    /// Set the weak embedding flag; optimized code only
    pub fn set_can_have_weak_objects(&self, value: bool) {
        debug_assert!(self.kind().is_optimized_js_function());
        if value {
            self.set_flags(KindSpecificFlags::CAN_HAVE_WEAK_OBJECTS);
        } else {
            self.clear_flags(KindSpecificFlags::CAN_HAVE_WEAK_OBJECTS);
        }
    }

    /// True if exceptions thrown here reject a promise
    #[inline]
    pub fn is_promise_rejection(&self) -> bool {
        self.kind_specific_flags()
            .contains(KindSpecificFlags::IS_PROMISE_REJECTION)
    }

    /// Set the promise rejection flag; builtins only
    pub fn set_is_promise_rejection(&self, value: bool) {
        debug_assert_eq!(self.kind(), CodeKind::Builtin);
        if value {
            self.set_flags(KindSpecificFlags::IS_PROMISE_REJECTION);
        } else {
            self.clear_flags(KindSpecificFlags::IS_PROMISE_REJECTION);
        }
    }

    /// Catch prediction the unwinder uses for a builtin frame
    pub fn get_builtin_catch_prediction(&self) -> CatchPrediction {
        if self.is_promise_rejection() {
            CatchPrediction::Promise
        } else {
            CatchPrediction::Uncaught
        }
    }

    /// True for the interpreter entry trampolines
    pub fn is_interpreter_trampoline_builtin(&self) -> bool {
        self.builtin.is_some_and(Builtin::is_interpreter_trampoline)
    }

    /// True for the baseline entry trampolines
    pub fn is_baseline_trampoline_builtin(&self) -> bool {
        self.builtin.is_some_and(Builtin::is_baseline_trampoline)
    }

    /// True for the builtin that leaves a baseline frame
    pub fn is_baseline_leave_frame_builtin(&self) -> bool {
        self.builtin == Some(Builtin::BaselineLeaveFrame)
    }

    /// True if entering this code checks the function's tiering state
    pub fn checks_tiering_state(&self) -> bool {
        matches!(
            self.builtin,
            Some(Builtin::CompileLazy | Builtin::InterpreterEntryTrampoline)
        ) || self.kind().can_tier_up()
    }

    /// True if outgoing call parameters are tagged values
    pub fn has_tagged_outgoing_params(&self) -> bool {
        !matches!(
            self.kind(),
            CodeKind::JsToWasmFunction | CodeKind::CWasmEntry | CodeKind::WasmFunction
        )
    }

    /// True if frames of this code are described by a safepoint table
    pub fn uses_safepoint_table(&self) -> bool {
        self.is_turbofanned() || self.kind() == CodeKind::Maglev || self.kind().is_wasm()
    }
}

impl Trace<HeapRef> for Code {
    fn trace(&self, visitor: &mut dyn Visitor<HeapRef>) {
        if let Some(stream) = self.instruction_stream {
            visitor.visit(HeapRef::Stream(stream), Strength::Strong);
        }
    }
}

/// A Code resolved against its heap and builtin blobs.
///
/// Every query that depends on where the instructions are goes through
/// here. Queries taking a pc pick the blob copy that pc executes in, so
/// the same builtin answers correctly whichever copy is on the stack.
#[derive(Debug, Clone, Copy)]
pub struct CodeView<'a> {
    handle: Handle<Code>,
    code: &'a Code,
    stream: Option<&'a InstructionStream>,
    blobs: &'a BuiltinBlobs,
    bytecodes: &'a Space<BytecodeArray>,
}

impl<'a> CodeView<'a> {
    /// Resolve `handle`; `None` if it is stale
    pub fn new(handle: Handle<Code>, heap: &'a Heap, blobs: &'a BuiltinBlobs) -> Option<Self> {
        let code = heap.codes.get(handle)?;
        let stream = match code.instruction_stream {
            Some(stream) => Some(heap.streams.get(stream)?),
            None => None,
        };
        Some(Self {
            handle,
            code,
            stream,
            blobs,
            bytecodes: &heap.bytecodes,
        })
    }

    /// Handle this view was made from
    #[inline]
    pub fn handle(&self) -> Handle<Code> {
        self.handle
    }

    /// The Code object
    #[inline]
    pub fn code(&self) -> &'a Code {
        self.code
    }

    /// The owned body, if any
    #[inline]
    pub fn instruction_stream(&self) -> Option<&'a InstructionStream> {
        self.stream
    }

    /// Code kind
    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.code.kind()
    }

    /// Builtin id
    #[inline]
    pub fn builtin(&self) -> Option<Builtin> {
        self.code.builtin()
    }

    fn off_heap_builtin(&self) -> Builtin {
        match self.code.builtin() {
            Some(builtin) => builtin,
            None => panic!("code has neither a stream nor a builtin id"),
        }
    }

    /// Layout of the canonical copy
    pub fn region(&self) -> CodeRegion<'a> {
        match self.stream {
            Some(stream) => stream.region(),
            None => self.blobs.canonical().region(self.off_heap_builtin()),
        }
    }

    /// Layout of the copy `pc` executes in
    pub fn region_for_pc(&self, pc: Address) -> CodeRegion<'a> {
        match self.stream {
            Some(stream) => stream.region(),
            None => self
                .blobs
                .embedded_data_for_pc(pc)
                .region(self.off_heap_builtin()),
        }
    }

    /// First instruction of the canonical copy
    pub fn instruction_start(&self) -> Address {
        self.region().instruction_start()
    }

    /// End of the canonical copy's instructions
    pub fn instruction_end(&self) -> Address {
        self.region().instruction_end()
    }

    /// Instruction size
    pub fn instruction_size(&self) -> usize {
        self.region().instruction_size()
    }

    /// First instruction of the copy `pc` executes in
    pub fn instruction_start_for_pc(&self, pc: Address) -> Address {
        self.region_for_pc(pc).instruction_start()
    }

    /// End of the instructions of the copy `pc` executes in
    pub fn instruction_end_for_pc(&self, pc: Address) -> Address {
        self.region_for_pc(pc).instruction_end()
    }

    /// True if `pc` is one of this code's instructions, in either copy
    pub fn contains(&self, pc: Address) -> bool {
        self.region_for_pc(pc).contains(pc)
    }

    /// Offset of `pc` from the start of the copy it belongs to. A return
    /// address just past the last instruction is accepted.
    pub fn get_offset_from_instruction_start(&self, pc: Address) -> usize {
        let region = self.region_for_pc(pc);
        assert!(
            region.instruction_start() <= pc && pc <= region.instruction_end(),
            "pc {pc:#x} is not in this code"
        );
        pc - region.instruction_start()
    }

    /// Safepoint entry recorded for `pc`
    pub fn safepoint_entry(&self, pc: Address) -> SafepointEntry {
        assert!(self.code.uses_safepoint_table(), "{} code has no safepoint table", self.kind());
        assert_ne!(self.kind(), CodeKind::Maglev, "maglev code uses its own table");
        let offset = self.get_offset_from_instruction_start(pc);
        SafepointTable::new(self.region_for_pc(pc).safepoint_table()).find_entry(offset as u32)
    }

    /// Maglev safepoint entry recorded for `pc`
    pub fn maglev_safepoint_entry(&self, pc: Address) -> MaglevSafepointEntry {
        assert_eq!(self.kind(), CodeKind::Maglev, "not maglev code");
        let offset = self.get_offset_from_instruction_start(pc);
        MaglevSafepointTable::new(self.region_for_pc(pc).safepoint_table()).find_entry(offset as u32)
    }

    /// Return-address handler table
    pub fn handler_table(&self) -> HandlerTable<'a> {
        HandlerTable::return_address(self.region().handler_table())
    }

    /// Handler for the call returning to `return_pc`
    pub fn lookup_handler(&self, return_pc: Address) -> Option<HandlerInfo> {
        let region = self.region_for_pc(return_pc);
        if !region.has_handler_table() {
            return None;
        }
        let offset = self.get_offset_from_instruction_start(return_pc);
        HandlerTable::return_address(region.handler_table()).lookup_return(offset as u32)
    }

    /// Builtin catch prediction
    pub fn get_builtin_catch_prediction(&self) -> CatchPrediction {
        self.code.get_builtin_catch_prediction()
    }

    /// Deoptimization data of optimized code
    pub fn deoptimization_data(&self) -> Option<&'a DeoptimizationData> {
        self.stream.and_then(InstructionStream::deoptimization_data)
    }

    /// True if a deoptimization exit with a bytecode offset is at `pc`
    pub fn can_deopt_at(&self, pc: Address) -> bool {
        self.stream.is_some_and(|stream| stream.can_deopt_at(pc))
    }

    fn baseline_data(&self) -> (&'a [u8], &'a BytecodeArray) {
        assert_eq!(self.kind(), CodeKind::Baseline, "not baseline code");
        let Some(stream) = self.stream else {
            panic!("baseline code without a body");
        };
        let CodeMetadata::Baseline {
            bytecode_offset_table,
            bytecode,
        } = stream.metadata()
        else {
            panic!("baseline code without a bytecode offset table");
        };
        match self.bytecodes.get(*bytecode) {
            Some(bytecodes) => (bytecode_offset_table.as_slice(), bytecodes),
            None => panic!("baseline code outlived its bytecode"),
        }
    }

    /// Bytecode offset executing at `baseline_pc`
    pub fn get_bytecode_offset_for_baseline_pc(&self, baseline_pc: Address) -> i32 {
        if self.code.is_baseline_leave_frame_builtin() {
            return FUNCTION_EXIT_BYTECODE_OFFSET;
        }
        let (table, bytecodes) = self.baseline_data();
        let offset = self.get_offset_from_instruction_start(baseline_pc);
        bytecode_offset_for_pc(table, bytecodes, offset)
    }

    /// First pc of the bytecode at `bytecode_offset`
    pub fn get_baseline_start_pc_for_bytecode_offset(&self, bytecode_offset: i32) -> Address {
        let (table, bytecodes) = self.baseline_data();
        self.instruction_start()
            + pc_for_bytecode_offset(table, bytecodes, bytecode_offset, BytecodeToPcPosition::Start)
    }

    /// End pc of the bytecode at `bytecode_offset`
    pub fn get_baseline_end_pc_for_bytecode_offset(&self, bytecode_offset: i32) -> Address {
        let (table, bytecodes) = self.baseline_data();
        self.instruction_start()
            + pc_for_bytecode_offset(table, bytecodes, bytecode_offset, BytecodeToPcPosition::End)
    }

    /// Pc execution continues at after the bytecode at `bytecode_offset`
    pub fn get_baseline_pc_for_next_executed_bytecode(&self, bytecode_offset: i32) -> Address {
        let (table, bytecodes) = self.baseline_data();
        self.instruction_start() + pc_for_next_executed_bytecode(table, bytecodes, bytecode_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin(builtin: Builtin) -> Code {
        Code::new(CodeFlags::new(CodeKind::Builtin, false, true), Some(builtin))
    }

    #[test]
    fn test_marking_is_idempotent_and_keeps_first_reason() {
        let code = Code::new_for_testing(CodeKind::Turbofan);
        assert!(!code.marked_for_deoptimization());
        assert!(code.set_marked_for_deoptimization("field type changed"));
        assert!(!code.set_marked_for_deoptimization("map deprecated"));
        assert!(code.marked_for_deoptimization());
        assert_eq!(code.deopt_reason(), Some("field type changed"));
    }

    #[test]
    fn test_cleared_embedded_objects_implies_marked() {
        let code = Code::new_for_testing(CodeKind::Maglev);
        code.set_marked_for_deoptimization("weak objects died");
        code.set_embedded_objects_cleared();
        let flags = code.kind_specific_flags();
        assert!(flags.contains(KindSpecificFlags::EMBEDDED_OBJECTS_CLEARED));
        assert!(flags.contains(KindSpecificFlags::MARKED_FOR_DEOPTIMIZATION));
    }

    #[test]
    #[should_panic(expected = "embedded objects cleared on live code")]
    fn test_clearing_unmarked_code_is_a_bug() {
        Code::new_for_testing(CodeKind::Turbofan).set_embedded_objects_cleared();
    }

    #[test]
    fn test_weak_objects_flag_toggles() {
        let code = Code::new_for_testing(CodeKind::Turbofan);
        code.set_can_have_weak_objects(true);
        assert!(code.can_have_weak_objects());
        code.set_can_have_weak_objects(false);
        assert!(!code.can_have_weak_objects());
    }

    #[test]
    fn test_builtin_predicates() {
        let lazy = builtin(Builtin::CompileLazy);
        assert!(lazy.checks_tiering_state());
        assert!(!lazy.is_interpreter_trampoline_builtin());

        let entry = builtin(Builtin::InterpreterEntryTrampoline);
        assert!(entry.checks_tiering_state());
        assert!(entry.is_interpreter_trampoline_builtin());

        let leave = builtin(Builtin::BaselineLeaveFrame);
        assert!(leave.is_baseline_leave_frame_builtin());
        assert!(!leave.checks_tiering_state());

        let reject = builtin(Builtin::PromiseReject);
        assert_eq!(reject.get_builtin_catch_prediction(), CatchPrediction::Uncaught);
        reject.set_is_promise_rejection(true);
        assert_eq!(reject.get_builtin_catch_prediction(), CatchPrediction::Promise);
    }

    #[test]
    fn test_kind_predicates() {
        let maglev = Code::new_for_testing(CodeKind::Maglev);
        assert!(maglev.uses_safepoint_table());
        assert!(maglev.checks_tiering_state());

        let turbofan = Code::new_for_testing(CodeKind::Turbofan);
        assert!(turbofan.uses_safepoint_table());
        assert!(!turbofan.checks_tiering_state());

        let wasm = Code::new_for_testing(CodeKind::WasmFunction);
        assert!(wasm.uses_safepoint_table());
        assert!(!wasm.has_tagged_outgoing_params());
        assert!(!Code::new_for_testing(CodeKind::JsToWasmFunction).has_tagged_outgoing_params());
        assert!(Code::new_for_testing(CodeKind::Baseline).has_tagged_outgoing_params());
        assert!(!Code::new_for_testing(CodeKind::Baseline).uses_safepoint_table());
    }

    #[test]
    fn test_entry_point_publication() {
        let code = builtin(Builtin::CEntry);
        assert_eq!(code.entry_point(), NULL_ADDRESS);
        code.set_entry_point_for_off_heap_builtin(0x4000);
        assert_eq!(code.entry_point(), 0x4000);
        code.update_code_entry_point(0x8000);
        assert_eq!(code.entry_point(), 0x8000);
    }
}
