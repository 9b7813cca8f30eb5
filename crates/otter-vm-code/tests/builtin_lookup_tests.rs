//! Builtin lookups when an isolate runs its own copy of the blob
//!
//! With short builtin calls the isolate re-embeds the process-wide blob
//! near its code space. Frames of both copies can be on the stack at once,
//! so every pc query must resolve against the copy the pc belongs to.

use std::sync::Arc;

use otter_vm_code::handler_table::ReturnAddressTableBuilder;
use otter_vm_code::{
    Builtin, CatchPrediction, CodeDesc, CodeDescBuilder, EmbeddedData, Isolate, IsolateConfig,
};

fn builtin_desc(len: usize) -> CodeDesc {
    let mut handlers = ReturnAddressTableBuilder::new();
    handlers.add(1, 2, CatchPrediction::Caught);
    let mut builder = CodeDescBuilder::new();
    builder.emit(&vec![0xCC; len]).handler_table(handlers.finish());
    builder.finish()
}

fn embedded() -> Arc<EmbeddedData> {
    Arc::new(
        EmbeddedData::new(vec![
            (Builtin::CompileLazy, builtin_desc(40)),
            (Builtin::CEntry, builtin_desc(8)),
        ])
        .unwrap(),
    )
}

fn isolate(short_builtin_calls: bool) -> Isolate {
    let config = IsolateConfig {
        short_builtin_calls,
        ..IsolateConfig::default()
    };
    Isolate::new(config, embedded()).unwrap()
}

#[test]
fn test_pcs_in_both_copies_resolve_to_the_builtin() {
    let isolate = isolate(true);
    let blobs = isolate.blobs();
    assert!(blobs.is_short_builtin_calls_enabled());

    let local_start = blobs.canonical().instruction_start_of(Builtin::CEntry);
    let global_start = blobs.process_wide().instruction_start_of(Builtin::CEntry);
    assert_ne!(local_start, global_start);

    let handle = isolate.builtin_code(Builtin::CEntry).unwrap();
    // new calls enter the local copy
    assert_eq!(isolate.code(handle).unwrap().entry_point(), local_start);

    for start in [local_start, global_start] {
        let pc = start + 5;
        let result = isolate.lookup_code(pc);
        assert_eq!(result.code_handle(), Some(handle));
        assert_eq!(result.builtin(), Some(Builtin::CEntry));
        assert!(result.contains(pc));
        assert_eq!(result.get_offset_from_instruction_start(pc), 5);

        let view = result.code().unwrap();
        assert_eq!(view.instruction_start_for_pc(pc), start);
        assert_eq!(view.instruction_end_for_pc(pc), start + 8);
        assert_eq!(view.get_offset_from_instruction_start(pc), 5);

        let handler = view.lookup_handler(start + 1).unwrap();
        assert_eq!(handler.handler_offset, 2);
        assert_eq!(handler.prediction, CatchPrediction::Caught);
    }
}

#[test]
fn test_neighbouring_builtins_stay_apart_in_both_copies() {
    let isolate = isolate(true);
    let blobs = isolate.blobs();
    let lazy = isolate.builtin_code(Builtin::CompileLazy).unwrap();

    for blob in [blobs.canonical(), blobs.process_wide().as_ref()] {
        let start = blob.instruction_start_of(Builtin::CompileLazy);
        let result = isolate.lookup_code(start + 39);
        assert_eq!(result.code_handle(), Some(lazy));
        assert_eq!(result.get_offset_from_instruction_start(start + 39), 39);

        let view = result.code().unwrap();
        assert!(!view.contains(blob.instruction_start_of(Builtin::CEntry)));
    }
}

#[test]
fn test_single_copy_without_short_builtin_calls() {
    let isolate = isolate(false);
    let blobs = isolate.blobs();
    assert!(!blobs.is_short_builtin_calls_enabled());

    let start = blobs.process_wide().instruction_start_of(Builtin::CEntry);
    assert_eq!(blobs.canonical().instruction_start_of(Builtin::CEntry), start);

    let handle = isolate.builtin_code(Builtin::CEntry).unwrap();
    assert_eq!(isolate.code(handle).unwrap().entry_point(), start);
    let result = isolate.lookup_code(start + 3);
    assert_eq!(result.code_handle(), Some(handle));
    assert_eq!(result.code().unwrap().instruction_start_for_pc(start + 3), start);
}
