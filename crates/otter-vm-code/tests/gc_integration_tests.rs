//! Collection of code through an isolate

use std::sync::Arc;

use otter_vm_bytecode::{BytecodeArray, ConstantPool};
use otter_vm_code::{
    Code, CodeBuilder, CodeDesc, CodeDescBuilder, CodeKind, DeoptimizationData,
    DeoptimizationLiteralArray, EmbeddedData, HeapObject, HeapRef, Isolate, IsolateConfig,
    ObjectKind,
};
use otter_vm_gc::{Handle, Strength};

fn isolate_with(config: IsolateConfig) -> Isolate {
    Isolate::new(config, Arc::new(EmbeddedData::new(Vec::new()).unwrap())).unwrap()
}

fn isolate() -> Isolate {
    isolate_with(IsolateConfig::default())
}

fn leaf_desc() -> CodeDesc {
    let mut builder = CodeDescBuilder::new();
    builder.emit(&[0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3]);
    builder.finish()
}

fn calling_desc(callee: usize) -> CodeDesc {
    let mut builder = CodeDescBuilder::new();
    builder.emit(&[0x55]).emit_code_target(callee).emit(&[0x5D, 0xC3]);
    builder.finish()
}

fn embedding_desc(object: Handle<HeapObject>) -> CodeDesc {
    let mut builder = CodeDescBuilder::new();
    builder.emit(&[0x48, 0xB8]).emit_embedded_object(object).emit(&[0xC3]);
    builder.finish()
}

fn install(isolate: &mut Isolate, kind: CodeKind, desc: CodeDesc) -> Handle<Code> {
    CodeBuilder::new(kind, desc).build(isolate).unwrap()
}

#[test]
fn test_unreachable_code_is_swept() {
    let mut isolate = isolate();
    let code = install(&mut isolate, CodeKind::ForTesting, leaf_desc());
    let entry = isolate.code(code).unwrap().entry_point();
    assert!(isolate.lookup_code(entry).is_found());

    let summary = isolate.collect_garbage();
    // the Code and its stream
    assert_eq!(summary.swept, 2);
    assert!(isolate.code(code).is_none());
    assert!(isolate.heap().streams.is_empty());
    assert!(isolate.heap().code_ranges.is_empty());
    assert!(!isolate.lookup_code(entry).is_found());
    assert_eq!(isolate.stats().collections, 1);
}

#[test]
fn test_roots_keep_code_alive() {
    let mut isolate = isolate();
    let code = install(&mut isolate, CodeKind::ForTesting, leaf_desc());
    isolate.add_root(code);

    let summary = isolate.collect_garbage();
    assert_eq!(summary.swept, 0);
    let entry = isolate.code(code).unwrap().entry_point();
    assert_eq!(isolate.lookup_code(entry).code_handle(), Some(code));

    assert!(isolate.remove_root(code));
    isolate.collect_garbage();
    assert!(isolate.code(code).is_none());
}

#[test]
fn test_code_targets_keep_callee_alive() {
    let mut isolate = isolate();
    let callee = install(&mut isolate, CodeKind::ForTesting, leaf_desc());
    let callee_entry = isolate.code(callee).unwrap().entry_point();
    let caller = install(&mut isolate, CodeKind::ForTesting, calling_desc(callee_entry));
    isolate.add_root(caller);

    isolate.collect_garbage();
    assert!(isolate.code(callee).is_some());

    let view = isolate.code_view(caller).unwrap();
    let targets: Vec<_> = view.instruction_stream().unwrap().code_targets().collect();
    assert_eq!(targets, vec![callee_entry]);
}

#[test]
fn test_strong_embedding_keeps_object_alive() {
    let mut isolate = isolate();
    let map = isolate.allocate_object(ObjectKind::Map);
    let code = install(&mut isolate, CodeKind::Turbofan, embedding_desc(map));
    isolate.add_root(code);

    isolate.collect_garbage();
    assert!(isolate.heap().objects.contains(map));
    assert!(!isolate.code(code).unwrap().marked_for_deoptimization());
}

#[test]
fn test_dead_weak_embedded_object_deoptimizes_code() {
    let mut isolate = isolate();
    let map = isolate.allocate_object(ObjectKind::Map);
    let code = CodeBuilder::new(CodeKind::Turbofan, embedding_desc(map))
        .can_have_weak_objects(true)
        .build(&mut isolate)
        .unwrap();
    isolate.add_root(code);

    let summary = isolate.collect_garbage();
    assert!(!isolate.heap().objects.contains(map));
    assert_eq!(summary.weak_cleared, 1);

    let installed = isolate.code(code).unwrap();
    assert!(installed.marked_for_deoptimization());
    assert_eq!(installed.deopt_reason(), Some("weak objects died"));
    assert!(installed.embedded_objects_cleared());
    let stream = isolate.code_view(code).unwrap().instruction_stream().unwrap();
    assert_eq!(stream.embedded_objects().count(), 0);
}

#[test]
fn test_live_weak_embedded_object_is_kept() {
    let mut isolate = isolate();
    let cell = isolate.allocate_object(ObjectKind::PropertyCell);
    let other = isolate.allocate_object(ObjectKind::Other);
    let mut desc = CodeDescBuilder::new();
    desc.emit_embedded_object(cell).emit_embedded_object(other).emit(&[0xC3]);
    let code = CodeBuilder::new(CodeKind::Maglev, desc.finish())
        .can_have_weak_objects(true)
        .build(&mut isolate)
        .unwrap();
    isolate.add_root(code);
    isolate.add_root(cell);

    isolate.collect_garbage();
    // objects of other kinds stay strong even in code with weak objects
    assert!(isolate.heap().objects.contains(other));
    assert!(!isolate.code(code).unwrap().marked_for_deoptimization());
    let stream = isolate.code_view(code).unwrap().instruction_stream().unwrap();
    let embedded: Vec<_> = stream.embedded_objects().map(|(_, object)| object).collect();
    assert_eq!(embedded.len(), 2);
    assert!(embedded.contains(&cell) && embedded.contains(&other));
}

#[test]
fn test_weak_deoptimization_literals_are_cleared() {
    let mut isolate = isolate();
    let receiver = isolate.allocate_object(ObjectKind::JsReceiver);
    let shared = isolate.allocate_object(ObjectKind::SharedFunctionInfo);
    let map = isolate.allocate_object(ObjectKind::Map);

    let mut literals = DeoptimizationLiteralArray::new();
    let weak = isolate.add_deoptimization_literal(&mut literals, receiver.into());
    let strong = isolate.add_deoptimization_literal(&mut literals, map.into());
    let mut data = DeoptimizationData::new(1);
    data.set_literal_array(literals);
    data.set_shared_function_info(shared.into());

    let code = CodeBuilder::new(CodeKind::Turbofan, leaf_desc())
        .deoptimization_data(data)
        .build(&mut isolate)
        .unwrap();
    isolate.add_root(code);

    let summary = isolate.collect_garbage();
    assert_eq!(summary.weak_cleared, 1);
    assert!(!isolate.heap().objects.contains(receiver));
    assert!(isolate.heap().objects.contains(map));
    assert!(isolate.heap().objects.contains(shared));

    let data = isolate.code_view(code).unwrap().deoptimization_data().unwrap();
    let literals = data.literal_array();
    assert_eq!(literals.strength(weak), None);
    assert_eq!(literals.try_get(weak), None);
    assert_eq!(literals.strength(strong), Some(Strength::Strong));
    assert_eq!(literals.get(strong), HeapRef::Object(map));
    assert_eq!(data.get_inlined_function(-1), HeapRef::Object(shared));
}

#[test]
fn test_compaction_moves_bodies_and_retargets_calls() {
    let config = IsolateConfig {
        compact_code_space: true,
        ..IsolateConfig::default()
    };
    let mut isolate = isolate_with(config);
    let callee = install(&mut isolate, CodeKind::ForTesting, leaf_desc());
    let old_callee_entry = isolate.code(callee).unwrap().entry_point();
    let caller = install(&mut isolate, CodeKind::ForTesting, calling_desc(old_callee_entry));
    let old_caller_entry = isolate.code(caller).unwrap().entry_point();
    isolate.add_root(caller);

    let summary = isolate.collect_garbage();
    assert_eq!(summary.relocated, 2);

    let new_callee_entry = isolate.code(callee).unwrap().entry_point();
    let new_caller_entry = isolate.code(caller).unwrap().entry_point();
    assert_ne!(new_callee_entry, old_callee_entry);
    assert_ne!(new_caller_entry, old_caller_entry);

    assert_eq!(isolate.lookup_code(new_callee_entry + 2).code_handle(), Some(callee));
    assert_eq!(isolate.lookup_code(new_caller_entry).code_handle(), Some(caller));
    assert!(!isolate.lookup_code(old_callee_entry).is_found());
    assert_eq!(isolate.heap().code_ranges.len(), 2);

    let view = isolate.code_view(caller).unwrap();
    let stream = view.instruction_stream().unwrap();
    assert_eq!(stream.instruction_start(), new_caller_entry);
    assert_eq!(stream.code_targets().collect::<Vec<_>>(), vec![new_callee_entry]);
    assert_eq!(stream.region().instructions()[0], 0x55);
}

#[test]
fn test_collections_age_bytecode() {
    let config = IsolateConfig {
        bytecode_old_age: 2,
        ..IsolateConfig::default()
    };
    let mut isolate = isolate_with(config);
    let bytecode = isolate.allocate_bytecode(BytecodeArray::new(&[0x26], 0, 1, ConstantPool::new()).unwrap());
    isolate.add_root(bytecode);

    isolate.collect_garbage();
    let array = isolate.heap().bytecodes.get(bytecode).unwrap();
    assert_eq!(array.bytecode_age(), 1);
    assert!(!array.is_old(2));

    for _ in 0..3 {
        isolate.collect_garbage();
    }
    let array = isolate.heap().bytecodes.get(bytecode).unwrap();
    assert_eq!(array.bytecode_age(), 2);
    assert!(array.is_old(2));
}

#[test]
fn test_allocation_threshold_triggers_collection() {
    let config = IsolateConfig {
        gc: otter_vm_gc::GcConfig {
            collection_threshold: 3,
            ..otter_vm_gc::GcConfig::default()
        },
        ..IsolateConfig::default()
    };
    let mut isolate = isolate_with(config);
    isolate.allocate_object(ObjectKind::Other);
    isolate.allocate_object(ObjectKind::Other);
    assert!(isolate.maybe_collect_garbage().is_none());

    isolate.allocate_object(ObjectKind::Other);
    let summary = isolate.maybe_collect_garbage().unwrap();
    assert_eq!(summary.swept, 3);
    assert!(isolate.maybe_collect_garbage().is_none());
}
