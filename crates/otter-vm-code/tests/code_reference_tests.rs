//! CodeReference tests
//!
//! Every origin must report the same properties for the same assembled
//! code, and a raw descriptor reports its offsets exactly as recorded.

use std::sync::Arc;

use otter_vm_code::{
    Builtin, CodeBuilder, CodeDesc, CodeDescBuilder, CodeKind, CodeReference, EmbeddedData,
    Isolate, IsolateConfig, WasmCode,
};
use otter_vm_code::globals::NULL_ADDRESS;

fn assembled() -> CodeDesc {
    let mut builder = CodeDescBuilder::new();
    builder
        .emit(&[0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x10, 0x5D])
        .emit(&[0xC3])
        .constant_pool(vec![0xAA; 8])
        .code_comments("prologue;epilogue");
    builder.finish()
}

#[test]
fn test_code_desc_reports_recorded_offsets() {
    let desc = CodeDesc {
        buffer: vec![0; 80],
        instr_size: 64,
        reloc_offset: 64,
        reloc_size: 8,
        constant_pool_offset: 72,
        code_comments_offset: 76,
        code_comments_size: 4,
        ..CodeDesc::default()
    };
    let buffer = desc.buffer_start();
    let reference = CodeReference::from(&desc);

    assert!(reference.is_code_desc());
    assert_eq!(reference.instruction_start(), buffer);
    assert_eq!(reference.instruction_end(), buffer + 64);
    assert_eq!(reference.instruction_size(), 64);
    assert_eq!(reference.constant_pool(), buffer + 72);
    assert_eq!(reference.relocation_start(), buffer + 64);
    assert_eq!(reference.relocation_end(), buffer + 80);
    assert_eq!(reference.relocation_size(), 8);
    assert_eq!(reference.code_comments(), buffer + 76);
    assert_eq!(reference.code_comments_size(), 4);
}

#[test]
fn test_all_origins_agree() {
    let desc = assembled();
    let embedded = Arc::new(EmbeddedData::new(vec![(Builtin::StackCheck, assembled())]).unwrap());
    let mut isolate = Isolate::new(IsolateConfig::default(), embedded).unwrap();
    let installed = CodeBuilder::new(CodeKind::ForTesting, assembled())
        .build(&mut isolate)
        .unwrap();
    let wasm = WasmCode::from_desc(&assembled(), CodeKind::WasmFunction).unwrap();

    let builtin = isolate.builtin_code(Builtin::StackCheck).unwrap();
    let builtin_view = isolate.code_view(builtin).unwrap();
    let installed_view = isolate.code_view(installed).unwrap();
    let stream = installed_view.instruction_stream().unwrap();

    let references = [
        CodeReference::from(&desc),
        CodeReference::from(stream),
        CodeReference::from(installed_view),
        CodeReference::from(builtin_view),
        CodeReference::from(&wasm),
    ];
    for reference in references {
        assert_eq!(reference.instruction_size(), 10, "{reference:?}");
        assert_eq!(
            reference.instruction_end() - reference.instruction_start(),
            reference.instruction_size()
        );
        assert_eq!(
            reference.relocation_end() - reference.relocation_start(),
            reference.relocation_size()
        );
        assert_eq!(reference.relocation_size(), 0);
        assert_eq!(reference.code_comments_size(), "prologue;epilogue".len());
    }

    // origins whose metadata follows the instructions place it identically
    for reference in [references[0], references[1], references[2], references[4]] {
        let start = reference.instruction_start();
        assert_eq!(reference.constant_pool() - start, 12);
        assert_eq!(reference.code_comments() - start, 20);
    }
}

#[test]
fn test_installed_code_carries_relocation_info() {
    let mut builder = CodeDescBuilder::new();
    builder
        .emit(&[0x90])
        .emit_internal_reference(0)
        .emit_external_reference(0x1000)
        .emit(&[0xC3]);
    let desc = builder.finish();

    let mut isolate = Isolate::new(
        IsolateConfig::default(),
        Arc::new(EmbeddedData::new(Vec::new()).unwrap()),
    )
    .unwrap();
    let handle = CodeBuilder::new(CodeKind::ForTesting, desc.clone())
        .build(&mut isolate)
        .unwrap();
    let view = isolate.code_view(handle).unwrap();

    let from_desc = CodeReference::from(&desc);
    let from_code = CodeReference::from(view);
    assert_eq!(from_desc.relocation_size(), 10);
    assert_eq!(from_code.relocation_size(), from_desc.relocation_size());
    assert_eq!(
        from_code.relocation_end() - from_code.relocation_start(),
        from_desc.relocation_end() - from_desc.relocation_start()
    );
    // no constant pool: the address degenerates to the comments start
    assert_eq!(from_desc.constant_pool(), from_desc.code_comments());
}

#[test]
fn test_empty_relocation_info_only_sizes_agree() {
    let desc = assembled();
    let mut isolate = Isolate::new(
        IsolateConfig::default(),
        Arc::new(EmbeddedData::new(Vec::new()).unwrap()),
    )
    .unwrap();
    let handle = CodeBuilder::new(CodeKind::ForTesting, desc.clone())
        .build(&mut isolate)
        .unwrap();
    let view = isolate.code_view(handle).unwrap();

    let from_desc = CodeReference::from(&desc);
    let from_code = CodeReference::from(view);
    assert_eq!(from_desc.relocation_size(), 0);
    assert_eq!(from_code.relocation_size(), 0);
    assert_eq!(from_desc.relocation_start(), desc.buffer_start() + desc.reloc_offset);
    assert_eq!(from_code.relocation_start(), NULL_ADDRESS);
    assert_eq!(from_code.relocation_end(), NULL_ADDRESS);
}

#[test]
#[should_panic(expected = "on a null code reference")]
fn test_null_reference_panics() {
    CodeReference::Null.relocation_size();
}
