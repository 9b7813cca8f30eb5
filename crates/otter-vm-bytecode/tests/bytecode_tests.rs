//! Bytecode array and codec tests

use otter_vm_bytecode::{
    Bytecode, BytecodeArray, BytecodeArrayIterator, Constant, ConstantPool, vlq,
};
use proptest::prelude::*;

/// A small loop:
///
/// ```text
///  0: LdaZero
///  1: Star r0
///  3: StackCheck
///  4: Ldar r0
///  6: Inc s0
///  8: Star r0
/// 10: JumpLoop [7] (@3)
/// 14: Return
/// ```
fn loop_bytecode() -> Vec<u8> {
    vec![
        0x00, 0x05, 0x00, 0x25, 0x04, 0x00, 0x13, 0x00, 0x05, 0x00, 0x23, 0x07, 0x00, 0x01, 0x26,
    ]
}

#[test]
fn test_loop_iteration_and_targets() {
    let array = BytecodeArray::new(&loop_bytecode(), 8, 1, ConstantPool::new()).unwrap();
    let mut iter = array.iter();
    let mut last = None;
    while !iter.done() {
        if iter.current_bytecode() == Bytecode::JumpLoop {
            assert_eq!(iter.current_offset(), 10);
            assert_eq!(iter.jump_target_offset(), 3);
        }
        last = Some(iter.current_bytecode());
        iter.advance();
    }
    assert_eq!(last, Some(Bytecode::Return));
}

#[test]
fn test_copy_bytecodes_between_arrays() {
    let source = BytecodeArray::new(&loop_bytecode(), 8, 1, ConstantPool::new()).unwrap();
    let mut target = BytecodeArray::new(&[0x25; 15], 8, 1, ConstantPool::new()).unwrap();
    source.copy_bytecodes_to(&mut target);
    assert_eq!(source.bytecodes(), target.bytecodes());
}

#[test]
fn test_constant_pool_shows_in_disassembly() {
    let mut pool = ConstantPool::new();
    pool.add(Constant::Number(1.5));
    let array = BytecodeArray::new(&[0x03, 0x00, 0x26], 0, 1, pool).unwrap();
    let mut text = String::new();
    array.disassemble(&mut text).unwrap();
    assert!(text.contains("Constant pool (size = 1)"));
    assert!(text.contains("1.5"));
}

#[test]
fn test_iterator_positions_at_offset() {
    let bytes = loop_bytecode();
    let iter = BytecodeArrayIterator::at_offset(&bytes, 6).unwrap();
    assert_eq!(iter.current_bytecode(), Bytecode::Inc);
}

proptest! {
    #[test]
    fn prop_unsigned_vlq_decodes_what_was_encoded(values in prop::collection::vec(any::<u32>(), 0..32)) {
        let mut buf = Vec::new();
        for &value in &values {
            vlq::encode_unsigned(value, &mut buf);
        }
        let mut pos = 0;
        for &value in &values {
            prop_assert_eq!(vlq::decode_unsigned(&buf, &mut pos), Ok(value));
        }
        prop_assert_eq!(pos, buf.len());
    }

    #[test]
    fn prop_signed_vlq_decodes_what_was_encoded(value in any::<i32>()) {
        let mut buf = Vec::new();
        vlq::encode_signed(value, &mut buf);
        prop_assert!(buf.len() <= 5);
        let mut pos = 0;
        prop_assert_eq!(vlq::decode_signed(&buf, &mut pos), Ok(value));
    }

    #[test]
    fn prop_aging_never_exceeds_old_age(old_age in 1u16..16, steps in 0usize..40) {
        let array = BytecodeArray::new(&[0x26], 0, 1, ConstantPool::new()).unwrap();
        for _ in 0..steps {
            array.make_older(old_age);
        }
        prop_assert_eq!(array.bytecode_age() as usize, steps.min(old_age as usize));
        prop_assert_eq!(array.is_old(old_age), steps >= old_age as usize);
    }
}
