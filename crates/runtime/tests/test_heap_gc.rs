//! Heap allocation, eager initialization, strings, and the mark-compact
//! collector.

mod common;

use common::*;
use relay_runtime::TypeCode;

/// Root class plus one payload class `C { Int32 }` with a no-op custom
/// constructor at method 1.
fn heap_image(entry: Vec<u8>, statics: Vec<(u8, i16)>) -> ImageBuilder {
    let mut b = ImageBuilder::default();
    b.classes.push(ClassDef {
        total_size: 0,
        fields: vec![],
    });
    b.classes.push(ClassDef {
        total_size: 5,
        fields: vec![(T_I32, 0, -1)],
    });
    b.statics = statics;
    b.methods.push(MethodDef::new(entry_args(), vec![], entry));

    let mut ctor = Asm::new();
    ctor.ret();
    b.methods
        .push(MethodDef::new(vec![(T_REF, -1)], vec![], ctor.finish()));
    b
}

#[test]
fn gc_keeps_only_the_statically_reachable_survivor() {
    // Allocate 100 objects in a loop, keep only the last via a static.
    let mut a = Asm::new();
    a.ldc_i4(0);
    a.stloc(T_I32, 0);
    a.label("loop");
    a.ldloc(0);
    a.ldc_i4(100);
    a.bge("exit");
    a.newobj(1, 0xA6, 1);
    a.pop();
    a.ldloc(0);
    a.ldc_i4(1);
    a.add();
    a.stloc(T_I32, 0);
    a.br("loop");
    a.label("exit");
    a.newobj(1, 0xA6, 1);
    a.stsfld(0);
    a.ret();

    let mut b = heap_image(Vec::new(), vec![(T_REF, -1)]);
    b.methods[0] = MethodDef::new(entry_args(), vec![(T_I32, -1)], a.finish());

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);

    // Survivors: the root object and the kept allocation, densely
    // renumbered.
    assert_eq!(vm.heap_next_id(), 3);
    assert_eq!(vm.live_objects(), 2);
    assert_eq!(vm.static_slot(0).unwrap(), (TypeCode::ReferenceId, 2));

    // Idempotent across further iterations.
    run_with_snapshot(&mut vm, 1);
    assert_eq!(vm.heap_next_id(), 3);
    assert_eq!(vm.static_slot(0).unwrap().1, 2);
}

#[test]
fn statics_with_instantiable_classes_are_eagerly_newed() {
    let mut a = Asm::new();
    a.ret();
    let b = heap_image(a.finish(), vec![(T_REF, 1)]);
    let (vm, _host) = load(&b);

    // Root is id 1, the eagerly created static object id 2.
    assert_eq!(vm.live_objects(), 2);
    assert_eq!(vm.static_slot(0).unwrap(), (TypeCode::ReferenceId, 2));
    assert_eq!(vm.object_field(2, 0).unwrap(), (TypeCode::Int32, 0));
}

#[test]
fn reference_fields_with_aux_classes_nest_recursively() {
    let mut a = Asm::new();
    a.ret();
    let mut b = heap_image(a.finish(), vec![(T_REF, 2)]);
    // Class 2 carries a reference field auto-instantiated to class 1.
    b.classes.push(ClassDef {
        total_size: 5,
        fields: vec![(T_REF, 0, 1)],
    });

    let (vm, _host) = load(&b);
    assert_eq!(vm.live_objects(), 3);
    let (code, inner) = vm.object_field(2, 0).unwrap();
    assert_eq!(code, TypeCode::ReferenceId);
    assert_eq!(inner, 3);
    assert_eq!(vm.object_field(inner, 0).unwrap(), (TypeCode::Int32, 0));
}

#[test]
fn reference_array_with_element_class_constructs_every_element() {
    let mut a = Asm::new();
    a.ldc_i4(3);
    a.newarr(T_REF, Some(1));
    a.stsfld(0);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_REF, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);

    // Root, the array, and three elements survive.
    assert_eq!(vm.live_objects(), 5);
    let (_, arr) = vm.static_slot(0).unwrap();
    let bytes = vm.array_bytes(arr).unwrap();
    assert_eq!(bytes.len(), 12);
    for chunk in bytes.chunks(4) {
        let id = i32::from_le_bytes(chunk.try_into().unwrap());
        assert!(id > 0 && id < vm.heap_next_id(), "ghost pointer {id}");
    }
}

#[test]
fn zero_length_array_and_string_are_valid_objects() {
    let mut a = Asm::new();
    a.ldc_i4(0);
    a.newarr(T_I32, None);
    a.ldlen();
    a.stsfld(0);
    a.ldstr("");
    a.stsfld(5);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_I32, -1), (T_REF, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 0);
    let (_, sid) = vm.static_slot(1).unwrap();
    assert_ne!(sid, 0);
    assert_eq!(vm.string_bytes(sid, "test").unwrap(), b"");
}

#[test]
fn substring_of_full_range_equals_the_source() {
    let mut a = Asm::new();
    a.ldstr("hello");
    a.ldc_i4(0);
    a.ldc_i4(5);
    a.call_builtin(63); // Substring
    a.stsfld(0);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_REF, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    let (_, id) = vm.static_slot(0).unwrap();
    assert_eq!(vm.string_bytes(id, "test").unwrap(), b"hello");
}

#[test]
fn substring_out_of_range_yields_null() {
    let mut a = Asm::new();
    a.ldstr("hello");
    a.ldc_i4(2);
    a.ldc_i4(9);
    a.call_builtin(63);
    a.stsfld(0);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_REF, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 0);
}

#[test]
fn concat_and_length_compose() {
    let mut a = Asm::new();
    a.ldstr("foo");
    a.ldstr("bar");
    a.call_builtin(60); // Concat(a, b)
    a.dup();
    a.stsfld(0);
    a.call_builtin(64); // get_Length
    a.stsfld(5);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_REF, -1), (T_I32, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    let (_, id) = vm.static_slot(0).unwrap();
    assert_eq!(vm.string_bytes(id, "test").unwrap(), b"foobar");
    assert_eq!(vm.static_slot(1).unwrap().1, 6);
}

#[test]
fn strings_survive_collection_with_contents_intact() {
    // The kept string is preceded by garbage allocations so compaction
    // actually moves it.
    let mut a = Asm::new();
    a.newobj(1, 0xA6, 1);
    a.pop();
    a.newobj(1, 0xA6, 1);
    a.pop();
    a.ldstr("survivor");
    a.stsfld(0);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_REF, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    let (_, id) = vm.static_slot(0).unwrap();
    assert_eq!(id, 2);
    assert_eq!(vm.string_bytes(id, "test").unwrap(), b"survivor");
}

#[test]
fn bitconverter_round_trips_int_and_single() {
    let mut a = Asm::new();
    a.ldc_i4(0x1234_5678);
    a.call_builtin(110); // GetBytes(Int32)
    a.ldc_i4(0);
    a.call_builtin(117); // ToInt32
    a.stsfld(0);
    a.ldc_r4(4.25);
    a.call_builtin(111); // GetBytes(Single)
    a.ldc_i4(0);
    a.call_builtin(118); // ToSingle
    a.stsfld(5);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_I32, -1), (T_F32, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 0x1234_5678);
    assert_eq!(vm.static_slot(1).unwrap().1, 4.25f32.to_bits() as i32);
}

#[test]
fn bitconverter_round_trips_boolean_through_a_typed_slot() {
    let mut a = Asm::new();
    a.ldc_i4(1);
    a.stsfld(0); // Boolean static takes the Int32 low byte
    a.ldsfld(0); // now a Boolean-tagged slot
    a.call_builtin(107); // GetBytes(Boolean)
    a.ldc_i4(0);
    a.call_builtin(114); // ToBoolean
    a.stsfld(2);
    a.ret();
    let b = heap_image(a.finish(), vec![(T_BOOL, -1), (T_BOOL, -1)]);

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(1).unwrap(), (TypeCode::Boolean, 1));
}

#[test]
fn runtime_array_initializer_copies_metadata() {
    let mut a = Asm::new();
    a.ldc_i4(3);
    a.newarr(T_I32, None);
    a.stloc(T_REF, 0);
    a.ldloc(0);
    let mut data = Vec::new();
    for v in [10i32, 20, 30] {
        data.extend_from_slice(&v.to_le_bytes());
    }
    a.ldtoken(&data);
    a.call_builtin(77); // RuntimeHelpers.InitializeArray
    a.ldloc(0);
    a.ldc_i4(2);
    a.ldelem(T_I32);
    a.stsfld(0);
    a.ret();
    let mut b = heap_image(Vec::new(), vec![(T_I32, -1)]);
    b.methods[0] = MethodDef::new(entry_args(), vec![(T_REF, -1)], a.finish());

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 30);
}
