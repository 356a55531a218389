//! Call frames, inline value-type arguments, delegates, virtual dispatch,
//! and fault latching.

mod common;

use common::*;
use relay_runtime::{FaultKind, Result as VmResult, TypeCode, Vm};

fn root_only() -> ImageBuilder {
    let mut b = ImageBuilder::default();
    b.classes.push(ClassDef {
        total_size: 0,
        fields: vec![],
    });
    b
}

#[test]
fn inline_value_argument_copies_without_aliasing() {
    let mut b = root_only();
    // Class 1: Point { Int32 x @0, Int32 y @5 }.
    b.classes.push(ClassDef {
        total_size: 10,
        fields: vec![(T_I32, 0, -1), (T_I32, 5, -1)],
    });
    b.statics = vec![(T_I32, -1), (T_I32, -1)];

    // Method 1: Point::ctor(this, x, y).
    let mut ctor = Asm::new();
    ctor.ldarg(0);
    ctor.ldarg(5);
    ctor.stfld(0, 1);
    ctor.ldarg(0);
    ctor.ldarg(10);
    ctor.stfld(5, 1);
    ctor.ret();

    // Method 2: use(this, Point p) with p as an inline value parameter —
    // observes p.x, then mutates the local copy.
    let mut usep = Asm::new();
    usep.ldarg(5);
    usep.ldfld(0, 1);
    usep.stsfld(0);
    usep.ldarg(5);
    usep.ldc_i4(100);
    usep.stfld(0, 1);
    usep.ret();

    // Entry: box Point(3, 4), pass it by value, then reread the original.
    let mut entry = Asm::new();
    entry.ldc_i4(3);
    entry.ldc_i4(4);
    entry.newobj(1, 0xA6, 1);
    entry.stloc(T_REF, 0);
    entry.ldarg(0); // `this` for the call
    entry.ldloc(0);
    entry.call(2);
    entry.ldloc(0);
    entry.ldfld(0, 1);
    entry.stsfld(5);
    entry.ret();

    b.methods.push(MethodDef::new(
        entry_args(),
        vec![(T_REF, -1)],
        entry.finish(),
    ));
    b.methods.push(MethodDef::new(
        vec![(T_REF, -1), (T_I32, -1), (T_I32, -1)],
        vec![],
        ctor.finish(),
    ));
    b.methods.push(MethodDef::new(
        vec![(T_REF, -1), (T_JMP, 1)],
        vec![],
        usep.finish(),
    ));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    // The callee saw x = 3; its mutation did not reach the heap object.
    assert_eq!(vm.static_slot(0).unwrap().1, 3);
    assert_eq!(vm.static_slot(1).unwrap().1, 3);
}

fn delegate_image(store_delegate: bool) -> ImageBuilder {
    let mut b = root_only();
    // Class 1 backs the delegate object: [ReferenceId, Int32] fields.
    b.classes.push(ClassDef {
        total_size: 10,
        fields: vec![(T_REF, 0, -1), (T_I32, 5, -1)],
    });
    b.statics = vec![(T_BOOL, -1), (T_REF, -1)];

    // Method 1: fired = true.
    let mut target = Asm::new();
    target.ldc_i4(1);
    target.stsfld(0);
    target.ret();

    // Entry: new Action(this, &target); optionally retain; invoke.
    let mut entry = Asm::new();
    entry.ldarg(0);
    entry.ldftn_custom(1);
    entry.newobj(1, 0xA7, 82); // Action::ctor
    if store_delegate {
        entry.dup();
        entry.stsfld(2);
    }
    entry.call_builtin(83); // Action::Invoke
    entry.ret();

    b.methods
        .push(MethodDef::new(entry_args(), vec![], entry.finish()));
    b.methods
        .push(MethodDef::new(vec![(T_REF, -1)], vec![], target.finish()));
    b
}

#[test]
fn delegate_invoke_fires_the_bound_method() {
    let (mut vm, _host) = load(&delegate_image(true));
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap(), (TypeCode::Boolean, 1));

    // Retained delegate survives collection alongside the root.
    assert_eq!(vm.live_objects(), 2);
    let (_, del) = vm.static_slot(1).unwrap();
    let (code, bound_this) = vm.object_field(del, 0).unwrap();
    assert_eq!(code, TypeCode::ReferenceId);
    assert_eq!(bound_this, 1);
}

#[test]
fn unreferenced_delegate_is_collected() {
    let (mut vm, _host) = load(&delegate_image(false));
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 1);
    assert_eq!(vm.live_objects(), 1);
}

#[test]
fn virtual_dispatch_resolves_by_concrete_class() {
    let mut b = root_only();
    b.classes.push(ClassDef {
        total_size: 0,
        fields: vec![],
    });
    b.classes.push(ClassDef {
        total_size: 0,
        fields: vec![],
    });
    b.statics = vec![(T_I32, -1), (T_I32, -1)];
    b.virts = vec![(0, vec![(1, 2), (2, 3)])];

    let mut ctor = Asm::new();
    ctor.ret();
    let mut impl_a = Asm::new();
    impl_a.ldc_i4(7);
    impl_a.stsfld(0);
    impl_a.ret();
    let mut impl_b = Asm::new();
    impl_b.ldc_i4(9);
    impl_b.stsfld(5);
    impl_b.ret();

    let mut entry = Asm::new();
    entry.newobj(1, 0xA6, 1);
    entry.callvirt(0);
    entry.newobj(2, 0xA6, 1);
    entry.callvirt(0);
    entry.ret();

    b.methods
        .push(MethodDef::new(entry_args(), vec![], entry.finish()));
    b.methods
        .push(MethodDef::new(vec![(T_REF, -1)], vec![], ctor.finish()));
    b.methods
        .push(MethodDef::new(vec![(T_REF, -1)], vec![], impl_a.finish()));
    b.methods
        .push(MethodDef::new(vec![(T_REF, -1)], vec![], impl_b.finish()));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 7);
    assert_eq!(vm.static_slot(1).unwrap().1, 9);
}

#[test]
fn virtual_dispatch_without_a_match_is_fatal() {
    let mut b = root_only();
    b.classes.push(ClassDef {
        total_size: 0,
        fields: vec![],
    });
    // The table only knows class 5.
    b.virts = vec![(0, vec![(5, 1)])];

    let mut ctor = Asm::new();
    ctor.ret();
    let mut entry = Asm::new();
    entry.newobj(1, 0xA6, 1);
    entry.callvirt(0);
    entry.ret();

    b.methods
        .push(MethodDef::new(entry_args(), vec![], entry.finish()));
    b.methods
        .push(MethodDef::new(vec![(T_REF, -1)], vec![], ctor.finish()));

    let (mut vm, host) = load(&b);
    vm.put_snapshot_buffer(&[0u8; 4]).unwrap();
    let err = vm.run(0).unwrap_err();
    assert_eq!(err.kind, FaultKind::Image);
    assert!(vm.is_halted());
    assert_eq!(host.mock().errors.len(), 1);
}

#[test]
fn value_tuple_ctor_fills_both_fields() {
    let mut b = root_only();
    b.classes.push(ClassDef {
        total_size: 10,
        fields: vec![(T_I32, 0, -1), (T_I32, 5, -1)],
    });
    b.statics = vec![(T_I32, -1), (T_I32, -1)];

    let mut entry = Asm::new();
    entry.ldc_i4(11);
    entry.ldc_i4(22);
    entry.newobj(1, 0xA7, 74); // ValueTuple2::ctor
    entry.dup();
    entry.ldfld(0, 1);
    entry.stsfld(0);
    entry.ldfld(5, 1);
    entry.stsfld(5);
    entry.ret();
    b.methods
        .push(MethodDef::new(entry_args(), vec![], entry.finish()));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 11);
    assert_eq!(vm.static_slot(1).unwrap().1, 22);
}

#[test]
fn arithmetic_branches_and_conversions_compose() {
    let mut b = root_only();
    b.statics = vec![(T_I32, -1), (T_F32, -1), (T_I32, -1)];

    // sum of i*i for i in 0..5, a float add, and a float→int conversion.
    let mut a = Asm::new();
    a.ldc_i4(0);
    a.stloc(T_I32, 0);
    a.ldc_i4(0);
    a.stloc(T_I32, 5);
    a.label("loop");
    a.ldloc(5);
    a.ldc_i4(5);
    a.bge("done");
    a.ldloc(0);
    a.ldloc(5);
    a.ldloc(5);
    a.mul();
    a.add();
    a.stloc(T_I32, 0);
    a.ldloc(5);
    a.ldc_i4(1);
    a.add();
    a.stloc(T_I32, 5);
    a.br("loop");
    a.label("done");
    a.ldloc(0);
    a.stsfld(0);

    a.ldc_r4(1.5);
    a.ldc_r4(2.25);
    a.add();
    a.stsfld(5);

    a.ldc_r4(3.75);
    a.conv(0x74); // conv.i4
    a.neg();
    a.stsfld(10);
    a.ret();

    b.methods.push(MethodDef::new(
        entry_args(),
        vec![(T_I32, -1), (T_I32, -1)],
        a.finish(),
    ));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 30);
    assert_eq!(vm.static_slot(1).unwrap().1, 3.75f32.to_bits() as i32);
    assert_eq!(vm.static_slot(2).unwrap().1, -3);
}

#[test]
fn element_addresses_support_indirect_access() {
    let mut b = root_only();
    b.statics = vec![(T_I32, -1), (T_I32, -1)];

    let mut a = Asm::new();
    a.ldc_i4(3);
    a.newarr(T_I32, None);
    a.stloc(T_REF, 0);
    // arr[1] = 42, read back through ldelema + ldind.
    a.ldloc(0);
    a.ldc_i4(1);
    a.ldc_i4(42);
    a.stelem(T_I32);
    a.ldloc(0);
    a.ldc_i4(1);
    a.ldelema();
    a.ldind(T_I32);
    a.stsfld(0);
    // *(&arr[2]) = 7 through stind, read back with ldelem.
    a.ldloc(0);
    a.ldc_i4(2);
    a.ldelema();
    a.ldc_i4(7);
    a.stind(T_I32);
    a.ldloc(0);
    a.ldc_i4(2);
    a.ldelem(T_I32);
    a.stsfld(5);
    a.ret();

    b.methods.push(MethodDef::new(
        entry_args(),
        vec![(T_REF, -1)],
        a.finish(),
    ));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 42);
    assert_eq!(vm.static_slot(1).unwrap().1, 7);
}

#[test]
fn comparisons_produce_int_flags() {
    let mut b = root_only();
    b.statics = vec![(T_I32, -1), (T_I32, -1)];

    let mut a = Asm::new();
    // (10 - 3) == 7  ->  1
    a.ldc_i4(10);
    a.ldc_i4(3);
    a.sub();
    a.ldc_i4(7);
    a.ceq();
    a.stsfld(0);
    // (10 % 3) < 2  ->  taken branch
    a.ldc_i4(10);
    a.ldc_i4(3);
    a.rem();
    a.ldc_i4(2);
    a.clt();
    a.brtrue("less");
    a.ldc_i4(0);
    a.br("store");
    a.label("less");
    a.ldc_i4(1);
    a.label("store");
    a.stsfld(5);
    a.ret();
    b.methods
        .push(MethodDef::new(entry_args(), vec![], a.finish()));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 1);
    assert_eq!(vm.static_slot(1).unwrap().1, 1);
}

#[test]
fn argument_stores_and_address_loads() {
    let mut b = root_only();
    b.statics = vec![(T_I32, -1)];

    let mut a = Asm::new();
    a.ldc_i4(5);
    a.starg(5); // iteration := 5
    a.ldarga(5);
    a.ldind(T_I32);
    a.stsfld(0);
    a.ldloca(0);
    a.initobj(); // locals are pre-initialized; the address is discarded
    a.ret();
    b.methods.push(MethodDef::new(
        entry_args(),
        vec![(T_I32, -1)],
        a.finish(),
    ));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 9);
    assert_eq!(vm.static_slot(0).unwrap().1, 5);
}

#[test]
fn switch_selects_the_matching_case() {
    let mut b = root_only();
    b.statics = vec![(T_I32, -1)];

    let mut a = Asm::new();
    a.ldarg(5); // iteration selects the case
    a.switch(&["case0", "case1"]);
    a.ldc_i4(99); // fallthrough
    a.br("store");
    a.label("case0");
    a.ldc_i4(10);
    a.br("store");
    a.label("case1");
    a.ldc_i4(20);
    a.label("store");
    a.stsfld(0);
    a.ret();
    b.methods
        .push(MethodDef::new(entry_args(), vec![], a.finish()));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 10);
    run_with_snapshot(&mut vm, 1);
    assert_eq!(vm.static_slot(0).unwrap().1, 20);
    run_with_snapshot(&mut vm, 2);
    assert_eq!(vm.static_slot(0).unwrap().1, 99);
}

#[test]
fn return_values_land_on_the_caller_stack() {
    let mut b = root_only();
    b.statics = vec![(T_I32, -1)];

    // Method 1: add(a, b) -> a + b.
    let mut addm = Asm::new();
    addm.ldarg(0);
    addm.ldarg(5);
    addm.add();
    addm.ret();

    let mut entry = Asm::new();
    entry.ldc_i4(19);
    entry.ldc_i4(23);
    entry.call(1);
    entry.stsfld(0);
    entry.ret();

    b.methods
        .push(MethodDef::new(entry_args(), vec![], entry.finish()));
    b.methods.push(MethodDef::new(
        vec![(T_I32, -1), (T_I32, -1)],
        vec![],
        addm.finish(),
    ));

    let (mut vm, _host) = load(&b);
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 42);
}

// =============================================================================
// Fault behavior
// =============================================================================

fn fault_run(entry: Vec<u8>) -> (Vm, SharedHost, relay_runtime::VmError) {
    let mut b = root_only();
    b.statics = vec![(T_I32, -1)];
    b.methods.push(MethodDef::new(entry_args(), vec![], entry));
    let (mut vm, host) = load(&b);
    vm.put_snapshot_buffer(&[0u8; 4]).unwrap();
    let err = vm.run(0).unwrap_err();
    (vm, host, err)
}

#[test]
fn division_by_zero_faults_and_halts() {
    let mut a = Asm::new();
    a.ldc_i4(1);
    a.ldc_i4(0);
    a.div();
    a.ret();
    let (vm, host, err) = fault_run(a.finish());
    assert_eq!(err.kind, FaultKind::Type);
    assert!(vm.is_halted());
    let errors = host.mock().errors.clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1.contains("division by zero"));
}

#[test]
fn null_dereference_is_a_reference_fault() {
    let mut a = Asm::new();
    a.ldnull();
    a.ldlen();
    a.ret();
    let (_, _, err) = fault_run(a.finish());
    assert_eq!(err.kind, FaultKind::Reference);
}

#[test]
fn array_bound_violation_is_a_reference_fault() {
    let mut a = Asm::new();
    a.ldc_i4(2);
    a.newarr(T_I32, None);
    a.ldc_i4(5);
    a.ldelem(T_I32);
    a.ret();
    let (_, _, err) = fault_run(a.finish());
    assert_eq!(err.kind, FaultKind::Reference);
}

#[test]
fn unknown_opcode_reports_its_il_offset() {
    let (_, _, err) = fault_run(vec![0xFF]);
    assert_eq!(err.kind, FaultKind::Image);
    assert_eq!(err.il_offset, Some(0));
}

#[test]
fn runaway_recursion_hits_the_frame_depth_cap() {
    let mut b = root_only();
    let mut entry = Asm::new();
    entry.call(1);
    entry.ret();
    let mut rec = Asm::new();
    rec.call(1);
    rec.ret();
    b.methods
        .push(MethodDef::new(entry_args(), vec![], entry.finish()));
    b.methods.push(MethodDef::new(vec![], vec![], rec.finish()));

    let (mut vm, _host) = load(&b);
    vm.put_snapshot_buffer(&[0u8; 4]).unwrap();
    let err = vm.run(0).unwrap_err();
    assert_eq!(err.kind, FaultKind::Memory);
    assert!(err.message.contains("depth"));
}

#[test]
fn pushing_past_max_stack_is_a_memory_fault() {
    let mut b = root_only();
    let mut a = Asm::new();
    a.ldc_i4(1);
    a.ldc_i4(2);
    a.ret();
    let mut m = MethodDef::new(entry_args(), vec![], a.finish());
    m.max_stack = 8; // one slot only
    b.methods.push(m);

    let (mut vm, _host) = load(&b);
    vm.put_snapshot_buffer(&[0u8; 4]).unwrap();
    let err = vm.run(0).unwrap_err();
    assert_eq!(err.kind, FaultKind::Memory);
    assert!(err.message.contains("max-stack"));
}

#[test]
fn entry_method_signature_is_validated() {
    let mut b = root_only();
    let mut a = Asm::new();
    a.ret();
    // Wrong shape: (Int32) without the reference `this`.
    b.methods
        .push(MethodDef::new(vec![(T_I32, -1)], vec![], a.finish()));

    let (mut vm, _host) = load(&b);
    vm.put_snapshot_buffer(&[0u8; 4]).unwrap();
    let err = vm.run(0).unwrap_err();
    assert_eq!(err.kind, FaultKind::Image);
    assert!(err.message.contains("Entry"));
}

#[test]
fn registered_builtins_extend_the_table_monotonically() {
    fn add_ten_thousand(vm: &mut Vm, eptr: &mut usize) -> VmResult<()> {
        let v = vm.pop_i32(eptr)?;
        vm.push_i32(eptr, v + 10_000)
    }

    let mut b = root_only();
    b.statics = vec![(T_I32, -1)];
    let mut a = Asm::new();
    a.ldc_i4(5);
    a.call_builtin(121); // first extension slot
    a.stsfld(0);
    a.ret();
    b.methods
        .push(MethodDef::new(entry_args(), vec![], a.finish()));

    let host = SharedHost::new();
    let mut vm = Vm::new(Box::new(host.clone()));
    let idx = vm.register_builtin(add_ten_thousand).unwrap();
    assert_eq!(idx, 121);
    vm.set_program(&b.build(), MEMORY_SIZE).unwrap();
    run_with_snapshot(&mut vm, 0);
    assert_eq!(vm.static_slot(0).unwrap().1, 10_005);
}
