mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{add_one, add_one_through, f32_values, harness, load_op, unrealized};
use lazyrt::ops::{CustomOp, OpArg};
use lazyrt::shape::{fixed, Dim, Dims};
use lazyrt::{
    BufferOrigin, ContractViolation, DType, LazyOp, LoadOp, RuntimeError, ScheduleExecutor,
    ScheduleItem, Variable, View,
};

#[test]
fn empty_allocates_requested_storage() {
    let h = harness();
    let ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let out = unrealized("cpu", fixed(&[4]), DType::F32, &ast);
    h.run(vec![ScheduleItem::new(ast, Arc::clone(&out), Vec::new())])
        .expect("run");

    let buffer = out.realized().expect("realized");
    assert_eq!(buffer.size(), 4);
    assert_eq!(buffer.dtype(), DType::F32);
    assert_eq!(buffer.device(), "CPU");
    assert!(out.op().is_none(), "op is released after realization");
}

#[test]
fn seeded_fill_is_reproducible() {
    let h = harness();
    let fill = |seed| {
        let ast = load_op(LoadOp::Rand, Vec::new(), OpArg::Seed(seed));
        let out = unrealized("cpu", fixed(&[1000]), DType::F32, &ast);
        h.run(vec![ScheduleItem::new(ast, Arc::clone(&out), Vec::new())])
            .expect("run");
        out.realized().expect("realized").to_host().expect("to_host")
    };
    let first = fill(42);
    let second = fill(42);
    assert_eq!(first, second);
    assert_ne!(first, fill(43));
    assert!(f32_values(&first).iter().all(|v| (0.0..1.0).contains(v)));
}

#[test]
fn cross_device_copy_transfers_contents() {
    let h = harness();
    let src = h.realized("cpu:1", fixed(&[3]), &[1.0, 2.0, 3.0]);
    let ast = load_op(
        LoadOp::From,
        vec![LazyOp::load(1, DType::F32, View::contiguous(fixed(&[3])))],
        OpArg::None,
    );
    let out = unrealized("cpu", fixed(&[3]), DType::F32, &ast);
    h.run(vec![ScheduleItem::new(ast, Arc::clone(&out), vec![src])])
        .expect("run");
    let bytes = out.realized().expect("realized").to_host().expect("to_host");
    assert_eq!(f32_values(&bytes), vec![1.0, 2.0, 3.0]);
}

#[test]
fn cross_device_size_mismatch_fails_without_realizing() {
    let h = harness();
    let src = h.realized("cpu:1", fixed(&[9]), &[0.5; 9]);
    let ast = load_op(
        LoadOp::From,
        vec![LazyOp::load(1, DType::F32, View::contiguous(fixed(&[9])))],
        OpArg::None,
    );
    let out = unrealized("cpu", fixed(&[10]), DType::F32, &ast);
    let err = h
        .run(vec![ScheduleItem::new(ast, Arc::clone(&out), vec![src])])
        .expect_err("size mismatch");
    assert!(matches!(
        err,
        RuntimeError::SizeMismatch {
            expected: 10,
            actual: 9,
            ..
        }
    ));
    assert!(!out.is_realized());
}

#[test]
fn contiguous_alias_adopts_the_assigned_buffer() {
    let h = harness();
    let input = h.realized("cpu", fixed(&[4]), &[1.0, 2.0, 3.0, 4.0]);
    let shared = Arc::clone(input.realized().expect("input realized"));
    let ast = add_one(4);
    let out = unrealized("cpu", fixed(&[4]), DType::F32, &ast).with_output_buffer(Arc::clone(&shared));

    h.run(vec![ScheduleItem::new(ast, Arc::clone(&out), vec![input])])
        .expect("run");

    let realized = out.realization().expect("realized");
    assert!(Arc::ptr_eq(&realized.buffer, &shared));
    assert_eq!(realized.origin, BufferOrigin::Adopted);
    let bytes = shared.to_host().expect("to_host");
    assert_eq!(f32_values(&bytes), vec![2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn strided_alias_forces_fresh_allocation() {
    let h = harness();
    let input = h.realized("cpu", fixed(&[2, 2]), &[1.0, 2.0, 3.0, 4.0]);
    let shared = Arc::clone(input.realized().expect("input realized"));
    let transposed = View::contiguous(fixed(&[2, 2])).permute(&[1, 0]);
    let ast = add_one_through(transposed, View::contiguous(fixed(&[2, 2])));
    let out = unrealized("cpu", fixed(&[2, 2]), DType::F32, &ast).with_output_buffer(Arc::clone(&shared));

    h.run(vec![ScheduleItem::new(ast, Arc::clone(&out), vec![input])])
        .expect("run");

    let realized = out.realization().expect("realized");
    assert!(!Arc::ptr_eq(&realized.buffer, &shared));
    assert_eq!(realized.origin, BufferOrigin::Allocated);
    let fresh = realized.buffer.to_host().expect("to_host");
    assert_eq!(f32_values(&fresh), vec![2.0, 4.0, 3.0, 5.0]);
    let untouched = shared.to_host().expect("to_host");
    assert_eq!(f32_values(&untouched), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn assigned_buffer_without_alias_is_adopted() {
    let h = harness();
    let input = h.realized("cpu", fixed(&[2]), &[5.0, 6.0]);
    let target = h.buffer("cpu", &[0.0, 0.0]);
    let ast = add_one(2);
    let out = unrealized("cpu", fixed(&[2]), DType::F32, &ast).with_output_buffer(Arc::clone(&target));
    h.run(vec![ScheduleItem::new(ast, Arc::clone(&out), vec![input])])
        .expect("run");
    assert!(Arc::ptr_eq(out.realized().expect("realized"), &target));
    assert_eq!(f32_values(&target.to_host().expect("to_host")), vec![6.0, 7.0]);
}

#[test]
fn symbolic_output_is_sized_to_the_maximum() {
    let h = harness();
    let seq = Variable::new("seq", 1, 8).expect("variable bounds");
    let shape: Dims = [Dim::Symbolic(seq.clone())].into_iter().collect();
    let input = h.realized("cpu", shape.clone(), &[1.0; 8]);
    let ast = add_one_through(View::contiguous(shape.clone()), View::contiguous(shape.clone()));
    let out = unrealized("cpu", shape, DType::F32, &ast);

    h.run(vec![ScheduleItem::new(ast, Arc::clone(&out), vec![input]).with_var(seq, 3)])
        .expect("run");

    let buffer = out.realized().expect("realized");
    assert_eq!(buffer.size(), 8);
    let values = f32_values(&buffer.to_host().expect("to_host"));
    assert_eq!(&values[..3], &[2.0, 2.0, 2.0]);
    assert!(values[3..].iter().all(|v| *v == 0.0));
}

#[test]
fn unbound_variable_is_an_execution_error() {
    let h = harness();
    let seq = Variable::new("seq", 1, 4).expect("variable bounds");
    let shape: Dims = [Dim::Symbolic(seq)].into_iter().collect();
    let input = h.realized("cpu", shape.clone(), &[1.0; 4]);
    let ast = add_one_through(View::contiguous(shape.clone()), View::contiguous(shape.clone()));
    let out = unrealized("cpu", shape, DType::F32, &ast);
    let err = h
        .run(vec![ScheduleItem::new(ast, out, vec![input])])
        .expect_err("seq is unbound");
    assert!(matches!(err, RuntimeError::Execution { .. }));
}

#[test]
fn malformed_load_op_sources_are_rejected() {
    let h = harness();
    let src = h.realized("cpu", fixed(&[4]), &[0.0; 4]);
    let cases = vec![
        LazyOp::load(2, DType::F32, View::contiguous(fixed(&[4]))),
        LazyOp::load(1, DType::F32, View::contiguous(fixed(&[2, 2])).permute(&[1, 0])),
        LazyOp::constant(0.0, DType::F32, View::contiguous(fixed(&[4]))),
    ];
    for source in cases {
        let ast = load_op(LoadOp::From, vec![source], OpArg::None);
        let out = unrealized("cpu", fixed(&[4]), DType::F32, &ast);
        let err = h
            .run(vec![ScheduleItem::new(ast, Arc::clone(&out), vec![Arc::clone(&src)])])
            .expect_err("malformed load op");
        assert!(matches!(
            err.as_contract(),
            Some(ContractViolation::MalformedLoadOp { index: 0, .. })
        ));
        assert!(!out.is_realized());
    }
}

#[test]
fn zero_size_items_skip_dispatch() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let custom = CustomOp::new("count", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let custom_ast = load_op(LoadOp::Custom, Vec::new(), OpArg::Custom(custom));
    let custom_out = unrealized("cpu", fixed(&[0]), DType::F32, &custom_ast);

    let input = h.realized("cpu", fixed(&[0]), &[]);
    let kernel_ast = add_one(0);
    let kernel_out = unrealized("cpu", fixed(&[0]), DType::F32, &kernel_ast);

    h.run(vec![
        ScheduleItem::new(custom_ast, Arc::clone(&custom_out), Vec::new()),
        ScheduleItem::new(kernel_ast, Arc::clone(&kernel_out), vec![input]),
    ])
    .expect("run");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    for out in [&custom_out, &kernel_out] {
        let buffer = out.realized().expect("realized");
        assert_eq!(buffer.size(), 0);
        assert!(buffer.to_host().expect("to_host").is_empty());
    }
    assert_eq!(h.registry.get("cpu").expect("cpu").cached_runners(), 0);
}

#[test]
fn items_realize_in_submitted_order() {
    let h = harness();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut items = Vec::new();
    let mut outs = Vec::new();
    for step in 0..3 {
        let log = Arc::clone(&order);
        let custom = CustomOp::new(format!("step{step}"), move |_, _| {
            log.lock().expect("order log").push(step);
            Ok(())
        });
        let ast = load_op(LoadOp::Custom, Vec::new(), OpArg::Custom(custom));
        let out = unrealized("cpu", fixed(&[1]), DType::F32, &ast);
        outs.push(Arc::clone(&out));
        items.push(ScheduleItem::new(ast, out, Vec::new()));
    }
    let remaining = h.run(items).expect("run");
    assert!(remaining.is_empty());
    assert_eq!(*order.lock().expect("order log"), vec![0, 1, 2]);
    assert!(outs.iter().all(|out| out.is_realized()));
}

#[test]
fn chained_items_feed_each_other() {
    let h = harness();
    let input = h.realized("cpu", fixed(&[2]), &[0.0, 10.0]);
    let first_ast = add_one(2);
    let first = unrealized("cpu", fixed(&[2]), DType::F32, &first_ast);
    let second_ast = add_one(2);
    let second = unrealized("cpu", fixed(&[2]), DType::F32, &second_ast);
    h.run(vec![
        ScheduleItem::new(first_ast, Arc::clone(&first), vec![input]),
        ScheduleItem::new(second_ast, Arc::clone(&second), vec![Arc::clone(&first)]),
    ])
    .expect("run");
    let bytes = second.realized().expect("realized").to_host().expect("to_host");
    assert_eq!(f32_values(&bytes), vec![2.0, 12.0]);
    // Structurally identical kernels share one runner and one compile.
    assert_eq!(h.registry.get("cpu").expect("cpu").cached_runners(), 1);
    assert_eq!(h.registry.artifacts().compile_count(), 1);
}

#[test]
fn unrealized_input_stops_the_schedule() {
    let h = harness();
    let pending_ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let pending = unrealized("cpu", fixed(&[2]), DType::F32, &pending_ast);
    let ast = add_one(2);
    let out = unrealized("cpu", fixed(&[2]), DType::F32, &ast);
    let tail_ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let tail = unrealized("cpu", fixed(&[2]), DType::F32, &tail_ast);

    let mut schedule: VecDeque<ScheduleItem> = vec![
        ScheduleItem::new(ast, Arc::clone(&out), vec![pending]),
        ScheduleItem::new(tail_ast, Arc::clone(&tail), Vec::new()),
    ]
    .into();
    let err = ScheduleExecutor::new(&h.registry)
        .log_items(false)
        .run(&mut schedule)
        .expect_err("input is not realized");
    assert_eq!(
        err.as_contract(),
        Some(&ContractViolation::UnrealizedInput { index: 0 })
    );
    assert_eq!(schedule.len(), 1, "later items are left unexecuted");
    assert!(!tail.is_realized());
}

#[test]
fn device_mismatch_is_a_contract_violation() {
    let h = harness();
    let input = h.realized("cpu:1", fixed(&[2]), &[1.0, 2.0]);
    let ast = add_one(2);
    let out = unrealized("cpu", fixed(&[2]), DType::F32, &ast);
    let err = h
        .run(vec![ScheduleItem::new(ast, out, vec![input])])
        .expect_err("devices differ");
    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::DeviceMismatch { index: 0, .. })
    ));
}

#[test]
fn assigned_buffer_of_wrong_dtype_is_detected() {
    let h = harness();
    let device = h.registry.get("cpu").expect("cpu");
    let wrong = Arc::new(device.alloc(4, DType::I32).expect("alloc"));
    let ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let out = unrealized("cpu", fixed(&[4]), DType::F32, &ast).with_output_buffer(wrong);
    let err = h
        .run(vec![ScheduleItem::new(ast, Arc::clone(&out), Vec::new())])
        .expect_err("dtype mismatch");
    assert_eq!(
        err.as_contract(),
        Some(&ContractViolation::DTypeMismatch {
            realized: DType::I32,
            expected: DType::F32,
        })
    );
    assert!(!out.is_realized());
}

#[test]
fn unknown_device_surfaces_as_error() {
    let h = harness();
    let ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let out = unrealized("tpu", fixed(&[1]), DType::F32, &ast);
    let err = h
        .run(vec![ScheduleItem::new(ast, out, Vec::new())])
        .expect_err("no tpu factory");
    assert!(matches!(err, RuntimeError::UnknownDevice(name) if name == "TPU"));
}

#[test]
fn overflowing_element_count_is_out_of_memory() {
    let h = harness();
    let ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let out = unrealized("cpu", fixed(&[1 << 33, 1 << 33]), DType::F32, &ast);
    let err = h
        .run(vec![ScheduleItem::new(ast, Arc::clone(&out), Vec::new())])
        .expect_err("element count overflows");
    assert!(
        matches!(err, RuntimeError::OutOfMemory { ref device, dtype: DType::F32, .. } if device == "CPU"),
        "{err:?}"
    );
    assert!(!out.is_realized());
}

#[test]
fn overflowing_byte_length_is_out_of_memory() {
    let h = harness();
    let ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let out = unrealized("cpu", fixed(&[1 << 31, 1 << 31]), DType::F32, &ast);
    let err = h
        .run(vec![ScheduleItem::new(ast, Arc::clone(&out), Vec::new())])
        .expect_err("byte length overflows");
    assert!(
        matches!(err, RuntimeError::OutOfMemory { size, dtype: DType::F32, .. } if size == 1 << 62),
        "{err:?}"
    );
    assert!(!out.is_realized());
}
