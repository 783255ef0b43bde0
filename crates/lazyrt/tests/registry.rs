mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{harness, load_op, unrealized};
use lazyrt::device::{Device, HostAllocator, LruAllocator};
use lazyrt::ops::OpArg;
use lazyrt::shape::fixed;
use lazyrt::{DType, DeviceRegistry, LoadOp, RuntimeError, ScheduleItem};
use lazyrt_backend_ref_cpu::{CpuRenderer, RefCpuBackend};

#[test]
fn global_registry_picks_up_linked_backends() {
    // Touch the backend crate so its registrar is linked into this binary.
    let _ = lazyrt_backend_ref_cpu::DEVICE_KIND;
    let _ = lazyrt_backend_ref_cpu::register as fn(&DeviceRegistry);

    let registry = DeviceRegistry::global();
    assert!(registry.has_kind("cpu"), "CPU factory not registered");
    let first = registry.get("cpu").expect("cpu device");
    let second = registry.get("CPU:0").expect("cpu device");
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn default_device_falls_back_to_cpu() {
    let h = harness();
    assert_eq!(h.registry.default_device().expect("default"), "CPU");
}

#[test]
fn injected_devices_are_returned_as_is() {
    let h = harness();
    let device = Arc::new(
        lazyrt_backend_ref_cpu::cpu_device(
            "CPU:7",
            h.registry.config(),
            Arc::clone(h.registry.artifacts()),
        )
        .expect("device"),
    );
    h.registry.insert(Arc::clone(&device));
    let found = h.registry.get("cpu:7").expect("lookup");
    assert!(Arc::ptr_eq(&found, &device));
}

#[test]
fn out_of_memory_carries_request() {
    let h = harness();
    h.registry.register_factory("tiny", |name, _config, artifacts| {
        let raw = Arc::new(HostAllocator::new(name).with_request_limit(64));
        let allocator = Arc::new(LruAllocator::new(name, raw, 1 << 20));
        Ok(Device::new(
            name,
            Arc::new(RefCpuBackend::new(name, allocator)),
            Arc::new(CpuRenderer),
            artifacts,
        ))
    });

    let ast = load_op(LoadOp::Empty, Vec::new(), OpArg::None);
    let out = unrealized("tiny", fixed(&[100]), DType::F32, &ast);
    let err = h
        .run(vec![ScheduleItem::new(ast, Arc::clone(&out), Vec::new())])
        .expect_err("request exceeds device memory");
    match err {
        RuntimeError::OutOfMemory {
            device,
            size,
            dtype,
        } => {
            assert_eq!(device, "TINY");
            assert_eq!(size, 100);
            assert_eq!(dtype, DType::F32);
        }
        other => panic!("expected out of memory, got {other:?}"),
    }
    assert!(!out.is_realized());
}

#[test]
fn concurrent_first_lookups_run_the_factory_once() {
    let h = harness();
    let registry = &h.registry;
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    registry.register_factory("slow", move |name, config, artifacts| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        lazyrt_backend_ref_cpu::cpu_device(name, config, artifacts)
    });

    let barrier = Barrier::new(4);
    let devices: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    registry.get("slow").expect("slow device")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("lookup thread"))
            .collect()
    });

    assert_eq!(built.load(Ordering::SeqCst), 1, "factory ran more than once");
    assert!(devices.iter().all(|device| Arc::ptr_eq(device, &devices[0])));
}

#[test]
fn failed_construction_is_retried_on_next_lookup() {
    let h = harness();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    h.registry.register_factory("flaky", move |name, config, artifacts| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(RuntimeError::execution("first attempt fails"));
        }
        lazyrt_backend_ref_cpu::cpu_device(name, config, artifacts)
    });

    assert!(h.registry.get("flaky").is_err());
    let device = h.registry.get("flaky").expect("second attempt");
    assert_eq!(device.name(), "FLAKY");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
