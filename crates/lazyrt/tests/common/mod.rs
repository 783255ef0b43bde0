#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use lazyrt::device::Buffer;
use lazyrt::ops::{BinaryOp, OpArg};
use lazyrt::shape::{fixed, Dims};
use lazyrt::{DType, DeviceRegistry, LazyBuffer, LazyOp, LoadOp, RuntimeConfig, ScheduleItem, View};

pub struct Harness {
    _dir: tempfile::TempDir,
    pub registry: DeviceRegistry,
}

pub fn harness() -> Harness {
    harness_with(|config| config)
}

pub fn harness_with(tweak: impl FnOnce(RuntimeConfig) -> RuntimeConfig) -> Harness {
    let dir = tempfile::tempdir().expect("create cache dir");
    let registry = DeviceRegistry::new(tweak(RuntimeConfig::isolated(dir.path())));
    lazyrt_backend_ref_cpu::register(&registry);
    Harness {
        _dir: dir,
        registry,
    }
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl Harness {
    /// Realized node on `device` holding `values`.
    pub fn realized(&self, device: &str, shape: Dims, values: &[f32]) -> Arc<LazyBuffer> {
        let buffer = self.buffer(device, values);
        LazyBuffer::realized_from(shape, buffer)
    }

    pub fn buffer(&self, device: &str, values: &[f32]) -> Arc<Buffer> {
        let device = self.registry.get(device).expect("device");
        let buffer = device.alloc(values.len(), DType::F32).expect("alloc");
        buffer.copyin(&f32_bytes(values)).expect("copyin");
        Arc::new(buffer)
    }

    pub fn run(&self, items: Vec<ScheduleItem>) -> lazyrt::RuntimeResult<VecDeque<ScheduleItem>> {
        let mut schedule: VecDeque<ScheduleItem> = items.into();
        lazyrt::run_schedule(&self.registry, &mut schedule)?;
        Ok(schedule)
    }
}

pub fn load_op(op: LoadOp, srcs: Vec<Arc<LazyOp>>, arg: OpArg) -> Arc<LazyOp> {
    LazyOp::new(op, srcs, arg)
}

pub fn unrealized(device: &str, shape: Dims, dtype: DType, ast: &Arc<LazyOp>) -> Arc<LazyBuffer> {
    LazyBuffer::new(device, shape, dtype, Arc::clone(ast))
}

/// `out = in + 1` over a 1-D contiguous shape.
pub fn add_one(n: usize) -> Arc<LazyOp> {
    add_one_through(View::contiguous(fixed(&[n])), View::contiguous(fixed(&[n])))
}

/// `out[store] = in[load] + 1`.
pub fn add_one_through(load: View, store: View) -> Arc<LazyOp> {
    let one = LazyOp::constant(1.0, DType::F32, View::contiguous(load.shape.clone()));
    let sum = LazyOp::new(
        BinaryOp::Add,
        vec![LazyOp::load(1, DType::F32, load), one],
        OpArg::None,
    );
    LazyOp::store(sum, DType::F32, store)
}
