use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use lazyrt::device::{KernelOptions, KernelSignature, RenderedKernel, Renderer};
use lazyrt::ops::{BinaryOp, OpArg};
use lazyrt::shape::fixed;
use lazyrt::{
    DType, DeviceRegistry, LazyBuffer, LazyOp, RuntimeConfig, RuntimeError, RuntimeResult,
    ScheduleItem, View,
};
use lazyrt_backend_cuda::{cuda_device, is_available};

fn cuda_present() -> bool {
    let present = is_available();
    if !present {
        eprintln!("skipping: no CUDA driver or device");
    }
    present
}

fn add_one_kernel(local: usize) -> impl Fn(&LazyOp, &KernelOptions) -> RuntimeResult<RenderedKernel> {
    move |_: &LazyOp, _: &KernelOptions| {
        Ok(RenderedKernel {
            name: "add_one".to_string(),
            source: "extern \"C\" __global__ void add_one(float *out, const float *in) {\n\
                     \x20 int i = blockIdx.x * blockDim.x + threadIdx.x;\n\
                     \x20 if (i < 4) out[i] = in[i] + 1.0f;\n\
                     }\n"
                .to_string(),
            signature: KernelSignature::new(2, Vec::new()).with_launch([1, 1, 1], [local, 1, 1]),
        })
    }
}

fn registry_with(renderer: Arc<dyn Renderer>) -> (tempfile::TempDir, DeviceRegistry) {
    let dir = tempfile::tempdir().expect("cache dir");
    let registry = DeviceRegistry::new(RuntimeConfig::isolated(dir.path()));
    registry.register_factory("CUDA", move |name, config, artifacts| {
        cuda_device(name, config, artifacts, Arc::clone(&renderer))
    });
    (dir, registry)
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn add_one_ast() -> Arc<LazyOp> {
    let shape = fixed(&[4]);
    let one = LazyOp::constant(1.0, DType::F32, View::contiguous(shape.clone()));
    let sum = LazyOp::new(
        BinaryOp::Add,
        vec![LazyOp::load(1, DType::F32, View::contiguous(shape.clone())), one],
        OpArg::None,
    );
    LazyOp::store(sum, DType::F32, View::contiguous(shape))
}

fn schedule_add_one(registry: &DeviceRegistry, wait: bool) -> RuntimeResult<Arc<LazyBuffer>> {
    let device = registry.get("CUDA")?;
    let input = device.alloc(4, DType::F32)?;
    input.copyin(&f32_bytes(&[1.0, 2.0, 3.0, 4.0]))?;
    let src = LazyBuffer::realized_from(fixed(&[4]), Arc::new(input));
    let ast = add_one_ast();
    let out = LazyBuffer::new("CUDA", fixed(&[4]), DType::F32, Arc::clone(&ast));
    let mut schedule: VecDeque<_> = vec![ScheduleItem::new(ast, Arc::clone(&out), vec![src])].into();
    lazyrt::ScheduleExecutor::new(registry)
        .wait(wait)
        .run(&mut schedule)?;
    Ok(out)
}

fn skip_without_compiler(result: &RuntimeResult<Arc<LazyBuffer>>) -> bool {
    if let Err(RuntimeError::Unavailable { reason, .. }) = result {
        eprintln!("skipping: {reason}");
        return true;
    }
    false
}

#[test]
fn kernels_run_asynchronously_and_drain_on_read() -> Result<()> {
    if !cuda_present() {
        return Ok(());
    }
    let (_dir, registry) = registry_with(Arc::new(add_one_kernel(4)));
    let result = schedule_add_one(&registry, false);
    if skip_without_compiler(&result) {
        return Ok(());
    }
    let out = result?;
    let values = f32_values(&out.realized().expect("realized").to_host()?);
    assert_eq!(values, vec![2.0, 3.0, 4.0, 5.0]);
    registry.get("CUDA")?.synchronize()?;
    Ok(())
}

#[test]
fn oversized_local_group_is_rejected_at_load() -> Result<()> {
    if !cuda_present() {
        return Ok(());
    }
    let (_dir, registry) = registry_with(Arc::new(add_one_kernel(1 << 16)));
    let result = schedule_add_one(&registry, true);
    if skip_without_compiler(&result) {
        return Ok(());
    }
    match result {
        Err(RuntimeError::HardwareLimit { requested, max }) => {
            assert_eq!(requested, 1 << 16);
            assert!(max < requested);
        }
        other => panic!("expected hardware limit, got {other:?}"),
    }
    Ok(())
}

#[test]
fn same_device_copies_use_the_copy_stream() -> Result<()> {
    if !cuda_present() {
        return Ok(());
    }
    let (_dir, registry) = registry_with(Arc::new(add_one_kernel(4)));
    let device = registry.get("CUDA")?;
    let src = device.alloc(3, DType::F32)?;
    src.copyin(&f32_bytes(&[7.0, 8.0, 9.0]))?;
    let dst = device.alloc(3, DType::F32)?;
    dst.transfer_from(&src)?;
    assert_eq!(f32_values(&dst.to_host()?), vec![7.0, 8.0, 9.0]);
    Ok(())
}

#[test]
fn impossible_allocation_reports_out_of_memory() -> Result<()> {
    if !cuda_present() {
        return Ok(());
    }
    let (_dir, registry) = registry_with(Arc::new(add_one_kernel(4)));
    let device = registry.get("CUDA")?;
    let err = device
        .alloc(1 << 48, DType::F32)
        .expect_err("allocation must fail");
    assert!(
        matches!(err, RuntimeError::OutOfMemory { size, dtype: DType::F32, .. } if size == 1 << 48),
        "{err:?}"
    );
    Ok(())
}
