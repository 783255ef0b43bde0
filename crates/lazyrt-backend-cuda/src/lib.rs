//! CUDA command-queue device (`CUDA`).
//!
//! The driver library and NVRTC are loaded at runtime, so the crate builds without a CUDA
//! toolkit and devices report [`lazyrt::RuntimeError::Unavailable`] when none is present.
//! Each device owns its own context, streams and in-flight ledger.

pub mod allocator;
pub mod compiler;
pub mod context;
pub mod driver;
pub mod program;

use std::sync::Arc;

use lazyrt::device::{
    allocator_for, Allocator, ArtifactCache, Backend, CompilerConfig, Device, KernelOptions,
    Program, RenderedKernel, Renderer,
};
use lazyrt::{RuntimeConfig, RuntimeResult};

pub use allocator::{CudaAllocation, CudaRawAllocator};
pub use compiler::compile_ptx;
pub use context::CudaContext;
pub use driver::{driver, is_available, ordinal_of, CudaDriver};
pub use program::CudaProgram;

use driver::{
    CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X, CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X,
    CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK, CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
};

pub const DEVICE_KIND: &str = "CUDA";

pub struct CudaBackend {
    name: String,
    context: Arc<CudaContext>,
    options: KernelOptions,
    compiler: CompilerConfig,
    arch: String,
    offline: bool,
    allocator: Arc<dyn Allocator>,
}

impl CudaBackend {
    pub fn new(name: &str, config: &RuntimeConfig) -> RuntimeResult<Self> {
        let context = Arc::new(CudaContext::new(driver()?, ordinal_of(name)?)?);
        let arch = context.arch()?;
        let options = kernel_options(name, &context)?;
        let offline = config.cuda_offline_compiler;
        let compiler = CompilerConfig::new(if offline { "nvcc" } else { "nvrtc" }, arch.clone())
            .with_flags(["--ptx"]);
        let raw = Arc::new(CudaRawAllocator::new(Arc::clone(&context), config.slow_copy));
        let allocator = allocator_for(name, raw, config);
        tracing::info!(device = name, %arch, offline, "CUDA backend ready");
        Ok(Self {
            name: name.to_string(),
            context,
            options,
            compiler,
            arch,
            offline,
            allocator,
        })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }
}

fn kernel_options(name: &str, context: &CudaContext) -> RuntimeResult<KernelOptions> {
    let dim = |attrib| -> RuntimeResult<usize> {
        Ok(usize::try_from(context.attribute(attrib)?).unwrap_or(0))
    };
    let block_x = dim(CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?;
    let threads = dim(CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?;
    Ok(KernelOptions {
        device: name.to_string(),
        supports_float4: true,
        has_local: true,
        has_shared: true,
        global_max: Some([dim(CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?, 65535, 65535]),
        local_max: Some([block_x.min(threads), 1024, 64]),
        shared_max: dim(CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)?,
    })
}

impl Backend for CudaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kernel_options(&self) -> &KernelOptions {
        &self.options
    }

    fn compiler_config(&self) -> &CompilerConfig {
        &self.compiler
    }

    fn compile(&self, source: &str) -> RuntimeResult<Vec<u8>> {
        compile_ptx(source, &self.arch, self.offline)
    }

    fn load_program(
        &self,
        kernel: &RenderedKernel,
        artifact: Arc<[u8]>,
    ) -> RuntimeResult<Box<dyn Program>> {
        let program = CudaProgram::load(
            Arc::clone(&self.context),
            &kernel.name,
            &artifact,
            &kernel.signature,
        )?;
        Ok(Box::new(program))
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    fn synchronize(&self) -> RuntimeResult<()> {
        self.context.synchronize()
    }
}

/// Builds a `CUDA` device with the caller's CUDA C renderer.
pub fn cuda_device(
    name: &str,
    config: &RuntimeConfig,
    artifacts: Arc<ArtifactCache>,
    renderer: Arc<dyn Renderer>,
) -> RuntimeResult<Device> {
    let backend = CudaBackend::new(name, config)?;
    Ok(Device::new(name, Arc::new(backend), renderer, artifacts))
}
