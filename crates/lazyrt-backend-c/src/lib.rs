//! Native C device (`CLANG`).
//!
//! Kernel source is C rendered by the kernel-generation layer. The shared [`NativeEngine`]
//! turns it into a shared object, which the artifact cache persists; programs load the
//! object and call the entry point directly on host memory.

pub mod engine;
pub mod program;

use std::sync::Arc;

use lazyrt::device::{
    allocator_for, Allocator, ArtifactCache, Backend, CompilerConfig, Device, HostAllocator,
    KernelOptions, Program, RenderedKernel, Renderer,
};
use lazyrt::{RuntimeConfig, RuntimeResult};

pub use engine::{KernelFn, NativeEngine, NativeFunction};
pub use program::NativeProgram;

pub const DEVICE_KIND: &str = "CLANG";

pub struct ClangBackend {
    name: String,
    options: KernelOptions,
    compiler: CompilerConfig,
    engine: Arc<NativeEngine>,
    allocator: Arc<dyn Allocator>,
}

impl ClangBackend {
    pub fn new(name: &str, engine: Arc<NativeEngine>, allocator: Arc<dyn Allocator>) -> Self {
        let compiler = CompilerConfig::new(engine.compiler(), std::env::consts::ARCH)
            .with_flags(engine.flags().iter().cloned());
        Self {
            name: name.to_string(),
            options: KernelOptions::host(name),
            compiler,
            engine,
            allocator,
        }
    }

    /// Backend on the process-wide engine with a host allocator chosen by `config`.
    pub fn from_config(name: &str, config: &RuntimeConfig) -> RuntimeResult<Self> {
        let engine = NativeEngine::global(config)?;
        let allocator = allocator_for(name, Arc::new(HostAllocator::new(name)), config);
        Ok(Self::new(name, engine, allocator))
    }

    pub fn engine(&self) -> &Arc<NativeEngine> {
        &self.engine
    }
}

impl Backend for ClangBackend {
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
        self.engine.compile(source)
    }

    fn load_program(
        &self,
        kernel: &RenderedKernel,
        artifact: Arc<[u8]>,
    ) -> RuntimeResult<Box<dyn Program>> {
        let function = self.engine.load(&artifact, &kernel.name)?;
        Ok(Box::new(NativeProgram::new(
            kernel.name.clone(),
            kernel.signature.buffers,
            kernel.signature.vars.len(),
            function,
        )))
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }
}

/// Builds a `CLANG` device. C rendering lives outside the runtime, so the caller supplies
/// the renderer; register it with
/// `registry.register_factory("CLANG", move |name, config, artifacts| clang_device(name, config, artifacts, renderer.clone()))`.
pub fn clang_device(
    name: &str,
    config: &RuntimeConfig,
    artifacts: Arc<ArtifactCache>,
    renderer: Arc<dyn Renderer>,
) -> RuntimeResult<Device> {
    let backend = ClangBackend::from_config(name, config)?;
    Ok(Device::new(name, Arc::new(backend), renderer, artifacts))
}
