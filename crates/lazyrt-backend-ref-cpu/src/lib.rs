//! Reference CPU device.
//!
//! Kernels are rendered to a JSON [`KernelIr`], "compiled" into a validated `bincode`
//! blob, and interpreted element by element. It favours obviously-correct semantics over
//! speed and serves as the default host device.

pub mod interpreter;
pub mod kernel;

use std::sync::Arc;

use lazyrt::device::{
    allocator_for, Allocator, ArtifactCache, Backend, CompilerConfig, Device, DeviceRegistry,
    HostAllocator, KernelOptions, Program, RenderedKernel,
};
use lazyrt::{RuntimeConfig, RuntimeError, RuntimeResult};

pub use interpreter::InterpretedProgram;
pub use kernel::{CpuRenderer, KernelIr};

pub const DEVICE_KIND: &str = "CPU";

pub struct RefCpuBackend {
    name: String,
    options: KernelOptions,
    compiler: CompilerConfig,
    allocator: Arc<dyn Allocator>,
}

impl RefCpuBackend {
    pub fn new(name: &str, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            name: name.to_string(),
            options: KernelOptions::host(name),
            compiler: CompilerConfig::new("lazyrt-ref-interp", "kernel-ir-v1"),
            allocator,
        }
    }

    pub fn from_config(name: &str, config: &RuntimeConfig) -> Self {
        let allocator = allocator_for(name, Arc::new(HostAllocator::new(name)), config);
        Self::new(name, allocator)
    }
}

impl Backend for RefCpuBackend {
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
        let ir = KernelIr::parse(source)?;
        bincode::serialize(&ir).map_err(|err| {
            RuntimeError::compile("ref-interp", format!("failed to encode kernel: {err}"), source)
        })
    }

    fn load_program(
        &self,
        kernel: &RenderedKernel,
        artifact: Arc<[u8]>,
    ) -> RuntimeResult<Box<dyn Program>> {
        let program = InterpretedProgram::from_artifact(&kernel.name, &artifact)?;
        Ok(Box::new(program))
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }
}

/// Device factory registered under `CPU`.
pub fn cpu_device(
    name: &str,
    config: &RuntimeConfig,
    artifacts: Arc<ArtifactCache>,
) -> RuntimeResult<Device> {
    Ok(Device::new(
        name,
        Arc::new(RefCpuBackend::from_config(name, config)),
        Arc::new(CpuRenderer),
        artifacts,
    ))
}

/// Registers the `CPU` factory. Called automatically for the global registry.
pub fn register(registry: &DeviceRegistry) {
    registry.register_factory(DEVICE_KIND, cpu_device);
}

#[lazyrt::linkme::distributed_slice(lazyrt::device::DEVICE_REGISTRARS)]
static REGISTER_CPU_DEVICE: fn(&DeviceRegistry) = register;
