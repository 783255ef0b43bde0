//! Device abstraction: backends, programs, renderers and the per-device runner cache.
//!
//! A [`Device`] binds one [`Backend`] (allocator, compiler, program loader) to a
//! [`Renderer`] supplied by the kernel-generation layer and a shared [`ArtifactCache`].
//! The executor only ever talks to a device through [`Device::alloc`] and
//! [`Device::get_runner`].

mod allocator;
mod artifact_cache;
mod buffer;
mod host;
mod registry;
mod runner;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use allocator::{
    allocator_for, downcast_raw, AllocFailure, Allocator, DirectAllocator, LruAllocator,
    PoolStats, RawAllocator, RawBuffer,
};
pub use artifact_cache::{ArtifactCache, ArtifactKey};
pub use buffer::Buffer;
pub use host::{HostAllocation, HostAllocator, HOST_ALIGNMENT};
pub use registry::{canonicalize, DeviceFactory, DeviceRegistry, DEVICE_REGISTRARS};
pub use runner::CompiledRunner;

use crate::error::{RuntimeError, RuntimeResult};
use crate::hashing::Fnv1a;
use crate::ops::LazyOp;
use crate::shape::Variable;
use crate::tensor::DType;

/// Capability flags the kernel generator consults when rendering for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelOptions {
    pub device: String,
    pub supports_float4: bool,
    pub has_local: bool,
    pub has_shared: bool,
    pub global_max: Option<[usize; 3]>,
    pub local_max: Option<[usize; 3]>,
    pub shared_max: usize,
}

impl KernelOptions {
    /// Options for a device without work-groups or shared memory.
    pub fn host(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            supports_float4: false,
            has_local: false,
            has_shared: false,
            global_max: None,
            local_max: None,
            shared_max: 0,
        }
    }
}

/// Compiler identity and flags; part of the artifact cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerConfig {
    pub compiler: String,
    pub target: String,
    pub flags: Vec<String>,
}

impl CompilerConfig {
    pub fn new(compiler: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            compiler: compiler.into(),
            target: target.into(),
            flags: Vec::new(),
        }
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Stable digest over the serialized configuration.
    pub fn digest(&self) -> RuntimeResult<u64> {
        let bytes = bincode::serialize(self).map_err(|err| {
            RuntimeError::execution(format!("failed to serialize compiler config: {err}"))
        })?;
        Ok(Fnv1a::new().bytes(&bytes).finish())
    }
}

/// Launch metadata produced alongside kernel source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    /// Buffer arguments, output first.
    pub buffers: usize,
    /// Integer arguments, bound from the schedule item's variable values in this order.
    pub vars: Vec<Variable>,
    pub global_size: Option<[usize; 3]>,
    pub local_size: Option<[usize; 3]>,
}

impl KernelSignature {
    pub fn new(buffers: usize, vars: Vec<Variable>) -> Self {
        Self {
            buffers,
            vars,
            global_size: None,
            local_size: None,
        }
    }

    pub fn with_launch(mut self, global: [usize; 3], local: [usize; 3]) -> Self {
        self.global_size = Some(global);
        self.local_size = Some(local);
        self
    }

    /// Threads per work-group, or 1 without a local size.
    pub fn local_threads(&self) -> usize {
        self.local_size.map_or(1, |local| local.iter().product())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedKernel {
    pub name: String,
    pub source: String,
    pub signature: KernelSignature,
}

/// Kernel-generation collaborator: turns an operation tree into backend source.
pub trait Renderer: Send + Sync {
    fn render(&self, ast: &LazyOp, options: &KernelOptions) -> RuntimeResult<RenderedKernel>;
}

impl<F> Renderer for F
where
    F: Fn(&LazyOp, &KernelOptions) -> RuntimeResult<RenderedKernel> + Send + Sync,
{
    fn render(&self, ast: &LazyOp, options: &KernelOptions) -> RuntimeResult<RenderedKernel> {
        self(ast, options)
    }
}

/// Loaded, invocable kernel with a fixed argument arity.
pub trait Program: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the kernel. With `wait` set the call blocks until completion and reports
    /// the elapsed time; otherwise it may return as soon as the work is submitted.
    fn invoke(
        &self,
        bufs: &[&RawBuffer],
        vars: &[i32],
        wait: bool,
    ) -> RuntimeResult<Option<Duration>>;
}

/// Capability interface implemented once per backend.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn kernel_options(&self) -> &KernelOptions;

    fn compiler_config(&self) -> &CompilerConfig;

    /// Source to artifact bytes. Wrapped by the artifact cache, so it only runs on a miss.
    fn compile(&self, source: &str) -> RuntimeResult<Vec<u8>>;

    fn load_program(
        &self,
        kernel: &RenderedKernel,
        artifact: Arc<[u8]>,
    ) -> RuntimeResult<Box<dyn Program>>;

    fn allocator(&self) -> Arc<dyn Allocator>;

    /// Blocks until every submitted command has completed.
    fn synchronize(&self) -> RuntimeResult<()> {
        Ok(())
    }
}

pub struct Device {
    name: String,
    backend: Arc<dyn Backend>,
    renderer: Arc<dyn Renderer>,
    artifacts: Arc<ArtifactCache>,
    runners: Mutex<HashMap<Arc<LazyOp>, Arc<CompiledRunner>>>,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        renderer: Arc<dyn Renderer>,
        artifacts: Arc<ArtifactCache>,
    ) -> Self {
        let name = name.into();
        tracing::info!(device = %name, backend = backend.name(), "device created");
        Self {
            name,
            backend,
            renderer,
            artifacts,
            runners: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn kernel_options(&self) -> &KernelOptions {
        self.backend.kernel_options()
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        self.backend.allocator()
    }

    pub fn alloc(&self, size: usize, dtype: DType) -> RuntimeResult<Buffer> {
        Buffer::new(self.backend.allocator(), size, dtype)
    }

    /// Returns the runner for `ast`, rendering, compiling and loading it on first use.
    pub fn get_runner(&self, ast: &Arc<LazyOp>) -> RuntimeResult<Arc<CompiledRunner>> {
        if let Some(found) = self
            .runners
            .lock()
            .expect("runner cache mutex poisoned")
            .get(ast)
            .cloned()
        {
            tracing::trace!(device = %self.name, kernel = found.name(), "runner cache hit");
            return Ok(found);
        }

        let kernel = self.renderer.render(ast, self.backend.kernel_options())?;
        let backend = Arc::clone(&self.backend);
        let artifact = self.artifacts.get_or_compile(
            self.backend.name(),
            &kernel.source,
            self.backend.compiler_config(),
            |source| backend.compile(source),
        )?;
        let program = self.backend.load_program(&kernel, artifact)?;
        tracing::info!(device = %self.name, kernel = %kernel.name, "built runner");
        let runner = Arc::new(CompiledRunner::new(
            self.name.clone(),
            kernel.name,
            kernel.signature,
            program,
        ));

        let mut runners = self.runners.lock().expect("runner cache mutex poisoned");
        Ok(Arc::clone(
            runners.entry(Arc::clone(ast)).or_insert(runner),
        ))
    }

    pub fn cached_runners(&self) -> usize {
        self.runners
            .lock()
            .expect("runner cache mutex poisoned")
            .len()
    }

    pub fn synchronize(&self) -> RuntimeResult<()> {
        self.backend.synchronize()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .finish()
    }
}
