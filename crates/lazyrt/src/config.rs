//! Runtime configuration sourced from `LAZYRT_*` environment variables.

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::env;

const DEFAULT_POOL_LIMIT: usize = 1 << 30;

static GLOBAL_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Deployment knobs consulted by devices, allocators and the artifact cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Root directory for persisted compiled artifacts.
    pub cache_dir: PathBuf,
    /// When false the artifact cache is memory-only.
    pub disk_cache: bool,
    /// Pool freed buffers instead of releasing them (backends with an LRU allocator).
    pub pooling: bool,
    /// Upper bound on bytes held idle by a pooled allocator.
    pub pool_limit_bytes: usize,
    /// Extra vectorizing optimization for the native toolchain.
    pub native_opt: bool,
    /// Native C compiler binary.
    pub native_compiler: String,
    /// Compile GPU kernels with the offline toolchain instead of in-process.
    pub cuda_offline_compiler: bool,
    /// Use the synchronous copy-in path on the GPU queue backend.
    pub slow_copy: bool,
    /// Default device name.
    pub default_device: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            cache_dir: env::path("LAZYRT_CACHE_DIR")
                .unwrap_or_else(|| std::env::temp_dir().join("lazyrt-cache")),
            disk_cache: !env::flag("LAZYRT_DISABLE_DISK_CACHE", false),
            pooling: env::flag("LAZYRT_LRU", true),
            pool_limit_bytes: env::usize_or("LAZYRT_POOL_LIMIT", DEFAULT_POOL_LIMIT),
            native_opt: env::flag("LAZYRT_NATIVE_OPT", false),
            native_compiler: env::string("CC").unwrap_or_else(|| "cc".to_string()),
            cuda_offline_compiler: env::flag("LAZYRT_CUDA_OFFLINE", false),
            slow_copy: env::flag("LAZYRT_SLOW_COPY", false),
            default_device: env::string("LAZYRT_DEVICE"),
        }
    }

    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static RuntimeConfig {
        GLOBAL_CONFIG.get_or_init(RuntimeConfig::from_env)
    }

    /// Configuration rooted at `cache_dir`, ignoring the environment. Used by tests.
    pub fn isolated(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("lazyrt-cache"),
            disk_cache: true,
            pooling: true,
            pool_limit_bytes: DEFAULT_POOL_LIMIT,
            native_opt: false,
            native_compiler: "cc".to_string(),
            cuda_offline_compiler: false,
            slow_copy: false,
            default_device: None,
        }
    }
}
