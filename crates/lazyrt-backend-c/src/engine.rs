//! Process-wide native toolchain: C source in, shared object bytes out, loaded symbols back.

use std::ffi::c_void;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use libloading::Library;
use once_cell::sync::OnceCell;
use tempfile::{TempDir, TempPath};

use lazyrt::{RuntimeConfig, RuntimeError, RuntimeResult};

/// `int kernel(void **bufs, const int *vars)`: buffer pointers output first, then the
/// integer variables in signature order. A non-zero return is reported as a failure.
pub type KernelFn = unsafe extern "C" fn(*mut *mut c_void, *const i32) -> i32;

static GLOBAL_ENGINE: OnceCell<Arc<NativeEngine>> = OnceCell::new();

const BASE_FLAGS: &[&str] = &["-O3", "-fno-math-errno"];
const VECTORIZE_FLAGS: &[&str] = &["-march=native", "-ftree-vectorize", "-funroll-loops"];

pub struct NativeEngine {
    compiler: String,
    flags: Vec<String>,
    scratch: TempDir,
    loaded: Mutex<Vec<LoadedObject>>,
}

struct LoadedObject {
    library: Arc<Library>,
    _path: TempPath,
}

/// A resolved kernel entry point. Holds its library so the address stays valid.
#[derive(Clone)]
pub struct NativeFunction {
    _lib: Arc<Library>,
    entry: KernelFn,
}

impl NativeFunction {
    /// # Safety
    /// `bufs` must point at one valid allocation per kernel buffer argument, each at least
    /// as large as the kernel indexes, and `vars` at one `i32` per kernel variable.
    pub unsafe fn call(&self, bufs: &mut [*mut c_void], vars: &[i32]) -> i32 {
        (self.entry)(bufs.as_mut_ptr(), vars.as_ptr())
    }
}

impl NativeEngine {
    pub fn new(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("lazyrt-native-")
            .tempdir()?;
        let mut flags: Vec<String> = platform_flags().iter().map(|flag| flag.to_string()).collect();
        flags.extend(BASE_FLAGS.iter().map(|flag| flag.to_string()));
        if config.native_opt && !cfg!(target_os = "windows") {
            flags.extend(VECTORIZE_FLAGS.iter().map(|flag| flag.to_string()));
        }
        tracing::info!(compiler = %config.native_compiler, ?flags, "native engine initialized");
        Ok(Self {
            compiler: config.native_compiler.clone(),
            flags,
            scratch,
            loaded: Mutex::new(Vec::new()),
        })
    }

    /// The shared engine, built from `config` on first use and kept for the process lifetime.
    /// Later callers get the first engine regardless of the config they pass.
    pub fn global(config: &RuntimeConfig) -> RuntimeResult<Arc<NativeEngine>> {
        GLOBAL_ENGINE
            .get_or_try_init(|| NativeEngine::new(config).map(Arc::new))
            .cloned()
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    /// Compiles `source` to shared object bytes.
    pub fn compile(&self, source: &str) -> RuntimeResult<Vec<u8>> {
        let workdir = tempfile::Builder::new()
            .prefix("compile-")
            .tempdir_in(self.scratch.path())?;
        let src = workdir.path().join("kernel.c");
        let out = workdir.path().join(format!("kernel{}", lib_ext()));
        std::fs::write(&src, source)?;
        self.run_compiler(&src, &out, source)?;
        Ok(std::fs::read(&out)?)
    }

    fn run_compiler(&self, src: &Path, out: &Path, source: &str) -> RuntimeResult<()> {
        let mut cmd = Command::new(&self.compiler);
        cmd.args(&self.flags).arg("-o").arg(out).arg(src);
        if !cfg!(target_os = "windows") {
            cmd.arg("-lm");
        }

        let output = cmd.output().map_err(|err| {
            RuntimeError::unavailable("CLANG", format!("failed to run {}: {err}", self.compiler))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::compile(
                self.compiler.clone(),
                stderr.trim().to_string(),
                source,
            ));
        }
        Ok(())
    }

    /// Loads an object produced by [`NativeEngine::compile`] and resolves `symbol` in it.
    pub fn load(&self, artifact: &[u8], symbol: &str) -> RuntimeResult<NativeFunction> {
        let mut file = tempfile::Builder::new()
            .prefix("lazyrt_kernel_")
            .suffix(lib_ext())
            .tempfile_in(self.scratch.path())?;
        file.write_all(artifact)?;
        file.flush()?;
        let path = file.into_temp_path();

        // SAFETY: the object was produced by our own compile step from kernel source; it has
        // no initializers beyond what the C runtime provides.
        let library = unsafe { Library::new(&path) }.map_err(|err| {
            RuntimeError::execution(format!("failed to load native kernel {symbol}: {err}"))
        })?;
        // SAFETY: kernels are rendered with the `KernelFn` signature.
        let entry = unsafe { library.get::<KernelFn>(symbol.as_bytes()).map(|sym| *sym) }
            .map_err(|err| {
                RuntimeError::execution(format!("symbol {symbol} not found in native kernel: {err}"))
            })?;

        let library = Arc::new(library);
        self.loaded
            .lock()
            .expect("native engine mutex poisoned")
            .push(LoadedObject {
                library: Arc::clone(&library),
                _path: path,
            });
        tracing::debug!(symbol, "native kernel loaded");
        Ok(NativeFunction {
            _lib: library,
            entry,
        })
    }

    pub fn loaded_objects(&self) -> usize {
        self.loaded
            .lock()
            .expect("native engine mutex poisoned")
            .len()
    }
}

fn platform_flags() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["-dynamiclib"]
    } else {
        &["-shared", "-fPIC"]
    }
}

fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectorize_flags_follow_config() {
        let plain = NativeEngine::new(&RuntimeConfig::default()).expect("engine");
        assert!(plain.flags().iter().any(|flag| flag == "-O3"));
        assert!(!plain.flags().iter().any(|flag| flag == "-funroll-loops"));

        let config = RuntimeConfig {
            native_opt: true,
            ..RuntimeConfig::default()
        };
        let tuned = NativeEngine::new(&config).expect("engine");
        if !cfg!(target_os = "windows") {
            assert!(tuned.flags().iter().any(|flag| flag == "-funroll-loops"));
        }
    }

    #[test]
    fn missing_compiler_is_unavailable() {
        let config = RuntimeConfig {
            native_compiler: "lazyrt-no-such-cc".to_string(),
            ..RuntimeConfig::default()
        };
        let engine = NativeEngine::new(&config).expect("engine");
        let err = engine.compile("int x;").expect_err("compile should fail");
        assert!(matches!(err, RuntimeError::Unavailable { .. }), "{err:?}");
    }
}
