//! CUDA C to PTX, either in-process through NVRTC or with the offline `nvcc` toolchain.

use std::ffi::{c_char, CString};
use std::process::Command;
use std::sync::{Arc, OnceLock};

use libloading::Library;

use lazyrt::{RuntimeError, RuntimeResult};

use crate::driver::load_symbol;

type NvrtcResult = i32;
type NvrtcProgram = *mut std::ffi::c_void;

const NVRTC_SUCCESS: NvrtcResult = 0;

type NvrtcCreateProgramFn = unsafe extern "C" fn(
    prog: *mut NvrtcProgram,
    src: *const c_char,
    name: *const c_char,
    num_headers: i32,
    headers: *const *const c_char,
    include_names: *const *const c_char,
) -> NvrtcResult;
type NvrtcCompileProgramFn =
    unsafe extern "C" fn(prog: NvrtcProgram, num_options: i32, options: *const *const c_char) -> NvrtcResult;
type NvrtcGetSizeFn = unsafe extern "C" fn(prog: NvrtcProgram, size: *mut usize) -> NvrtcResult;
type NvrtcGetBytesFn = unsafe extern "C" fn(prog: NvrtcProgram, out: *mut c_char) -> NvrtcResult;
type NvrtcDestroyProgramFn = unsafe extern "C" fn(prog: *mut NvrtcProgram) -> NvrtcResult;

struct NvrtcFns {
    create_program: NvrtcCreateProgramFn,
    compile_program: NvrtcCompileProgramFn,
    get_program_log_size: NvrtcGetSizeFn,
    get_program_log: NvrtcGetBytesFn,
    get_ptx_size: NvrtcGetSizeFn,
    get_ptx: NvrtcGetBytesFn,
    destroy_program: NvrtcDestroyProgramFn,
}

struct Nvrtc {
    _lib: Library,
    fns: NvrtcFns,
}

static NVRTC: OnceLock<Result<Arc<Nvrtc>, String>> = OnceLock::new();

fn nvrtc() -> RuntimeResult<Arc<Nvrtc>> {
    let init = NVRTC.get_or_init(|| match Nvrtc::new() {
        Ok(nvrtc) => Ok(Arc::new(nvrtc)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(nvrtc) => Ok(Arc::clone(nvrtc)),
        Err(msg) => Err(RuntimeError::unavailable("CUDA", msg.clone())),
    }
}

impl Nvrtc {
    fn new() -> RuntimeResult<Self> {
        let lib = load_nvrtc_library()?;
        let fns = NvrtcFns {
            create_program: load_symbol(&lib, b"nvrtcCreateProgram\0")?,
            compile_program: load_symbol(&lib, b"nvrtcCompileProgram\0")?,
            get_program_log_size: load_symbol(&lib, b"nvrtcGetProgramLogSize\0")?,
            get_program_log: load_symbol(&lib, b"nvrtcGetProgramLog\0")?,
            get_ptx_size: load_symbol(&lib, b"nvrtcGetPTXSize\0")?,
            get_ptx: load_symbol(&lib, b"nvrtcGetPTX\0")?,
            destroy_program: load_symbol(&lib, b"nvrtcDestroyProgram\0")?,
        };
        Ok(Self { _lib: lib, fns })
    }

    fn compile(&self, source: &str, arch: &str) -> RuntimeResult<Vec<u8>> {
        let c_source = CString::new(source)
            .map_err(|_| RuntimeError::compile("nvrtc", "kernel source contains NUL byte", source))?;
        let name = b"kernel.cu\0";
        let options = [CString::new(format!("--gpu-architecture={}", virtual_arch(arch)))
            .map_err(|_| RuntimeError::execution("arch contains NUL byte"))?];
        let option_ptrs: Vec<*const c_char> = options.iter().map(|opt| opt.as_ptr()).collect();

        let mut prog: NvrtcProgram = std::ptr::null_mut();
        // SAFETY: all strings are NUL-terminated and outlive the program; no headers passed.
        unsafe {
            check_nvrtc(
                (self.fns.create_program)(
                    &mut prog as *mut NvrtcProgram,
                    c_source.as_ptr(),
                    name.as_ptr().cast::<c_char>(),
                    0,
                    std::ptr::null(),
                    std::ptr::null(),
                ),
                "nvrtcCreateProgram",
                source,
            )?;
        }

        let result = self.compile_program(prog, &option_ptrs, source);
        // SAFETY: `prog` was created above and is destroyed once.
        unsafe {
            (self.fns.destroy_program)(&mut prog as *mut NvrtcProgram);
        }
        result
    }

    fn compile_program(
        &self,
        prog: NvrtcProgram,
        options: &[*const c_char],
        source: &str,
    ) -> RuntimeResult<Vec<u8>> {
        let count = i32::try_from(options.len()).unwrap_or(i32::MAX);
        // SAFETY: `prog` is a live program and `options` holds valid C strings.
        let code = unsafe { (self.fns.compile_program)(prog, count, options.as_ptr()) };
        if code != NVRTC_SUCCESS {
            let log = self
                .read(prog, self.fns.get_program_log_size, self.fns.get_program_log)
                .map(|bytes| String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string())
                .unwrap_or_default();
            return Err(RuntimeError::compile(
                "nvrtc",
                format!("nvrtcCompileProgram failed with code {code}: {log}"),
                source,
            ));
        }
        let mut ptx = self.read(prog, self.fns.get_ptx_size, self.fns.get_ptx)?;
        if ptx.last() == Some(&0) {
            ptx.pop();
        }
        Ok(ptx)
    }

    fn read(
        &self,
        prog: NvrtcProgram,
        size_fn: NvrtcGetSizeFn,
        bytes_fn: NvrtcGetBytesFn,
    ) -> RuntimeResult<Vec<u8>> {
        let mut size = 0usize;
        // SAFETY: `prog` is live; the output buffer is sized from the reported length.
        unsafe {
            if size_fn(prog, &mut size as *mut usize) != NVRTC_SUCCESS {
                return Err(RuntimeError::execution("NVRTC size query failed"));
            }
            let mut out = vec![0u8; size];
            if size != 0 && bytes_fn(prog, out.as_mut_ptr().cast::<c_char>()) != NVRTC_SUCCESS {
                return Err(RuntimeError::execution("NVRTC output query failed"));
            }
            Ok(out)
        }
    }
}

/// Compiles CUDA C for `arch` (`sm_XY`) to PTX text.
pub fn compile_ptx(source: &str, arch: &str, offline: bool) -> RuntimeResult<Vec<u8>> {
    if offline {
        compile_with_nvcc(source, arch)
    } else {
        nvrtc()?.compile(source, arch)
    }
}

fn compile_with_nvcc(source: &str, arch: &str) -> RuntimeResult<Vec<u8>> {
    let workdir = tempfile::Builder::new().prefix("lazyrt-nvcc-").tempdir()?;
    let src = workdir.path().join("kernel.cu");
    let out = workdir.path().join("kernel.ptx");
    std::fs::write(&src, source)?;

    let output = Command::new("nvcc")
        .arg("--ptx")
        .arg(format!("-arch={}", virtual_arch(arch)))
        .arg("-o")
        .arg(&out)
        .arg(&src)
        .output()
        .map_err(|err| RuntimeError::unavailable("CUDA", format!("failed to run nvcc: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RuntimeError::compile("nvcc", stderr.trim().to_string(), source));
    }
    Ok(std::fs::read(&out)?)
}

/// `sm_86` becomes `compute_86`, the virtual architecture PTX is emitted for.
fn virtual_arch(arch: &str) -> String {
    match arch.strip_prefix("sm_") {
        Some(version) => format!("compute_{version}"),
        None => arch.to_string(),
    }
}

fn check_nvrtc(code: NvrtcResult, op: &str, source: &str) -> RuntimeResult<()> {
    if code == NVRTC_SUCCESS {
        Ok(())
    } else {
        Err(RuntimeError::compile(
            "nvrtc",
            format!("{op} failed with code {code}"),
            source,
        ))
    }
}

fn load_nvrtc_library() -> RuntimeResult<Library> {
    let candidates = [
        "libnvrtc.so",
        "libnvrtc.so.12",
        "libnvrtc.so.11.2",
        "nvrtc64_120_0.dll",
        "libnvrtc.dylib",
    ];

    for candidate in candidates {
        // SAFETY: Opening the library only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(RuntimeError::unavailable(
        "CUDA",
        format!("failed to load NVRTC (tried {})", candidates.join(", ")),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_arch_mapping() {
        assert_eq!(virtual_arch("sm_86"), "compute_86");
        assert_eq!(virtual_arch("compute_70"), "compute_70");
    }
}
