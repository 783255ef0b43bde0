//! CUDA driver API, resolved at runtime from the system driver library.

use std::ffi::{c_char, c_void};
use std::sync::{Arc, OnceLock};

use libloading::Library;

use lazyrt::{RuntimeError, RuntimeResult};

pub(crate) type CUresult = i32;
pub(crate) type CUdevice = i32;
pub(crate) type CUcontext = *mut c_void;
pub(crate) type CUdeviceptr = u64;
pub(crate) type CUmodule = *mut c_void;
pub(crate) type CUfunction = *mut c_void;
pub(crate) type CUstream = *mut c_void;
pub(crate) type CUevent = *mut c_void;

pub(crate) const CUDA_SUCCESS: CUresult = 0;
pub(crate) const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

pub(crate) const CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK: i32 = 1;
pub(crate) const CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X: i32 = 2;
pub(crate) const CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X: i32 = 5;
pub(crate) const CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK: i32 = 8;
pub(crate) const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
pub(crate) const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;
pub(crate) const CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK: i32 = 0;

pub(crate) const CU_STREAM_NON_BLOCKING: u32 = 1;
pub(crate) const CU_EVENT_DEFAULT: u32 = 0;
pub(crate) const CU_EVENT_DISABLE_TIMING: u32 = 2;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attrib: i32, dev: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyHtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuModuleLoadDataFn =
    unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuFuncGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attrib: i32, hfunc: CUfunction) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamWaitEventFn =
    unsafe extern "C" fn(stream: CUstream, event: CUevent, flags: u32) -> CUresult;
type CuEventCreateFn = unsafe extern "C" fn(event: *mut CUevent, flags: u32) -> CUresult;
type CuEventRecordFn = unsafe extern "C" fn(event: CUevent, stream: CUstream) -> CUresult;
type CuEventSynchronizeFn = unsafe extern "C" fn(event: CUevent) -> CUresult;
type CuEventElapsedTimeFn =
    unsafe extern "C" fn(ms: *mut f32, start: CUevent, end: CUevent) -> CUresult;
type CuEventDestroyV2Fn = unsafe extern "C" fn(event: CUevent) -> CUresult;

pub(crate) struct DriverFns {
    pub cu_device_get_count: CuDeviceGetCountFn,
    pub cu_device_get: CuDeviceGetFn,
    pub cu_device_get_attribute: CuDeviceGetAttributeFn,
    pub cu_ctx_create_v2: CuCtxCreateV2Fn,
    pub cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    pub cu_ctx_set_current: CuCtxSetCurrentFn,
    pub cu_mem_alloc_v2: CuMemAllocV2Fn,
    pub cu_mem_free_v2: CuMemFreeV2Fn,
    pub cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    pub cu_memcpy_hto_d_async_v2: CuMemcpyHtoDAsyncV2Fn,
    pub cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    pub cu_memcpy_dto_d_async_v2: CuMemcpyDtoDAsyncV2Fn,
    pub cu_module_load_data: CuModuleLoadDataFn,
    pub cu_module_unload: CuModuleUnloadFn,
    pub cu_module_get_function: CuModuleGetFunctionFn,
    pub cu_func_get_attribute: CuFuncGetAttributeFn,
    pub cu_launch_kernel: CuLaunchKernelFn,
    pub cu_stream_create: CuStreamCreateFn,
    pub cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    pub cu_stream_wait_event: CuStreamWaitEventFn,
    pub cu_event_create: CuEventCreateFn,
    pub cu_event_record: CuEventRecordFn,
    pub cu_event_synchronize: CuEventSynchronizeFn,
    pub cu_event_elapsed_time: CuEventElapsedTimeFn,
    pub cu_event_destroy_v2: CuEventDestroyV2Fn,
}

/// The loaded driver library. Initialized once per process; contexts are per device.
pub struct CudaDriver {
    _lib: Library,
    pub(crate) fns: DriverFns,
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().map(|driver| driver.device_count() > 0).unwrap_or(false)
}

pub fn driver() -> RuntimeResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(RuntimeError::unavailable("CUDA", msg.clone())),
    }
}

impl CudaDriver {
    fn new() -> RuntimeResult<Self> {
        let lib = load_cuda_library()?;
        let cu_init: CuInitFn = load_symbol(&lib, b"cuInit\0")?;
        let fns = DriverFns {
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_hto_d_async_v2: load_symbol(&lib, b"cuMemcpyHtoDAsync_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_dto_d_async_v2: load_symbol(&lib, b"cuMemcpyDtoDAsync_v2\0")?,
            cu_module_load_data: load_symbol(&lib, b"cuModuleLoadData\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_func_get_attribute: load_symbol(&lib, b"cuFuncGetAttribute\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_wait_event: load_symbol(&lib, b"cuStreamWaitEvent\0")?,
            cu_event_create: load_symbol(&lib, b"cuEventCreate\0")?,
            cu_event_record: load_symbol(&lib, b"cuEventRecord\0")?,
            cu_event_synchronize: load_symbol(&lib, b"cuEventSynchronize\0")?,
            cu_event_elapsed_time: load_symbol(&lib, b"cuEventElapsedTime\0")?,
            cu_event_destroy_v2: load_symbol(&lib, b"cuEventDestroy_v2\0")?,
        };

        // SAFETY: cuInit takes no pointers and must precede every other driver call.
        check_cuda(unsafe { cu_init(0) }, "cuInit")?;
        Ok(Self { _lib: lib, fns })
    }

    pub fn device_count(&self) -> usize {
        let mut count = 0i32;
        // SAFETY: `count` is a valid out pointer.
        let code = unsafe { (self.fns.cu_device_get_count)(&mut count as *mut i32) };
        if code == CUDA_SUCCESS {
            usize::try_from(count).unwrap_or(0)
        } else {
            0
        }
    }

    pub(crate) fn device(&self, ordinal: usize) -> RuntimeResult<CUdevice> {
        let ordinal = i32::try_from(ordinal)
            .map_err(|_| RuntimeError::execution(format!("CUDA ordinal {ordinal} out of range")))?;
        let mut dev: CUdevice = 0;
        // SAFETY: `dev` is a valid out pointer.
        check_cuda(
            unsafe { (self.fns.cu_device_get)(&mut dev as *mut CUdevice, ordinal) },
            "cuDeviceGet",
        )?;
        Ok(dev)
    }

    pub(crate) fn attribute(&self, dev: CUdevice, attrib: i32) -> RuntimeResult<i32> {
        let mut value = 0i32;
        // SAFETY: `value` is a valid out pointer and `dev` came from cuDeviceGet.
        check_cuda(
            unsafe { (self.fns.cu_device_get_attribute)(&mut value as *mut i32, attrib, dev) },
            "cuDeviceGetAttribute",
        )?;
        Ok(value)
    }
}

fn load_cuda_library() -> RuntimeResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Opening the library only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(RuntimeError::unavailable(
        "CUDA",
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

pub(crate) fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> RuntimeResult<T> {
    // SAFETY: Caller provides the expected symbol type for the named entry point.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        RuntimeError::unavailable(
            "CUDA",
            format!(
                "failed to resolve symbol {}: {err}",
                String::from_utf8_lossy(&name[..name.len().saturating_sub(1)])
            ),
        )
    })?;
    Ok(*sym)
}

pub(crate) fn check_cuda(code: CUresult, op: &str) -> RuntimeResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(cuda_error(code, op))
    }
}

pub(crate) fn cuda_error(code: CUresult, op: &str) -> RuntimeError {
    RuntimeError::execution(format!("CUDA driver call {op} failed with code {code}"))
}

/// Device ordinal encoded in a canonical device name: `CUDA` is 0, `CUDA:2` is 2.
pub fn ordinal_of(device: &str) -> RuntimeResult<usize> {
    match device.split_once(':') {
        None => Ok(0),
        Some((_, index)) => index
            .parse()
            .map_err(|_| RuntimeError::UnknownDevice(device.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_parsing() {
        assert_eq!(ordinal_of("CUDA").expect("plain"), 0);
        assert_eq!(ordinal_of("CUDA:3").expect("indexed"), 3);
        assert!(matches!(
            ordinal_of("CUDA:x"),
            Err(RuntimeError::UnknownDevice(name)) if name == "CUDA:x"
        ));
    }

    #[test]
    fn non_success_codes_name_the_call() {
        assert!(check_cuda(CUDA_SUCCESS, "cuInit").is_ok());
        let err = check_cuda(700, "cuLaunchKernel").expect_err("failure");
        assert!(err.to_string().contains("cuLaunchKernel"));
        assert!(err.to_string().contains("700"));
    }
}
