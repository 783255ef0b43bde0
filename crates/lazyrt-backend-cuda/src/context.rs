//! Per-device context: a compute stream, a copy stream and the in-flight ledger.
//!
//! Kernels and host uploads are queued on the compute stream, so submission order is
//! execution order. Device-to-device copies go on the copy stream, fenced against the
//! compute stream in both directions. Every asynchronous submission leaves an event in the
//! ledger; [`CudaContext::synchronize`] waits on all of them and then drops the host bytes
//! that were kept alive for pending uploads.

use std::ffi::{c_void, CStr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazyrt::RuntimeResult;

use crate::driver::{
    check_cuda, cuda_error, CUcontext, CUdevice, CUdeviceptr, CUevent, CUfunction, CUmodule,
    CUstream, CudaDriver, CUDA_ERROR_OUT_OF_MEMORY, CUDA_SUCCESS,
    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
    CU_EVENT_DEFAULT, CU_EVENT_DISABLE_TIMING, CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
    CU_STREAM_NON_BLOCKING,
};

#[derive(Default)]
struct InFlight {
    events: Vec<usize>,
    host_copies: Vec<Arc<[u8]>>,
}

pub struct CudaContext {
    driver: Arc<CudaDriver>,
    device: CUdevice,
    ordinal: usize,
    // Stored as usize so the context satisfies Send/Sync for the backend traits.
    ctx: usize,
    compute: usize,
    copy: usize,
    in_flight: Mutex<InFlight>,
}

/// Result of a raw device allocation.
pub(crate) enum DeviceAlloc {
    Ptr(CUdeviceptr),
    OutOfMemory,
}

impl CudaContext {
    pub fn new(driver: Arc<CudaDriver>, ordinal: usize) -> RuntimeResult<Self> {
        let device = driver.device(ordinal)?;
        let fns = &driver.fns;
        let mut ctx: CUcontext = std::ptr::null_mut();
        let mut compute: CUstream = std::ptr::null_mut();
        let mut copy: CUstream = std::ptr::null_mut();
        // SAFETY: out pointers are valid; the context is made current before creating streams.
        unsafe {
            check_cuda(
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, device),
                "cuCtxCreate_v2",
            )?;
            check_cuda((fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            check_cuda(
                (fns.cu_stream_create)(&mut compute as *mut CUstream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
            check_cuda(
                (fns.cu_stream_create)(&mut copy as *mut CUstream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        tracing::info!(ordinal, "CUDA context created");
        Ok(Self {
            driver,
            device,
            ordinal,
            ctx: ctx as usize,
            compute: compute as usize,
            copy: copy as usize,
            in_flight: Mutex::new(InFlight::default()),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn attribute(&self, attrib: i32) -> RuntimeResult<i32> {
        self.driver.attribute(self.device, attrib)
    }

    /// `sm_XY` for the device's compute capability.
    pub fn arch(&self) -> RuntimeResult<String> {
        let major = self.attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = self.attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        Ok(format!("sm_{major}{minor}"))
    }

    pub fn ensure_current(&self) -> RuntimeResult<()> {
        // SAFETY: Context was created by this instance and remains valid until drop.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_ctx_set_current)(self.ctx as CUcontext),
                "cuCtxSetCurrent",
            )
        }
    }

    pub(crate) fn alloc(&self, bytes: usize) -> RuntimeResult<DeviceAlloc> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        let code = unsafe { (self.driver.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes) };
        match code {
            CUDA_SUCCESS => Ok(DeviceAlloc::Ptr(ptr)),
            CUDA_ERROR_OUT_OF_MEMORY => Ok(DeviceAlloc::OutOfMemory),
            other => Err(cuda_error(other, "cuMemAlloc_v2")),
        }
    }

    pub(crate) fn free(&self, ptr: CUdeviceptr) {
        if self.has_pending_work() {
            if let Err(err) = self.synchronize() {
                tracing::warn!(error = %err, "synchronize before free failed");
            }
        }
        if self.ensure_current().is_err() {
            return;
        }
        // SAFETY: Device pointer was allocated in this context and is released once.
        let code = unsafe { (self.driver.fns.cu_mem_free_v2)(ptr) };
        if code != CUDA_SUCCESS {
            tracing::warn!(code, "cuMemFree_v2 failed");
        }
    }

    /// Blocking upload. Waits for queued work first so it cannot overtake it.
    pub(crate) fn upload_sync(&self, dst: CUdeviceptr, src: &[u8]) -> RuntimeResult<()> {
        self.synchronize()?;
        // SAFETY: `dst` is a live allocation of at least `src.len()` bytes.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_memcpy_hto_d_v2)(dst, src.as_ptr().cast::<c_void>(), src.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    /// Queued upload on the compute stream. `src` is retained until the next synchronize.
    pub(crate) fn upload_async(&self, dst: CUdeviceptr, src: Arc<[u8]>) -> RuntimeResult<()> {
        self.ensure_current()?;
        // SAFETY: `dst` is a live allocation of at least `src.len()` bytes and `src` stays
        // alive in the ledger until the copy's event has completed.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_memcpy_hto_d_async_v2)(
                    dst,
                    src.as_ptr().cast::<c_void>(),
                    src.len(),
                    self.compute_stream(),
                ),
                "cuMemcpyHtoDAsync_v2",
            )?;
        }
        let event = self.record(self.compute_stream(), CU_EVENT_DISABLE_TIMING)?;
        let mut in_flight = self.in_flight.lock().expect("in-flight mutex poisoned");
        in_flight.events.push(event as usize);
        in_flight.host_copies.push(src);
        Ok(())
    }

    /// Drains the device, then reads `dst.len()` bytes from `src`.
    pub(crate) fn download(&self, dst: &mut [u8], src: CUdeviceptr) -> RuntimeResult<()> {
        self.synchronize()?;
        // SAFETY: `src` is a live allocation of at least `dst.len()` bytes; `dst` is writable.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_memcpy_dto_h_v2)(dst.as_mut_ptr().cast::<c_void>(), src, dst.len()),
                "cuMemcpyDtoH_v2",
            )
        }
    }

    /// Device-to-device copy on the copy stream, ordered after queued kernels and before
    /// any kernel queued later.
    pub(crate) fn copy_async(
        &self,
        dst: CUdeviceptr,
        src: CUdeviceptr,
        bytes: usize,
    ) -> RuntimeResult<()> {
        self.ensure_current()?;
        let fns = &self.driver.fns;
        let compute_done = self.record(self.compute_stream(), CU_EVENT_DISABLE_TIMING)?;
        // SAFETY: streams and events belong to this context; pointers are live allocations
        // of at least `bytes` bytes.
        unsafe {
            check_cuda(
                (fns.cu_stream_wait_event)(self.copy_stream(), compute_done, 0),
                "cuStreamWaitEvent",
            )?;
            check_cuda(
                (fns.cu_memcpy_dto_d_async_v2)(dst, src, bytes, self.copy_stream()),
                "cuMemcpyDtoDAsync_v2",
            )?;
        }
        let copy_done = self.record(self.copy_stream(), CU_EVENT_DISABLE_TIMING)?;
        // SAFETY: both handles are valid events of this context.
        unsafe {
            check_cuda(
                (fns.cu_stream_wait_event)(self.compute_stream(), copy_done, 0),
                "cuStreamWaitEvent",
            )?;
        }
        let mut in_flight = self.in_flight.lock().expect("in-flight mutex poisoned");
        in_flight.events.push(compute_done as usize);
        in_flight.events.push(copy_done as usize);
        Ok(())
    }

    pub(crate) fn load_module(&self, image: &[u8]) -> RuntimeResult<CudaModule> {
        self.ensure_current()?;
        let image = nul_terminated(image);
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: `image` is a NUL-terminated PTX or cubin image valid for the call.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_module_load_data)(
                    &mut module as *mut CUmodule,
                    image.as_ptr().cast::<c_void>(),
                ),
                "cuModuleLoadData",
            )?;
        }
        Ok(CudaModule {
            driver: Arc::clone(&self.driver),
            module: module as usize,
        })
    }

    pub(crate) fn function(&self, module: &CudaModule, symbol: &CStr) -> RuntimeResult<usize> {
        self.ensure_current()?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module and output pointers are valid.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module.module as CUmodule,
                    symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(function as usize)
    }

    pub(crate) fn max_threads_per_block(&self, function: usize) -> RuntimeResult<usize> {
        let mut value = 0i32;
        // SAFETY: `function` was resolved from a module loaded in this context.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_func_get_attribute)(
                    &mut value as *mut i32,
                    CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
                    function as CUfunction,
                ),
                "cuFuncGetAttribute",
            )?;
        }
        Ok(usize::try_from(value).unwrap_or(0))
    }

    /// Queues a kernel on the compute stream. With `wait` set, blocks until it finishes and
    /// returns the device-measured time; otherwise the completion event joins the ledger.
    pub(crate) fn launch(
        &self,
        function: usize,
        grid: [u32; 3],
        block: [u32; 3],
        params: &mut [*mut c_void],
        wait: bool,
    ) -> RuntimeResult<Option<Duration>> {
        self.ensure_current()?;
        let start = if wait {
            Some(self.record(self.compute_stream(), CU_EVENT_DEFAULT)?)
        } else {
            None
        };
        // SAFETY: `function` belongs to this context; each param points at a live argument
        // value for the duration of the call, which copies them.
        let launched = unsafe {
            check_cuda(
                (self.driver.fns.cu_launch_kernel)(
                    function as CUfunction,
                    grid[0],
                    grid[1],
                    grid[2],
                    block[0],
                    block[1],
                    block[2],
                    0,
                    self.compute_stream(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        };
        if let Err(err) = launched {
            if let Some(start) = start {
                self.destroy_event(start);
            }
            return Err(err);
        }

        match start {
            None => {
                let done = self.record(self.compute_stream(), CU_EVENT_DISABLE_TIMING)?;
                self.in_flight
                    .lock()
                    .expect("in-flight mutex poisoned")
                    .events
                    .push(done as usize);
                Ok(None)
            }
            Some(start) => {
                let end = self.record(self.compute_stream(), CU_EVENT_DEFAULT)?;
                let elapsed = self.elapsed(start, end);
                self.destroy_event(start);
                self.destroy_event(end);
                elapsed.map(Some)
            }
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .events
            .is_empty()
    }

    /// Waits for every in-flight submission, then releases retained host copies.
    pub fn synchronize(&self) -> RuntimeResult<()> {
        let pending = std::mem::take(&mut *self.in_flight.lock().expect("in-flight mutex poisoned"));
        if pending.events.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        let mut first_error = None;
        for event in &pending.events {
            // SAFETY: every ledger entry is an event recorded in this context.
            let code = unsafe { (self.driver.fns.cu_event_synchronize)(*event as CUevent) };
            if code != CUDA_SUCCESS && first_error.is_none() {
                first_error = Some(cuda_error(code, "cuEventSynchronize"));
            }
            self.destroy_event(*event as CUevent);
        }
        tracing::trace!(
            events = pending.events.len(),
            host_copies = pending.host_copies.len(),
            "CUDA device synchronized"
        );
        drop(pending.host_copies);
        first_error.map_or(Ok(()), Err)
    }

    fn record(&self, stream: CUstream, flags: u32) -> RuntimeResult<CUevent> {
        let fns = &self.driver.fns;
        let mut event: CUevent = std::ptr::null_mut();
        // SAFETY: `event` is a valid out pointer and `stream` belongs to this context.
        unsafe {
            check_cuda(
                (fns.cu_event_create)(&mut event as *mut CUevent, flags),
                "cuEventCreate",
            )?;
            if let Err(err) = check_cuda((fns.cu_event_record)(event, stream), "cuEventRecord") {
                (fns.cu_event_destroy_v2)(event);
                return Err(err);
            }
        }
        Ok(event)
    }

    fn elapsed(&self, start: CUevent, end: CUevent) -> RuntimeResult<Duration> {
        let fns = &self.driver.fns;
        let mut ms = 0f32;
        // SAFETY: both events were recorded with timing enabled on the compute stream.
        unsafe {
            check_cuda((fns.cu_event_synchronize)(end), "cuEventSynchronize")?;
            check_cuda(
                (fns.cu_event_elapsed_time)(&mut ms as *mut f32, start, end),
                "cuEventElapsedTime",
            )?;
        }
        Ok(Duration::from_secs_f64(f64::from(ms.max(0.0)) / 1e3))
    }

    fn destroy_event(&self, event: CUevent) {
        // SAFETY: the event was created by `record` and is destroyed once.
        let _ = unsafe { (self.driver.fns.cu_event_destroy_v2)(event) };
    }

    fn compute_stream(&self) -> CUstream {
        self.compute as CUstream
    }

    fn copy_stream(&self) -> CUstream {
        self.copy as CUstream
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        if let Err(err) = self.synchronize() {
            tracing::warn!(error = %err, "CUDA synchronize on drop failed");
        }
        let fns = &self.driver.fns;
        // SAFETY: streams and context are owned by this instance and destroyed once.
        unsafe {
            let _ = (fns.cu_stream_destroy_v2)(self.copy_stream());
            let _ = (fns.cu_stream_destroy_v2)(self.compute_stream());
            let _ = (fns.cu_ctx_destroy_v2)(self.ctx as CUcontext);
        }
    }
}

pub(crate) struct CudaModule {
    driver: Arc<CudaDriver>,
    module: usize,
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if self.module != 0 {
            // SAFETY: Module belongs to this driver and is unloaded once.
            let _ = unsafe { (self.driver.fns.cu_module_unload)(self.module as CUmodule) };
            self.module = 0;
        }
    }
}

/// PTX is text; the driver expects a NUL-terminated image.
pub(crate) fn nul_terminated(image: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    if image.last() == Some(&0) {
        std::borrow::Cow::Borrowed(image)
    } else {
        let mut owned = Vec::with_capacity(image.len() + 1);
        owned.extend_from_slice(image);
        owned.push(0);
        std::borrow::Cow::Owned(owned)
    }
}
