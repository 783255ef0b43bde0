use std::fmt;
use std::sync::Arc;

use lazyrt::device::{downcast_raw, AllocFailure, RawAllocator, RawBuffer};
use lazyrt::{RuntimeError, RuntimeResult};

use crate::context::{CudaContext, DeviceAlloc};

/// Device memory owned by a [`CudaContext`]. Released through the allocator, never on drop.
pub struct CudaAllocation {
    ptr: u64,
    bytes: usize,
}

impl CudaAllocation {
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl fmt::Debug for CudaAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaAllocation")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("bytes", &self.bytes)
            .finish()
    }
}

pub struct CudaRawAllocator {
    context: Arc<CudaContext>,
    slow_copy: bool,
}

impl CudaRawAllocator {
    pub fn new(context: Arc<CudaContext>, slow_copy: bool) -> Self {
        Self { context, slow_copy }
    }

    fn allocation<'a>(&self, raw: &'a RawBuffer) -> RuntimeResult<&'a CudaAllocation> {
        downcast_raw::<CudaAllocation>(raw, "CUDA")
    }
}

impl RawAllocator for CudaRawAllocator {
    fn raw_alloc(&self, nbytes: usize) -> Result<RawBuffer, AllocFailure> {
        match self.context.alloc(nbytes) {
            Ok(DeviceAlloc::Ptr(ptr)) => Ok(Box::new(CudaAllocation { ptr, bytes: nbytes })),
            Ok(DeviceAlloc::OutOfMemory) => Err(AllocFailure::OutOfMemory),
            Err(err) => Err(AllocFailure::Backend(err)),
        }
    }

    fn raw_free(&self, raw: RawBuffer, _nbytes: usize) {
        match raw.downcast::<CudaAllocation>() {
            Ok(allocation) => self.context.free(allocation.ptr),
            Err(_) => tracing::warn!("CUDA allocator asked to free a foreign handle"),
        }
    }

    fn copyin(&self, dest: &RawBuffer, src: &[u8]) -> RuntimeResult<()> {
        if self.slow_copy {
            let dest = self.allocation(dest)?;
            check_len(dest, src.len())?;
            self.context.upload_sync(dest.ptr, src)
        } else {
            self.copyin_shared(dest, Arc::from(src))
        }
    }

    fn copyin_shared(&self, dest: &RawBuffer, src: Arc<[u8]>) -> RuntimeResult<()> {
        let dest = self.allocation(dest)?;
        check_len(dest, src.len())?;
        if self.slow_copy {
            self.context.upload_sync(dest.ptr, &src)
        } else {
            self.context.upload_async(dest.ptr, src)
        }
    }

    fn copyout(&self, dest: &mut [u8], src: &RawBuffer) -> RuntimeResult<()> {
        let src = self.allocation(src)?;
        check_len(src, dest.len())?;
        self.context.download(dest, src.ptr)
    }

    fn copy_device(&self, dest: &RawBuffer, src: &RawBuffer, nbytes: usize) -> RuntimeResult<bool> {
        let dest = self.allocation(dest)?;
        let src = self.allocation(src)?;
        if src.bytes != dest.bytes || nbytes > src.bytes {
            return Err(RuntimeError::SizeMismatch {
                context: "device copy",
                expected: dest.bytes,
                actual: src.bytes,
            });
        }
        self.context.copy_async(dest.ptr, src.ptr, nbytes)?;
        Ok(true)
    }
}

fn check_len(allocation: &CudaAllocation, len: usize) -> RuntimeResult<()> {
    if allocation.bytes == len {
        Ok(())
    } else {
        Err(RuntimeError::SizeMismatch {
            context: "CUDA host copy",
            expected: allocation.bytes,
            actual: len,
        })
    }
}
