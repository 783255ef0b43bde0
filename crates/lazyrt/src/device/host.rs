//! Aligned host memory shared by CPU-side backends.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use super::allocator::{downcast_raw, AllocFailure, RawAllocator, RawBuffer};
use crate::error::{RuntimeError, RuntimeResult};

pub const HOST_ALIGNMENT: usize = 64;

/// Zero-initialized, 64-byte aligned host block.
///
/// Kernels write through [`HostAllocation::as_mut_ptr`] while the owning `Buffer` is
/// shared, so the block is accessed through raw pointers rather than `&mut` slices.
pub struct HostAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The allocation is uniquely owned by this value; concurrent access is serialized
// by the executor, which runs one kernel at a time per host device.
unsafe impl Send for HostAllocation {}
// SAFETY: See `Send`; shared references only expose raw pointers and bounded copies.
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    pub fn new(nbytes: usize) -> Result<Self, AllocFailure> {
        let layout = Layout::from_size_align(nbytes.max(1), HOST_ALIGNMENT).map_err(|err| {
            AllocFailure::Backend(RuntimeError::execution(format!(
                "invalid host layout for {nbytes} bytes: {err}"
            )))
        })?;
        // SAFETY: `layout` has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocFailure::OutOfMemory)?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> RuntimeResult<()> {
        check_range(offset, bytes.len(), self.len())?;
        // SAFETY: The range was checked against the allocation size and `bytes` cannot
        // overlap a block owned by this allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_mut_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> RuntimeResult<()> {
        check_range(offset, out.len(), self.len())?;
        // SAFETY: The range was checked against the allocation size.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // SAFETY: The block is initialized (zeroed at allocation) and `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }.to_vec()
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with `layout` and is released exactly once.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

fn check_range(offset: usize, len: usize, capacity: usize) -> RuntimeResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(RuntimeError::SizeMismatch {
            context: "host copy",
            expected: capacity.saturating_sub(offset),
            actual: len,
        }),
    }
}

/// Raw allocator handing out [`HostAllocation`] blocks.
#[derive(Debug, Clone)]
pub struct HostAllocator {
    backend: Arc<str>,
    capacity_limit: Option<usize>,
}

impl HostAllocator {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: Arc::from(backend),
            capacity_limit: None,
        }
    }

    /// Rejects single requests above `limit` bytes with out-of-memory.
    pub fn with_request_limit(mut self, limit: usize) -> Self {
        self.capacity_limit = Some(limit);
        self
    }

    pub fn block<'a>(&self, raw: &'a RawBuffer) -> RuntimeResult<&'a HostAllocation> {
        downcast_raw::<HostAllocation>(raw, &self.backend)
    }
}

impl RawAllocator for HostAllocator {
    fn raw_alloc(&self, nbytes: usize) -> Result<RawBuffer, AllocFailure> {
        if self.capacity_limit.is_some_and(|limit| nbytes > limit) {
            return Err(AllocFailure::OutOfMemory);
        }
        Ok(Box::new(HostAllocation::new(nbytes)?))
    }

    fn raw_free(&self, raw: RawBuffer, _nbytes: usize) {
        drop(raw);
    }

    fn copyin(&self, dest: &RawBuffer, src: &[u8]) -> RuntimeResult<()> {
        self.block(dest)?.write(0, src)
    }

    fn copyout(&self, dest: &mut [u8], src: &RawBuffer) -> RuntimeResult<()> {
        self.block(src)?.read(0, dest)
    }

    fn copy_device(&self, dest: &RawBuffer, src: &RawBuffer, nbytes: usize) -> RuntimeResult<bool> {
        let src = self.block(src)?;
        let dest = self.block(dest)?;
        check_range(0, nbytes, src.len())?;
        check_range(0, nbytes, dest.len())?;
        // SAFETY: Both ranges were checked; `copy` tolerates the same block on both sides.
        unsafe { std::ptr::copy(src.as_ptr(), dest.as_mut_ptr(), nbytes) };
        Ok(true)
    }
}
