use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::allocator::{Allocator, RawBuffer};
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::DType;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Device memory block of `size` elements of `dtype`.
///
/// Zero-element buffers hold no backend handle. Dropping the buffer hands the handle
/// back to the allocator that produced it (which may pool it).
pub struct Buffer {
    id: u64,
    device: String,
    size: usize,
    dtype: DType,
    allocator: Arc<dyn Allocator>,
    raw: Option<RawBuffer>,
}

impl Buffer {
    pub fn new(allocator: Arc<dyn Allocator>, size: usize, dtype: DType) -> RuntimeResult<Self> {
        if dtype.nbytes(size).is_none() {
            return Err(RuntimeError::OutOfMemory {
                device: allocator.device().to_string(),
                size,
                dtype,
            });
        }
        let raw = if size == 0 {
            None
        } else {
            Some(allocator.alloc(size, dtype)?)
        };
        Ok(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            device: allocator.device().to_string(),
            size,
            dtype,
            allocator,
            raw,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Element count.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Byte length; checked against overflow when the buffer was created.
    pub fn nbytes(&self) -> usize {
        self.size * self.dtype.itemsize()
    }

    pub fn raw(&self) -> Option<&RawBuffer> {
        self.raw.as_ref()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    fn check_len(&self, context: &'static str, actual: usize) -> RuntimeResult<()> {
        if actual != self.nbytes() {
            return Err(RuntimeError::SizeMismatch {
                context,
                expected: self.nbytes(),
                actual,
            });
        }
        Ok(())
    }

    pub fn copyin(&self, src: &[u8]) -> RuntimeResult<()> {
        self.check_len("copyin", src.len())?;
        match &self.raw {
            Some(raw) => self.allocator.raw().copyin(raw, src),
            None => Ok(()),
        }
    }

    /// Copy-in whose host bytes the backend may retain until its next synchronize.
    pub fn copyin_shared(&self, src: Arc<[u8]>) -> RuntimeResult<()> {
        self.check_len("copyin", src.len())?;
        match &self.raw {
            Some(raw) => self.allocator.raw().copyin_shared(raw, src),
            None => Ok(()),
        }
    }

    pub fn copyout(&self, dest: &mut [u8]) -> RuntimeResult<()> {
        self.check_len("copyout", dest.len())?;
        match &self.raw {
            Some(raw) => self.allocator.raw().copyout(dest, raw),
            None => Ok(()),
        }
    }

    pub fn to_host(&self) -> RuntimeResult<Vec<u8>> {
        let mut out = vec![0u8; self.nbytes()];
        self.copyout(&mut out)?;
        Ok(out)
    }

    /// Copies `src` into this buffer: directly when both live on the same allocator and
    /// the backend supports it, through host memory otherwise.
    pub fn transfer_from(&self, src: &Buffer) -> RuntimeResult<()> {
        if src.size != self.size {
            return Err(RuntimeError::SizeMismatch {
                context: "cross-device copy",
                expected: self.size,
                actual: src.size,
            });
        }
        if src.nbytes() != self.nbytes() {
            return Err(RuntimeError::SizeMismatch {
                context: "cross-device copy bytes",
                expected: self.nbytes(),
                actual: src.nbytes(),
            });
        }
        let (Some(dest_raw), Some(src_raw)) = (&self.raw, &src.raw) else {
            return Ok(());
        };
        if Arc::ptr_eq(&self.allocator, &src.allocator)
            && self
                .allocator
                .raw()
                .copy_device(dest_raw, src_raw, self.nbytes())?
        {
            return Ok(());
        }
        let staged: Arc<[u8]> = Arc::from(src.to_host()?);
        self.copyin_shared(staged)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.allocator.free(raw, self.size, self.dtype);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("size", &self.size)
            .field("dtype", &self.dtype)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::allocator::DirectAllocator;
    use crate::device::host::HostAllocator;

    fn host() -> Arc<dyn Allocator> {
        Arc::new(DirectAllocator::new("CPU", Arc::new(HostAllocator::new("CPU"))))
    }

    #[test]
    fn copy_roundtrip_through_host_memory() {
        let buffer = Buffer::new(host(), 4, DType::U8).expect("alloc");
        buffer.copyin(&[1, 2, 3, 4]).expect("copyin");
        assert_eq!(buffer.to_host().expect("to_host"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn copyin_rejects_wrong_length() {
        let buffer = Buffer::new(host(), 4, DType::F32).expect("alloc");
        let err = buffer.copyin(&[0u8; 3]).expect_err("length mismatch");
        assert!(matches!(err, RuntimeError::SizeMismatch { expected: 16, actual: 3, .. }));
    }

    #[test]
    fn zero_size_buffer_has_no_handle() {
        let buffer = Buffer::new(host(), 0, DType::F32).expect("alloc");
        assert!(buffer.raw().is_none());
        assert!(buffer.to_host().expect("to_host").is_empty());
    }

    #[test]
    fn transfer_between_allocators_stages_through_host() {
        let src = Buffer::new(host(), 2, DType::U8).expect("alloc");
        src.copyin(&[5, 6]).expect("copyin");
        let dest = Buffer::new(host(), 2, DType::U8).expect("alloc");
        dest.transfer_from(&src).expect("transfer");
        assert_eq!(dest.to_host().expect("to_host"), vec![5, 6]);

        let short = Buffer::new(host(), 1, DType::U8).expect("alloc");
        assert!(short.transfer_from(&src).is_err());
    }
}
