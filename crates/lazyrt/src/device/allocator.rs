//! Allocation strategies layered over backend memory primitives.

use std::any::Any;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::DType;

/// Type-erased backend memory handle, downcast by the backend that produced it.
pub type RawBuffer = Box<dyn Any + Send + Sync>;

/// Why a raw allocation did not produce a handle.
#[derive(Debug)]
pub enum AllocFailure {
    OutOfMemory,
    Backend(RuntimeError),
}

/// Memory primitives a backend provides. Sizes are in bytes and never zero.
pub trait RawAllocator: Send + Sync {
    fn raw_alloc(&self, nbytes: usize) -> Result<RawBuffer, AllocFailure>;

    fn raw_free(&self, raw: RawBuffer, nbytes: usize);

    fn copyin(&self, dest: &RawBuffer, src: &[u8]) -> RuntimeResult<()>;

    /// Copy-in that may keep `src` alive past the call (e.g. until the next
    /// device synchronize). Defaults to a synchronous copy.
    fn copyin_shared(&self, dest: &RawBuffer, src: Arc<[u8]>) -> RuntimeResult<()> {
        self.copyin(dest, &src)
    }

    fn copyout(&self, dest: &mut [u8], src: &RawBuffer) -> RuntimeResult<()>;

    /// Same-device copy. Returns `Ok(false)` when the backend has no direct path
    /// and the caller should stage through host memory.
    fn copy_device(&self, dest: &RawBuffer, src: &RawBuffer, nbytes: usize) -> RuntimeResult<bool> {
        let _ = (dest, src, nbytes);
        Ok(false)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub held_buffers: usize,
    pub held_bytes: usize,
}

/// Buffer acquisition strategy bound to one device.
pub trait Allocator: Send + Sync {
    fn device(&self) -> &str;

    fn raw(&self) -> &dyn RawAllocator;

    fn alloc(&self, size: usize, dtype: DType) -> RuntimeResult<RawBuffer>;

    fn free(&self, raw: RawBuffer, size: usize, dtype: DType);

    /// Releases every pooled handle back to the backend.
    fn free_cache(&self) {}

    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }
}

fn out_of_memory(device: &str, size: usize, dtype: DType) -> RuntimeError {
    RuntimeError::OutOfMemory {
        device: device.to_string(),
        size,
        dtype,
    }
}

/// Allocates on every request and releases immediately on free.
pub struct DirectAllocator {
    device: String,
    raw: Arc<dyn RawAllocator>,
}

impl DirectAllocator {
    pub fn new(device: impl Into<String>, raw: Arc<dyn RawAllocator>) -> Self {
        Self {
            device: device.into(),
            raw,
        }
    }
}

impl Allocator for DirectAllocator {
    fn device(&self) -> &str {
        &self.device
    }

    fn raw(&self) -> &dyn RawAllocator {
        self.raw.as_ref()
    }

    fn alloc(&self, size: usize, dtype: DType) -> RuntimeResult<RawBuffer> {
        let nbytes = dtype
            .nbytes(size)
            .ok_or_else(|| out_of_memory(&self.device, size, dtype))?;
        match self.raw.raw_alloc(nbytes) {
            Ok(raw) => Ok(raw),
            Err(AllocFailure::OutOfMemory) => Err(out_of_memory(&self.device, size, dtype)),
            Err(AllocFailure::Backend(err)) => Err(err),
        }
    }

    fn free(&self, raw: RawBuffer, size: usize, dtype: DType) {
        self.raw.raw_free(raw, size * dtype.itemsize());
    }
}

struct PoolState {
    classes: LruCache<(usize, DType), Vec<RawBuffer>>,
    stats: PoolStats,
}

/// Pools freed handles by `(size, dtype)` and hands them back on matching requests.
///
/// Idle bytes are bounded by `limit_bytes`; past the limit the least recently used
/// size class is released. When the backend reports out-of-memory the whole pool is
/// dropped and the error is surfaced; the request is not retried.
pub struct LruAllocator {
    device: String,
    raw: Arc<dyn RawAllocator>,
    limit_bytes: usize,
    state: Mutex<PoolState>,
}

impl LruAllocator {
    pub fn new(device: impl Into<String>, raw: Arc<dyn RawAllocator>, limit_bytes: usize) -> Self {
        Self {
            device: device.into(),
            raw,
            limit_bytes,
            state: Mutex::new(PoolState {
                classes: LruCache::unbounded(),
                stats: PoolStats::default(),
            }),
        }
    }

    fn release_all(&self, state: &mut PoolState) {
        while let Some(((size, dtype), handles)) = state.classes.pop_lru() {
            for handle in handles {
                self.raw.raw_free(handle, size * dtype.itemsize());
                state.stats.evictions += 1;
            }
        }
        state.stats.held_buffers = 0;
        state.stats.held_bytes = 0;
    }

    fn evict_to_limit(&self, state: &mut PoolState) {
        while state.stats.held_bytes > self.limit_bytes {
            let Some(((size, dtype), handles)) = state.classes.pop_lru() else {
                break;
            };
            let nbytes = size * dtype.itemsize();
            for handle in handles {
                self.raw.raw_free(handle, nbytes);
                state.stats.evictions += 1;
                state.stats.held_buffers -= 1;
                state.stats.held_bytes -= nbytes;
            }
        }
    }
}

impl Allocator for LruAllocator {
    fn device(&self) -> &str {
        &self.device
    }

    fn raw(&self) -> &dyn RawAllocator {
        self.raw.as_ref()
    }

    fn alloc(&self, size: usize, dtype: DType) -> RuntimeResult<RawBuffer> {
        let mut state = self.state.lock().expect("allocator pool mutex poisoned");
        let key = (size, dtype);
        let reused = match state.classes.get_mut(&key) {
            Some(handles) => handles.pop(),
            None => None,
        };
        if let Some(handle) = reused {
            if state.classes.peek(&key).is_some_and(Vec::is_empty) {
                state.classes.pop(&key);
            }
            state.stats.hits += 1;
            state.stats.held_buffers -= 1;
            state.stats.held_bytes -= size * dtype.itemsize();
            tracing::trace!(device = %self.device, size, ?dtype, "pooled buffer reused");
            return Ok(handle);
        }
        state.stats.misses += 1;
        let nbytes = dtype
            .nbytes(size)
            .ok_or_else(|| out_of_memory(&self.device, size, dtype))?;
        match self.raw.raw_alloc(nbytes) {
            Ok(handle) => Ok(handle),
            Err(AllocFailure::OutOfMemory) => {
                tracing::warn!(
                    device = %self.device,
                    size,
                    ?dtype,
                    held_bytes = state.stats.held_bytes,
                    "out of memory, dropping buffer pool"
                );
                self.release_all(&mut state);
                Err(out_of_memory(&self.device, size, dtype))
            }
            Err(AllocFailure::Backend(err)) => Err(err),
        }
    }

    fn free(&self, raw: RawBuffer, size: usize, dtype: DType) {
        let mut state = self.state.lock().expect("allocator pool mutex poisoned");
        let key = (size, dtype);
        match state.classes.get_mut(&key) {
            Some(handles) => handles.push(raw),
            None => {
                state.classes.put(key, vec![raw]);
            }
        }
        state.stats.held_buffers += 1;
        state.stats.held_bytes += size * dtype.itemsize();
        self.evict_to_limit(&mut state);
    }

    fn free_cache(&self) {
        let mut state = self.state.lock().expect("allocator pool mutex poisoned");
        self.release_all(&mut state);
    }

    fn stats(&self) -> PoolStats {
        self.state
            .lock()
            .expect("allocator pool mutex poisoned")
            .stats
    }
}

impl Drop for LruAllocator {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            self.release_all(&mut state);
        }
    }
}

/// Pooled allocator when `config.pooling` is set, direct otherwise.
pub fn allocator_for(
    device: impl Into<String>,
    raw: Arc<dyn RawAllocator>,
    config: &RuntimeConfig,
) -> Arc<dyn Allocator> {
    if config.pooling {
        Arc::new(LruAllocator::new(device, raw, config.pool_limit_bytes))
    } else {
        Arc::new(DirectAllocator::new(device, raw))
    }
}

/// Downcasts a raw handle to the backend's concrete type.
pub fn downcast_raw<'a, T: 'static>(raw: &'a RawBuffer, backend: &str) -> RuntimeResult<&'a T> {
    raw.downcast_ref::<T>().ok_or_else(|| {
        RuntimeError::execution(format!("buffer handle type mismatch for backend {backend}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRaw {
        live: AtomicUsize,
        allocs: AtomicUsize,
        capacity: Option<usize>,
    }

    impl RawAllocator for CountingRaw {
        fn raw_alloc(&self, nbytes: usize) -> Result<RawBuffer, AllocFailure> {
            if let Some(capacity) = self.capacity {
                if self.live.load(Ordering::SeqCst) + nbytes > capacity {
                    return Err(AllocFailure::OutOfMemory);
                }
            }
            self.live.fetch_add(nbytes, Ordering::SeqCst);
            self.allocs.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(vec![0u8; nbytes]))
        }

        fn raw_free(&self, _raw: RawBuffer, nbytes: usize) {
            self.live.fetch_sub(nbytes, Ordering::SeqCst);
        }

        fn copyin(&self, _dest: &RawBuffer, _src: &[u8]) -> RuntimeResult<()> {
            Ok(())
        }

        fn copyout(&self, _dest: &mut [u8], _src: &RawBuffer) -> RuntimeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn lru_reuses_matching_size_class() {
        let raw = Arc::new(CountingRaw::default());
        let pool = LruAllocator::new("TEST", raw.clone(), 1 << 20);
        let first = pool.alloc(16, DType::F32).expect("alloc");
        pool.free(first, 16, DType::F32);
        let _second = pool.alloc(16, DType::F32).expect("alloc");
        assert_eq!(raw.allocs.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.held_buffers, 0);
    }

    #[test]
    fn lru_evicts_past_byte_limit() {
        let raw = Arc::new(CountingRaw::default());
        let pool = LruAllocator::new("TEST", raw.clone(), 64);
        let a = pool.alloc(16, DType::F32).expect("alloc a");
        let b = pool.alloc(8, DType::F32).expect("alloc b");
        pool.free(a, 16, DType::F32);
        pool.free(b, 8, DType::F32);
        let stats = pool.stats();
        assert_eq!(stats.held_bytes, 32);
        assert_eq!(stats.evictions, 1);
        assert_eq!(raw.live.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn out_of_memory_drops_pool_without_retry() {
        let raw = Arc::new(CountingRaw {
            capacity: Some(128),
            ..CountingRaw::default()
        });
        let pool = LruAllocator::new("TEST", raw.clone(), 1 << 20);
        let held = pool.alloc(16, DType::F32).expect("alloc");
        pool.free(held, 16, DType::F32);
        let err = pool.alloc(32, DType::F32).expect_err("must fail");
        assert!(matches!(err, RuntimeError::OutOfMemory { size: 32, .. }));
        assert_eq!(pool.stats().held_buffers, 0);
        assert_eq!(raw.live.load(Ordering::SeqCst), 0);
        assert_eq!(raw.allocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn direct_allocator_frees_immediately() {
        let raw = Arc::new(CountingRaw::default());
        let direct = DirectAllocator::new("TEST", raw.clone());
        let handle = direct.alloc(4, DType::I32).expect("alloc");
        direct.free(handle, 4, DType::I32);
        assert_eq!(raw.live.load(Ordering::SeqCst), 0);
    }
}
