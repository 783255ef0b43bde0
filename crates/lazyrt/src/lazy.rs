//! Logical graph nodes and the schedule items that realize them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::device::{canonicalize, Buffer};
use crate::error::{ContractViolation, RuntimeResult};
use crate::ops::LazyOp;
use crate::shape::{max_element_count, Dims, Variable};
use crate::tensor::DType;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// How a node came by its storage. Decided once, when the node is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Took over the pre-assigned output buffer.
    Adopted,
    /// Received a freshly allocated buffer.
    Allocated,
    /// Created already backed by a caller-provided buffer.
    Provided,
}

#[derive(Debug, Clone)]
pub struct Realized {
    pub buffer: Arc<Buffer>,
    pub origin: BufferOrigin,
}

/// Tensor node that is realized at most once.
///
/// Until realization it carries the op that produces it; afterwards the op is
/// released (also on every live view) and [`LazyBuffer::realized`] returns the buffer.
pub struct LazyBuffer {
    id: u64,
    device: String,
    shape: Dims,
    dtype: DType,
    op: Mutex<Option<Arc<LazyOp>>>,
    output_buffer: Mutex<Option<Arc<Buffer>>>,
    realized: OnceLock<Realized>,
    views: Mutex<Vec<Weak<LazyBuffer>>>,
}

impl LazyBuffer {
    fn build(device: &str, shape: Dims, dtype: DType, op: Option<Arc<LazyOp>>) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            device: canonicalize(device),
            shape,
            dtype,
            op: Mutex::new(op),
            output_buffer: Mutex::new(None),
            realized: OnceLock::new(),
            views: Mutex::new(Vec::new()),
        }
    }

    /// Unrealized node produced by `op`.
    pub fn new(device: &str, shape: Dims, dtype: DType, op: Arc<LazyOp>) -> Arc<Self> {
        Arc::new(Self::build(device, shape, dtype, Some(op)))
    }

    /// Node that is realized from the start, backed by `buffer`.
    pub fn realized_from(shape: Dims, buffer: Arc<Buffer>) -> Arc<Self> {
        let node = Self::build(buffer.device(), shape, buffer.dtype(), None);
        let _ = node.realized.set(Realized {
            buffer,
            origin: BufferOrigin::Provided,
        });
        Arc::new(node)
    }

    /// Pre-assigns `buffer` as the storage this node should be written into.
    pub fn with_output_buffer(self: Arc<Self>, buffer: Arc<Buffer>) -> Arc<Self> {
        *self
            .output_buffer
            .lock()
            .expect("lazy buffer output mutex poisoned") = Some(buffer);
        self
    }

    /// View of this node with a new logical shape. It shares the producing op and loses
    /// it when this node is realized.
    pub fn view(self: &Arc<Self>, shape: Dims) -> Arc<Self> {
        let view = Arc::new(Self::build(&self.device, shape, self.dtype, self.op()));
        self.views
            .lock()
            .expect("lazy buffer views mutex poisoned")
            .push(Arc::downgrade(&view));
        view
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn shape(&self) -> &Dims {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Element count with symbolic dimensions at their maximum, `None` on overflow.
    pub fn max_size(&self) -> Option<usize> {
        max_element_count(&self.shape)
    }

    pub fn op(&self) -> Option<Arc<LazyOp>> {
        self.op.lock().expect("lazy buffer op mutex poisoned").clone()
    }

    pub fn output_buffer(&self) -> Option<Arc<Buffer>> {
        self.output_buffer
            .lock()
            .expect("lazy buffer output mutex poisoned")
            .clone()
    }

    pub(crate) fn take_output_buffer(&self) -> Option<Arc<Buffer>> {
        self.output_buffer
            .lock()
            .expect("lazy buffer output mutex poisoned")
            .take()
    }

    pub fn realized(&self) -> Option<&Arc<Buffer>> {
        self.realized.get().map(|realized| &realized.buffer)
    }

    pub fn realization(&self) -> Option<&Realized> {
        self.realized.get()
    }

    pub fn is_realized(&self) -> bool {
        self.realized.get().is_some()
    }

    /// Attaches `buffer`, then releases the op on this node and its live views.
    pub(crate) fn mark_realized(
        &self,
        buffer: Arc<Buffer>,
        origin: BufferOrigin,
    ) -> RuntimeResult<()> {
        self.realized
            .set(Realized { buffer, origin })
            .map_err(|_| ContractViolation::AlreadyRealized {
                device: self.device.clone(),
            })?;
        self.op.lock().expect("lazy buffer op mutex poisoned").take();
        let mut views = self.views.lock().expect("lazy buffer views mutex poisoned");
        for view in views.drain(..).filter_map(|weak| weak.upgrade()) {
            view.op.lock().expect("lazy buffer op mutex poisoned").take();
        }
        Ok(())
    }
}

impl fmt::Debug for LazyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyBuffer")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("realized", &self.is_realized())
            .finish()
    }
}

/// One unit of work: write `ast` into `out`, reading `inputs` (argument slots 1..).
#[derive(Debug, Clone)]
pub struct ScheduleItem {
    pub ast: Arc<LazyOp>,
    pub out: Arc<LazyBuffer>,
    pub inputs: Vec<Arc<LazyBuffer>>,
    pub var_vals: BTreeMap<Variable, i64>,
}

impl ScheduleItem {
    pub fn new(ast: Arc<LazyOp>, out: Arc<LazyBuffer>, inputs: Vec<Arc<LazyBuffer>>) -> Self {
        Self {
            ast,
            out,
            inputs,
            var_vals: BTreeMap::new(),
        }
    }

    pub fn with_var(mut self, var: Variable, value: i64) -> Self {
        self.var_vals.insert(var, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DirectAllocator, HostAllocator};
    use crate::ops::{LoadOp, OpArg};
    use crate::shape::fixed;

    fn host_buffer(size: usize) -> Arc<Buffer> {
        let allocator = Arc::new(DirectAllocator::new("CPU", Arc::new(HostAllocator::new("CPU"))));
        Arc::new(Buffer::new(allocator, size, DType::F32).expect("alloc"))
    }

    #[test]
    fn realization_releases_op_on_views() {
        let op = LazyOp::new(LoadOp::Empty, Vec::new(), OpArg::None);
        let node = LazyBuffer::new("cpu", fixed(&[4]), DType::F32, op);
        let view = node.view(fixed(&[2, 2]));
        assert!(view.op().is_some());

        node.mark_realized(host_buffer(4), BufferOrigin::Allocated)
            .expect("first realization");
        assert!(node.op().is_none());
        assert!(view.op().is_none());
        assert_eq!(node.device(), "CPU");
    }

    #[test]
    fn second_realization_is_a_contract_violation() {
        let node = LazyBuffer::realized_from(fixed(&[4]), host_buffer(4));
        let err = node
            .mark_realized(host_buffer(4), BufferOrigin::Allocated)
            .expect_err("already realized");
        assert!(matches!(
            err.as_contract(),
            Some(ContractViolation::AlreadyRealized { .. })
        ));
        assert_eq!(
            node.realization().map(|r| r.origin),
            Some(BufferOrigin::Provided)
        );
    }
}
