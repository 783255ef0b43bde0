//! Operation trees executed by the schedule runner.
//!
//! A [`LazyOp`] is an immutable tree: leaves are buffer ops (`LOAD`/`CONST`) or
//! load ops, interior nodes are elementwise, ternary or reduce ops. Trees compare and
//! hash structurally so devices can cache one compiled runner per distinct tree.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::Buffer;
use crate::error::RuntimeResult;
use crate::shape::{Dims, Variable, View};
use crate::tensor::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Noop,
    Neg,
    Exp2,
    Log2,
    Sin,
    Sqrt,
    Recip,
    Cast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Mod,
    CmpLt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TernaryOp {
    MulAcc,
    Where,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferOp {
    Load,
    Const,
    Store,
}

/// Allocation and data-movement operations that bypass kernel compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadOp {
    Empty,
    Rand,
    From,
    Custom,
}

impl LoadOp {
    pub const ALL: [LoadOp; 4] = [LoadOp::Empty, LoadOp::Rand, LoadOp::From, LoadOp::Custom];

    pub fn name(self) -> &'static str {
        match self {
            LoadOp::Empty => "EMPTY",
            LoadOp::Rand => "RAND",
            LoadOp::From => "FROM",
            LoadOp::Custom => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Reduce(ReduceOp),
    Buffer(BufferOp),
    Load(LoadOp),
}

impl From<UnaryOp> for Op {
    fn from(op: UnaryOp) -> Self {
        Op::Unary(op)
    }
}

impl From<BinaryOp> for Op {
    fn from(op: BinaryOp) -> Self {
        Op::Binary(op)
    }
}

impl From<TernaryOp> for Op {
    fn from(op: TernaryOp) -> Self {
        Op::Ternary(op)
    }
}

impl From<ReduceOp> for Op {
    fn from(op: ReduceOp) -> Self {
        Op::Reduce(op)
    }
}

impl From<BufferOp> for Op {
    fn from(op: BufferOp) -> Self {
        Op::Buffer(op)
    }
}

impl From<LoadOp> for Op {
    fn from(op: LoadOp) -> Self {
        Op::Load(op)
    }
}

/// Argument slot `idx` of a kernel, read or written through `view`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemBuffer {
    pub idx: usize,
    pub dtype: DType,
    pub view: View,
}

/// Scalar broadcast through `view`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstBuffer {
    pub value: f64,
    pub dtype: DType,
    pub view: View,
}

impl PartialEq for ConstBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.value.to_bits() == other.value.to_bits()
            && self.dtype == other.dtype
            && self.view == other.view
    }
}

impl Eq for ConstBuffer {}

impl Hash for ConstBuffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.to_bits().hash(state);
        self.dtype.hash(state);
        self.view.hash(state);
    }
}

pub type CustomFn = dyn Fn(&Buffer, &[&Buffer]) -> RuntimeResult<()> + Send + Sync;

/// Backend-aware callback for `CUSTOM` load ops. Compared by identity.
#[derive(Clone)]
pub struct CustomOp {
    name: Arc<str>,
    func: Arc<CustomFn>,
}

impl CustomOp {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Buffer, &[&Buffer]) -> RuntimeResult<()> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, out: &Buffer, srcs: &[&Buffer]) -> RuntimeResult<()> {
        (self.func)(out, srcs)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.func) as *const () as usize
    }
}

impl PartialEq for CustomOp {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for CustomOp {}

impl Hash for CustomOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for CustomOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOp").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum OpArg {
    #[default]
    None,
    Mem(MemBuffer),
    Const(ConstBuffer),
    Seed(u64),
    Shape(Dims),
    DType(DType),
    Custom(CustomOp),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LazyOp {
    pub op: Op,
    pub src: Vec<Arc<LazyOp>>,
    pub arg: OpArg,
}

impl LazyOp {
    pub fn new(op: impl Into<Op>, src: Vec<Arc<LazyOp>>, arg: OpArg) -> Arc<Self> {
        Arc::new(Self {
            op: op.into(),
            src,
            arg,
        })
    }

    /// `LOAD` leaf reading argument slot `idx`.
    pub fn load(idx: usize, dtype: DType, view: View) -> Arc<Self> {
        Self::new(
            BufferOp::Load,
            Vec::new(),
            OpArg::Mem(MemBuffer { idx, dtype, view }),
        )
    }

    pub fn constant(value: f64, dtype: DType, view: View) -> Arc<Self> {
        Self::new(
            BufferOp::Const,
            Vec::new(),
            OpArg::Const(ConstBuffer { value, dtype, view }),
        )
    }

    /// `STORE` root writing `value` into the output slot.
    pub fn store(value: Arc<LazyOp>, dtype: DType, view: View) -> Arc<Self> {
        Self::new(
            BufferOp::Store,
            vec![value],
            OpArg::Mem(MemBuffer { idx: 0, dtype, view }),
        )
    }

    pub fn load_op(&self) -> Option<LoadOp> {
        match self.op {
            Op::Load(op) => Some(op),
            _ => None,
        }
    }

    pub fn mem(&self) -> Option<&MemBuffer> {
        match &self.arg {
            OpArg::Mem(mem) => Some(mem),
            _ => None,
        }
    }

    /// All nodes of the tree in depth-first pre-order, including `self`.
    pub fn lazyops(&self) -> Vec<&LazyOp> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.src.iter().rev().map(Arc::as_ref));
        }
        out
    }

    /// `LOAD` leaves reading argument slot `idx`.
    pub fn loads_of(&self, idx: usize) -> impl Iterator<Item = &MemBuffer> {
        self.lazyops().into_iter().filter_map(move |node| match (&node.op, &node.arg) {
            (Op::Buffer(BufferOp::Load), OpArg::Mem(mem)) if mem.idx == idx => Some(mem),
            _ => None,
        })
    }

    /// Symbolic variables referenced by any view or shape argument in the tree.
    pub fn vars(&self) -> BTreeSet<Variable> {
        let mut vars = BTreeSet::new();
        for node in self.lazyops() {
            match &node.arg {
                OpArg::Mem(mem) => vars.extend(mem.view.variables().cloned()),
                OpArg::Const(constant) => vars.extend(constant.view.variables().cloned()),
                OpArg::Shape(dims) => {
                    vars.extend(dims.iter().filter_map(|dim| dim.variable().cloned()))
                }
                _ => {}
            }
        }
        vars
    }
}
