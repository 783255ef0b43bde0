//! Shapes with symbolic dimensions and strided views over buffers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{RuntimeError, RuntimeResult};

pub type Dims = SmallVec<[Dim; 4]>;
pub type Strides = SmallVec<[isize; 4]>;

/// Symbolic integer bound to a concrete value per schedule item (e.g. a sequence length).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable {
    name: Arc<str>,
    min: i64,
    max: i64,
}

impl Variable {
    /// Fails when `min > max`.
    pub fn new(name: impl Into<String>, min: i64, max: i64) -> RuntimeResult<Self> {
        let name = name.into();
        if min > max {
            return Err(RuntimeError::execution(format!(
                "variable {name} bounds inverted: {min} > {max}"
            )));
        }
        Ok(Self {
            name: Arc::from(name),
            min,
            max,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}-{}]", self.name, self.min, self.max)
    }
}

/// Single axis extent: either fixed or a bounded symbolic variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Fixed(usize),
    Symbolic(Variable),
}

impl Dim {
    /// Largest extent this dimension can take, used for buffer sizing and strides.
    pub fn max_extent(&self) -> usize {
        match self {
            Dim::Fixed(value) => *value,
            Dim::Symbolic(var) => usize::try_from(var.max()).unwrap_or(0),
        }
    }

    pub fn as_fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(value) => Some(*value),
            Dim::Symbolic(_) => None,
        }
    }

    pub fn variable(&self) -> Option<&Variable> {
        match self {
            Dim::Fixed(_) => None,
            Dim::Symbolic(var) => Some(var),
        }
    }
}

impl From<usize> for Dim {
    fn from(value: usize) -> Self {
        Dim::Fixed(value)
    }
}

impl From<Variable> for Dim {
    fn from(value: Variable) -> Self {
        Dim::Symbolic(value)
    }
}

/// Element count of a shape with every symbolic dimension at its static maximum.
///
/// `None` when the product overflows `usize`.
pub fn max_element_count(shape: &[Dim]) -> Option<usize> {
    shape
        .iter()
        .map(Dim::max_extent)
        .try_fold(1usize, usize::checked_mul)
}

/// Builds a fixed-size shape from plain extents.
pub fn fixed(dims: &[usize]) -> Dims {
    dims.iter().copied().map(Dim::Fixed).collect()
}

/// Row-major strides for `shape`; size-1 axes get stride 0.
pub fn contiguous_strides(shape: &[Dim]) -> Strides {
    let mut strides: Strides = SmallVec::from_elem(0, shape.len());
    let mut acc = 1isize;
    for (idx, dim) in shape.iter().enumerate().rev() {
        let extent = dim.max_extent() as isize;
        strides[idx] = if extent == 1 { 0 } else { acc };
        acc *= extent.max(1);
    }
    strides
}

/// Strided window over a buffer, as read by a LOAD or written by a STORE.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    pub shape: Dims,
    pub strides: Strides,
    pub offset: isize,
}

impl View {
    pub fn new(shape: Dims, strides: Strides, offset: isize) -> Self {
        assert_eq!(
            shape.len(),
            strides.len(),
            "view rank mismatch: shape {shape:?} strides {strides:?}"
        );
        Self {
            shape,
            strides,
            offset,
        }
    }

    /// Row-major view covering the whole shape.
    pub fn contiguous(shape: Dims) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Reorders axes; the result is non-contiguous unless `axes` is the identity
    /// or only moves size-1 axes.
    pub fn permute(&self, axes: &[usize]) -> Self {
        assert_eq!(axes.len(), self.shape.len(), "permute rank mismatch");
        Self {
            shape: axes.iter().map(|&axis| self.shape[axis].clone()).collect(),
            strides: axes.iter().map(|&axis| self.strides[axis]).collect(),
            offset: self.offset,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// True when the view reads its elements in linear, non-strided order from offset zero.
    pub fn is_contiguous(&self) -> bool {
        if self.offset != 0 {
            return false;
        }
        let expected = contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(dim, (stride, want))| dim.max_extent() == 1 || stride == want)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.shape.iter().filter_map(Dim::variable)
    }
}
