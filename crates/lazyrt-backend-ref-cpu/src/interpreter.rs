//! Executes [`KernelIr`] over host buffers, element by element in `f64`.

use std::time::{Duration, Instant};

use lazyrt::device::{downcast_raw, HostAllocation, Program, RawBuffer};
use lazyrt::ops::{BinaryOp, ReduceOp, TernaryOp, UnaryOp};
use lazyrt::{DType, RuntimeError, RuntimeResult};

use crate::kernel::{DimIr, Expr, KernelIr, ViewIr};

pub struct InterpretedProgram {
    name: String,
    ir: KernelIr,
}

impl InterpretedProgram {
    pub fn new(name: impl Into<String>, ir: KernelIr) -> Self {
        Self {
            name: name.into(),
            ir,
        }
    }

    pub fn from_artifact(name: &str, artifact: &[u8]) -> RuntimeResult<Self> {
        let ir: KernelIr = bincode::deserialize(artifact).map_err(|err| {
            RuntimeError::execution(format!("corrupt CPU kernel artifact for {name}: {err}"))
        })?;
        ir.validate().map_err(|message| {
            RuntimeError::execution(format!("invalid CPU kernel artifact for {name}: {message}"))
        })?;
        Ok(Self::new(name, ir))
    }
}

struct Frame<'a> {
    bufs: Vec<&'a HostAllocation>,
    vars: &'a [i32],
}

impl Frame<'_> {
    fn resolve(&self, dims: &[DimIr]) -> RuntimeResult<Vec<usize>> {
        dims.iter()
            .map(|dim| match dim {
                DimIr::Fixed(value) => Ok(*value),
                DimIr::Var(slot) => {
                    let value = self.vars.get(*slot).copied().ok_or_else(|| {
                        RuntimeError::execution(format!("missing kernel variable {slot}"))
                    })?;
                    usize::try_from(value).map_err(|_| {
                        RuntimeError::execution(format!("negative extent {value} for variable {slot}"))
                    })
                }
            })
            .collect()
    }

    fn element(&self, idx: usize, dtype: DType, view: &ViewIr, coords: &[usize]) -> RuntimeResult<f64> {
        let block = self.bufs[idx];
        let offset = linear_offset(view, coords)?;
        let size = dtype.itemsize();
        let start = offset
            .checked_mul(size)
            .filter(|start| start + size <= block.len())
            .ok_or_else(|| {
                RuntimeError::execution(format!("load of argument {idx} out of bounds at {offset}"))
            })?;
        let mut scratch = [0u8; 8];
        block.read(start, &mut scratch[..size])?;
        Ok(dtype.decode_f64(&scratch[..size]))
    }

    fn eval(&self, expr: &Expr, coords: &[usize]) -> RuntimeResult<f64> {
        Ok(match expr {
            Expr::Load { idx, dtype, view } => self.element(*idx, *dtype, view, coords)?,
            Expr::Const { value, .. } => *value,
            Expr::Unary { op, dtype, src } => unary(*op, *dtype, self.eval(src, coords)?),
            Expr::Binary { op, lhs, rhs } => {
                binary(*op, self.eval(lhs, coords)?, self.eval(rhs, coords)?)
            }
            Expr::Ternary { op, a, b, c } => {
                let cond = self.eval(a, coords)?;
                match op {
                    TernaryOp::MulAcc => cond * self.eval(b, coords)? + self.eval(c, coords)?,
                    TernaryOp::Where if cond != 0.0 => self.eval(b, coords)?,
                    TernaryOp::Where => self.eval(c, coords)?,
                }
            }
            Expr::Reduce { op, shape, src } => self.reduce(*op, shape, src, coords)?,
        })
    }

    /// Folds `src` over every source index that maps onto `coords`. Axes whose output
    /// extent differs from the source extent are reduced.
    fn reduce(
        &self,
        op: ReduceOp,
        shape: &[DimIr],
        src: &Expr,
        coords: &[usize],
    ) -> RuntimeResult<f64> {
        let full = self.resolve(src.shape().unwrap_or(&[]))?;
        let reduced = self.resolve(shape)?;
        if full.len() != coords.len() || reduced.len() != coords.len() {
            return Err(RuntimeError::execution(format!(
                "reduce ranks disagree: source {}, output {}, index {}",
                full.len(),
                reduced.len(),
                coords.len()
            )));
        }
        let ranges: Vec<usize> = full
            .iter()
            .zip(&reduced)
            .map(|(extent, out)| if extent != out { *extent } else { 1 })
            .collect();
        let mut acc = match op {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
        };
        for offsets in MultiIndex::new(&ranges) {
            let point: Vec<usize> = offsets
                .iter()
                .zip(coords)
                .map(|(offset, coord)| offset + coord)
                .collect();
            let value = self.eval(src, &point)?;
            acc = match op {
                ReduceOp::Sum => acc + value,
                ReduceOp::Max => acc.max(value),
            };
        }
        Ok(acc)
    }
}

fn linear_offset(view: &ViewIr, coords: &[usize]) -> RuntimeResult<usize> {
    let mut offset = view.offset;
    for (coord, stride) in coords.iter().zip(&view.strides) {
        offset += *coord as isize * *stride;
    }
    usize::try_from(offset)
        .map_err(|_| RuntimeError::execution(format!("negative buffer offset {offset}")))
}

fn unary(op: UnaryOp, dtype: Option<DType>, x: f64) -> f64 {
    match op {
        UnaryOp::Noop => x,
        UnaryOp::Neg => -x,
        UnaryOp::Exp2 => x.exp2(),
        UnaryOp::Log2 => x.log2(),
        UnaryOp::Sin => x.sin(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Recip => 1.0 / x,
        UnaryOp::Cast => match dtype {
            Some(dtype) => {
                let mut scratch = [0u8; 8];
                dtype.encode_f64(x, &mut scratch);
                dtype.decode_f64(&scratch)
            }
            None => x,
        },
    }
}

fn binary(op: BinaryOp, x: f64, y: f64) -> f64 {
    match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        BinaryOp::Max => x.max(y),
        BinaryOp::Mod => x % y,
        BinaryOp::CmpLt => f64::from(u8::from(x < y)),
    }
}

impl Program for InterpretedProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        bufs: &[&RawBuffer],
        vars: &[i32],
        wait: bool,
    ) -> RuntimeResult<Option<Duration>> {
        let start = Instant::now();
        if bufs.len() != self.ir.buffers {
            return Err(RuntimeError::execution(format!(
                "{} expects {} buffers, got {}",
                self.name,
                self.ir.buffers,
                bufs.len()
            )));
        }
        let blocks = bufs
            .iter()
            .map(|raw| downcast_raw::<HostAllocation>(raw, "CPU"))
            .collect::<RuntimeResult<Vec<_>>>()?;
        let frame = Frame {
            bufs: blocks,
            vars,
        };

        let out_shape = frame.resolve(&self.ir.out_view.shape)?;
        // Evaluate everything before writing so an output aliasing an input reads old values.
        let mut results = Vec::new();
        for coords in MultiIndex::new(&out_shape) {
            let value = frame.eval(&self.ir.value, &coords)?;
            results.push((linear_offset(&self.ir.out_view, &coords)?, value));
        }

        let dtype = self.ir.out_dtype;
        let size = dtype.itemsize();
        let out = frame.bufs[0];
        let mut scratch = [0u8; 8];
        for (offset, value) in results {
            dtype.encode_f64(value, &mut scratch);
            out.write(offset * size, &scratch[..size])?;
        }
        Ok(wait.then(|| start.elapsed()))
    }
}

struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    first: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            first: true,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.shape.contains(&0) {
            return None;
        }
        if self.first {
            self.first = false;
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        None
    }
}
