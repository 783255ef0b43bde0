//! Serializable kernel description produced by [`CpuRenderer`].
//!
//! The rendered "source" is JSON so it can be inspected and hashed; compiling parses
//! and validates it and stores the result as `bincode`.

use lazyrt::device::{KernelOptions, KernelSignature, RenderedKernel, Renderer};
use lazyrt::hashing::fnv1a_hash;
use lazyrt::ops::{BinaryOp, BufferOp, LazyOp, Op, OpArg, ReduceOp, TernaryOp, UnaryOp};
use lazyrt::shape::{Dim, Variable, View};
use lazyrt::{DType, RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimIr {
    Fixed(usize),
    /// Index into the kernel's integer arguments.
    Var(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewIr {
    pub shape: Vec<DimIr>,
    pub strides: Vec<isize>,
    pub offset: isize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Load {
        idx: usize,
        dtype: DType,
        view: ViewIr,
    },
    Const {
        value: f64,
        shape: Vec<DimIr>,
    },
    Unary {
        op: UnaryOp,
        dtype: Option<DType>,
        src: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        op: TernaryOp,
        a: Box<Expr>,
        b: Box<Expr>,
        c: Box<Expr>,
    },
    Reduce {
        op: ReduceOp,
        /// Output shape; axes whose extent differs from the source are folded.
        shape: Vec<DimIr>,
        src: Box<Expr>,
    },
}

impl Expr {
    /// Shape this expression is evaluated over: the first view found below it.
    pub fn shape(&self) -> Option<&[DimIr]> {
        match self {
            Expr::Load { view, .. } => Some(&view.shape),
            Expr::Const { shape, .. } => Some(shape),
            Expr::Reduce { shape, .. } => Some(shape),
            Expr::Unary { src, .. } => src.shape(),
            Expr::Binary { lhs, rhs, .. } => lhs.shape().or_else(|| rhs.shape()),
            Expr::Ternary { a, b, c, .. } => a.shape().or_else(|| b.shape()).or_else(|| c.shape()),
        }
    }

    fn visit_loads<'a>(&'a self, out: &mut Vec<(usize, &'a ViewIr)>) {
        match self {
            Expr::Load { idx, view, .. } => out.push((*idx, view)),
            Expr::Const { .. } => {}
            Expr::Unary { src, .. } | Expr::Reduce { src, .. } => src.visit_loads(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit_loads(out);
                rhs.visit_loads(out);
            }
            Expr::Ternary { a, b, c, .. } => {
                a.visit_loads(out);
                b.visit_loads(out);
                c.visit_loads(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelIr {
    pub buffers: usize,
    pub vars: Vec<String>,
    pub out_dtype: DType,
    pub out_view: ViewIr,
    pub value: Expr,
}

impl KernelIr {
    pub fn parse(source: &str) -> RuntimeResult<Self> {
        let ir: KernelIr = serde_json::from_str(source)
            .map_err(|err| RuntimeError::compile("ref-interp", err.to_string(), source))?;
        ir.validate()
            .map_err(|message| RuntimeError::compile("ref-interp", message, source))?;
        Ok(ir)
    }

    /// Structural checks the interpreter relies on before indexing buffers.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffers == 0 {
            return Err("kernel has no output argument".to_string());
        }
        check_view(&self.out_view, self.vars.len())?;
        let rank = self.out_view.shape.len();
        let mut loads = Vec::new();
        self.value.visit_loads(&mut loads);
        for (idx, view) in loads {
            if idx == 0 || idx >= self.buffers {
                return Err(format!(
                    "load of argument {idx} outside 1..{}",
                    self.buffers
                ));
            }
            check_view(view, self.vars.len())?;
            if view.shape.len() != rank {
                return Err(format!(
                    "load of argument {idx} has rank {} but output has rank {rank}",
                    view.shape.len()
                ));
            }
        }
        Ok(())
    }
}

fn check_view(view: &ViewIr, vars: usize) -> Result<(), String> {
    if view.shape.len() != view.strides.len() {
        return Err(format!(
            "view rank mismatch: {} dims, {} strides",
            view.shape.len(),
            view.strides.len()
        ));
    }
    for dim in &view.shape {
        if let DimIr::Var(slot) = dim {
            if *slot >= vars {
                return Err(format!("dimension refers to missing variable {slot}"));
            }
        }
    }
    Ok(())
}

/// Lowers operation trees into [`KernelIr`] JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuRenderer;

struct Lowering {
    vars: Vec<Variable>,
    max_idx: usize,
}

impl Lowering {
    fn dims(&self, dims: &[Dim]) -> Vec<DimIr> {
        dims.iter()
            .map(|dim| match dim {
                Dim::Fixed(value) => DimIr::Fixed(*value),
                Dim::Symbolic(var) => DimIr::Var(
                    self.vars
                        .iter()
                        .position(|known| known == var)
                        .unwrap_or_default(),
                ),
            })
            .collect()
    }

    fn view(&self, view: &View) -> ViewIr {
        ViewIr {
            shape: self.dims(&view.shape),
            strides: view.strides.to_vec(),
            offset: view.offset,
        }
    }

    fn lower(&mut self, node: &LazyOp) -> RuntimeResult<Expr> {
        let src = |this: &mut Self, index: usize| -> RuntimeResult<Box<Expr>> {
            let child = node.src.get(index).ok_or_else(|| {
                RuntimeError::execution(format!("{:?} is missing operand {index}", node.op))
            })?;
            Ok(Box::new(this.lower(child)?))
        };
        match (node.op, &node.arg) {
            (Op::Buffer(BufferOp::Load), OpArg::Mem(mem)) => {
                self.max_idx = self.max_idx.max(mem.idx);
                Ok(Expr::Load {
                    idx: mem.idx,
                    dtype: mem.dtype,
                    view: self.view(&mem.view),
                })
            }
            (Op::Buffer(BufferOp::Const), OpArg::Const(constant)) => Ok(Expr::Const {
                value: constant.value,
                shape: self.dims(&constant.view.shape),
            }),
            (Op::Unary(op), arg) => {
                let dtype = match arg {
                    OpArg::DType(dtype) => Some(*dtype),
                    _ => None,
                };
                Ok(Expr::Unary {
                    op,
                    dtype,
                    src: src(self, 0)?,
                })
            }
            (Op::Binary(op), _) => Ok(Expr::Binary {
                op,
                lhs: src(self, 0)?,
                rhs: src(self, 1)?,
            }),
            (Op::Ternary(op), _) => Ok(Expr::Ternary {
                op,
                a: src(self, 0)?,
                b: src(self, 1)?,
                c: src(self, 2)?,
            }),
            (Op::Reduce(op), OpArg::Shape(dims)) => Ok(Expr::Reduce {
                op,
                shape: self.dims(dims),
                src: src(self, 0)?,
            }),
            (op, _) => Err(RuntimeError::execution(format!(
                "CPU renderer cannot lower {op:?} inside a kernel"
            ))),
        }
    }
}

impl Renderer for CpuRenderer {
    fn render(&self, ast: &LazyOp, _options: &KernelOptions) -> RuntimeResult<RenderedKernel> {
        let (value, store) = match (ast.op, &ast.arg, ast.src.first()) {
            (Op::Buffer(BufferOp::Store), OpArg::Mem(store), Some(value)) => (value, store),
            _ => {
                return Err(RuntimeError::execution(format!(
                    "kernel root must be a STORE, got {:?}",
                    ast.op
                )))
            }
        };
        let vars: Vec<Variable> = ast.vars().into_iter().collect();
        let mut lowering = Lowering { vars, max_idx: 0 };
        let value = lowering.lower(value)?;
        let ir = KernelIr {
            buffers: lowering.max_idx + 1,
            vars: lowering.vars.iter().map(|var| var.name().to_string()).collect(),
            out_dtype: store.dtype,
            out_view: lowering.view(&store.view),
            value,
        };
        let source = serde_json::to_string(&ir)
            .map_err(|err| RuntimeError::execution(format!("failed to encode kernel: {err}")))?;
        let name = format!("E_{:08x}", fnv1a_hash(source.as_bytes()) as u32);
        Ok(RenderedKernel {
            name,
            source,
            signature: KernelSignature::new(ir.buffers, lowering.vars),
        })
    }
}
