//! Handlers for allocation and data-movement ops that bypass kernel compilation.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::Buffer;
use crate::error::{ContractViolation, RuntimeError, RuntimeResult};
use crate::ops::{BufferOp, LazyOp, LoadOp, Op, OpArg};

/// Checks that every source of a load op is a contiguous `LOAD` of slot `i + 1`.
pub(crate) fn validate_sources(ast: &LazyOp) -> Result<(), ContractViolation> {
    for (index, src) in ast.src.iter().enumerate() {
        let malformed = |reason: &str| ContractViolation::MalformedLoadOp {
            index,
            reason: reason.to_string(),
        };
        let mem = match (src.op, src.mem()) {
            (Op::Buffer(BufferOp::Load), Some(mem)) => mem,
            _ => return Err(malformed("source is not a buffer load")),
        };
        if mem.idx != index + 1 {
            return Err(malformed(&format!(
                "reads argument {} but sits at position {}",
                mem.idx,
                index + 1
            )));
        }
        if !mem.view.is_contiguous() {
            return Err(malformed("source view is not contiguous"));
        }
    }
    Ok(())
}

pub(crate) fn dispatch(op: LoadOp, arg: &OpArg, out: &Buffer, srcs: &[&Buffer]) -> RuntimeResult<()> {
    match op {
        LoadOp::Empty => Ok(()),
        LoadOp::Rand => match arg {
            OpArg::Seed(seed) => fill_random(out, *seed),
            _ => Err(bad_arg(op, "a seed")),
        },
        LoadOp::From => match srcs {
            [src] => copy_from(out, src),
            _ => Err(ContractViolation::MalformedLoadOp {
                index: srcs.len(),
                reason: format!("FROM takes exactly one source, got {}", srcs.len()),
            }
            .into()),
        },
        LoadOp::Custom => match arg {
            OpArg::Custom(custom) => custom.call(out, srcs),
            _ => Err(bad_arg(op, "a callback")),
        },
    }
}

fn bad_arg(op: LoadOp, wanted: &str) -> RuntimeError {
    ContractViolation::MalformedLoadOp {
        index: 0,
        reason: format!("{} needs {wanted} argument", op.name()),
    }
    .into()
}

/// Uniform `[0, 1)` f32 values from a seeded generator, cast to the buffer dtype.
pub(crate) fn random_bytes(out: &Buffer, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..out.size()).map(|_| rng.gen::<f32>()).collect();
    out.dtype().encode_f32_slice(&values)
}

fn fill_random(out: &Buffer, seed: u64) -> RuntimeResult<()> {
    out.copyin_shared(Arc::from(random_bytes(out, seed)))
}

fn copy_from(out: &Buffer, src: &Buffer) -> RuntimeResult<()> {
    if src.size() != out.size() {
        return Err(RuntimeError::SizeMismatch {
            context: "FROM load op",
            expected: out.size(),
            actual: src.size(),
        });
    }
    out.transfer_from(src)
}
