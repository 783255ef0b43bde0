use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::{Buffer, KernelSignature, Program, RawBuffer};
use crate::error::{RuntimeError, RuntimeResult};
use crate::profiling;
use crate::shape::Variable;

/// Compiled program bound to the kernel signature it was rendered with.
pub struct CompiledRunner {
    device: String,
    name: String,
    signature: KernelSignature,
    program: Box<dyn Program>,
}

impl CompiledRunner {
    pub fn new(
        device: String,
        name: String,
        signature: KernelSignature,
        program: Box<dyn Program>,
    ) -> Self {
        Self {
            device,
            name,
            signature,
            program,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    fn bind_vars(&self, var_vals: &BTreeMap<Variable, i64>) -> RuntimeResult<Vec<i32>> {
        self.signature
            .vars
            .iter()
            .map(|var| {
                let value = var_vals.get(var).copied().ok_or_else(|| {
                    RuntimeError::execution(format!(
                        "kernel {} needs variable {var} but it is unbound",
                        self.name
                    ))
                })?;
                i32::try_from(value).map_err(|_| {
                    RuntimeError::execution(format!(
                        "variable {var} value {value} does not fit a 32-bit kernel argument"
                    ))
                })
            })
            .collect()
    }

    /// Invokes the program with `bufs` (output first) and the signature's variables
    /// bound from `var_vals`.
    pub fn exec(
        &self,
        bufs: &[&Buffer],
        var_vals: &BTreeMap<Variable, i64>,
        wait: bool,
    ) -> RuntimeResult<Option<Duration>> {
        if bufs.len() != self.signature.buffers {
            return Err(RuntimeError::execution(format!(
                "kernel {} expects {} buffers, got {}",
                self.name,
                self.signature.buffers,
                bufs.len()
            )));
        }
        let raws = bufs
            .iter()
            .enumerate()
            .map(|(idx, buf)| {
                buf.raw().ok_or_else(|| {
                    RuntimeError::execution(format!(
                        "kernel {} argument {idx} has no storage (size {})",
                        self.name,
                        buf.size()
                    ))
                })
            })
            .collect::<RuntimeResult<Vec<&RawBuffer>>>()?;
        let vars = self.bind_vars(var_vals)?;

        let elapsed = self.program.invoke(&raws, &vars, wait)?;
        if let Some(elapsed) = elapsed {
            profiling::record_backend("kernel_exec", elapsed);
            tracing::debug!(
                device = %self.device,
                kernel = %self.name,
                elapsed_us = elapsed.as_micros() as u64,
                "kernel finished"
            );
        }
        Ok(elapsed)
    }
}

impl fmt::Debug for CompiledRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRunner")
            .field("device", &self.device)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}
