use std::ffi::c_void;
use std::time::{Duration, Instant};

use lazyrt::device::{downcast_raw, HostAllocation, Program, RawBuffer};
use lazyrt::{RuntimeError, RuntimeResult};

use crate::engine::NativeFunction;

/// Fixed-arity native kernel: `buffers` host pointers followed by `vars` integers.
pub struct NativeProgram {
    name: String,
    buffers: usize,
    vars: usize,
    function: NativeFunction,
}

impl NativeProgram {
    pub fn new(name: impl Into<String>, buffers: usize, vars: usize, function: NativeFunction) -> Self {
        Self {
            name: name.into(),
            buffers,
            vars,
            function,
        }
    }
}

impl Program for NativeProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        bufs: &[&RawBuffer],
        vars: &[i32],
        wait: bool,
    ) -> RuntimeResult<Option<Duration>> {
        if bufs.len() != self.buffers || vars.len() != self.vars {
            return Err(RuntimeError::execution(format!(
                "native kernel {} takes {} buffers and {} vars, got {} and {}",
                self.name,
                self.buffers,
                self.vars,
                bufs.len(),
                vars.len()
            )));
        }

        let mut ptrs = bufs
            .iter()
            .map(|raw| {
                downcast_raw::<HostAllocation>(raw, "CLANG")
                    .map(|block| block.as_mut_ptr().cast::<c_void>())
            })
            .collect::<RuntimeResult<Vec<_>>>()?;

        let start = wait.then(Instant::now);
        // SAFETY: every pointer comes from a live host allocation sized by the executor for
        // the kernel's buffer, and the arity matches the rendered signature.
        let status = unsafe { self.function.call(&mut ptrs, vars) };
        if status != 0 {
            return Err(RuntimeError::execution(format!(
                "native kernel {} returned {status}",
                self.name
            )));
        }
        Ok(start.map(|start| start.elapsed()))
    }
}
