use std::ffi::{c_void, CString};
use std::sync::Arc;
use std::time::Duration;

use lazyrt::device::{downcast_raw, KernelSignature, Program, RawBuffer};
use lazyrt::{RuntimeError, RuntimeResult};

use crate::allocator::CudaAllocation;
use crate::context::{CudaContext, CudaModule};

/// A kernel resolved from a loaded module, with its launch geometry fixed at load time.
pub struct CudaProgram {
    name: String,
    // Unloaded before the context it lives in.
    _module: CudaModule,
    context: Arc<CudaContext>,
    function: usize,
    grid: [u32; 3],
    block: [u32; 3],
    buffers: usize,
    vars: usize,
}

impl CudaProgram {
    /// Loads `image`, resolves `name`, and checks the launch block against the kernel's
    /// hardware-reported thread limit.
    pub fn load(
        context: Arc<CudaContext>,
        name: &str,
        image: &[u8],
        signature: &KernelSignature,
    ) -> RuntimeResult<Self> {
        let module = context.load_module(image)?;
        let symbol = CString::new(name)
            .map_err(|_| RuntimeError::execution("kernel symbol contains NUL byte"))?;
        let function = context.function(&module, &symbol)?;

        let max = context.max_threads_per_block(function)?;
        let requested = signature.local_threads();
        if requested > max {
            return Err(RuntimeError::HardwareLimit { requested, max });
        }

        Ok(Self {
            name: name.to_string(),
            _module: module,
            context,
            function,
            grid: launch_dims(signature.global_size)?,
            block: launch_dims(signature.local_size)?,
            buffers: signature.buffers,
            vars: signature.vars.len(),
        })
    }
}

impl Program for CudaProgram {
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
                "CUDA kernel {} takes {} buffers and {} vars, got {} and {}",
                self.name,
                self.buffers,
                self.vars,
                bufs.len(),
                vars.len()
            )));
        }

        let mut ptrs = bufs
            .iter()
            .map(|raw| downcast_raw::<CudaAllocation>(raw, "CUDA").map(CudaAllocation::device_ptr))
            .collect::<RuntimeResult<Vec<u64>>>()?;
        let mut scalars = vars.to_vec();
        let mut params: Vec<*mut c_void> = ptrs
            .iter_mut()
            .map(|ptr| (ptr as *mut u64).cast::<c_void>())
            .chain(scalars.iter_mut().map(|value| (value as *mut i32).cast::<c_void>()))
            .collect();

        self.context
            .launch(self.function, self.grid, self.block, &mut params, wait)
    }
}

fn launch_dims(size: Option<[usize; 3]>) -> RuntimeResult<[u32; 3]> {
    let size = size.unwrap_or([1, 1, 1]);
    let mut out = [1u32; 3];
    for (dst, extent) in out.iter_mut().zip(size) {
        *dst = u32::try_from(extent.max(1)).map_err(|_| RuntimeError::HardwareLimit {
            requested: extent,
            max: u32::MAX as usize,
        })?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_dims_default_to_one() {
        assert_eq!(launch_dims(None).expect("dims"), [1, 1, 1]);
        assert_eq!(launch_dims(Some([4, 0, 2])).expect("dims"), [4, 1, 2]);
    }

    #[test]
    fn oversized_grid_is_a_hardware_limit() {
        let err = launch_dims(Some([usize::MAX, 1, 1])).expect_err("too large");
        assert!(matches!(err, RuntimeError::HardwareLimit { .. }));
    }
}
