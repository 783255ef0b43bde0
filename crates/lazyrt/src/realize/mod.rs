//! Schedule executor: realizes each schedule item into device memory, in order.

mod load_ops;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::device::{Buffer, DeviceRegistry};
use crate::error::{ContractViolation, RuntimeError, RuntimeResult};
use crate::lazy::{BufferOrigin, ScheduleItem};
use crate::ops::{LoadOp, Op};

/// Runs every item of `schedule` with default executor options.
pub fn run_schedule(
    registry: &DeviceRegistry,
    schedule: &mut VecDeque<ScheduleItem>,
) -> RuntimeResult<()> {
    ScheduleExecutor::new(registry).run(schedule)
}

#[derive(Clone, Copy)]
pub struct ScheduleExecutor<'r> {
    registry: &'r DeviceRegistry,
    log_items: bool,
    wait: bool,
}

impl<'r> ScheduleExecutor<'r> {
    pub fn new(registry: &'r DeviceRegistry) -> Self {
        Self {
            registry,
            log_items: true,
            wait: false,
        }
    }

    /// Per-item debug logging (on by default).
    pub fn log_items(mut self, enabled: bool) -> Self {
        self.log_items = enabled;
        self
    }

    /// Block on every kernel launch and log its elapsed time.
    pub fn wait(mut self, enabled: bool) -> Self {
        self.wait = enabled;
        self
    }

    /// Pops and executes items front to back. Each item is removed before it runs, so
    /// consumed items are dropped while later ones execute. On error the failing item
    /// is discarded and the remaining items stay in `schedule`.
    pub fn run(&self, schedule: &mut VecDeque<ScheduleItem>) -> RuntimeResult<()> {
        while let Some(item) = schedule.pop_front() {
            self.run_item(item)?;
        }
        Ok(())
    }

    fn check_preconditions(&self, item: &ScheduleItem) -> Result<(), ContractViolation> {
        for (index, input) in item.inputs.iter().enumerate() {
            if !input.is_realized() {
                return Err(ContractViolation::UnrealizedInput { index });
            }
        }
        if item.ast.op != Op::Load(LoadOp::From) {
            for (index, input) in item.inputs.iter().enumerate() {
                if input.device() != item.out.device() {
                    return Err(ContractViolation::DeviceMismatch {
                        output: item.out.device().to_string(),
                        index,
                        input: input.device().to_string(),
                    });
                }
            }
        }
        if item.out.is_realized() {
            return Err(ContractViolation::AlreadyRealized {
                device: item.out.device().to_string(),
            });
        }
        Ok(())
    }

    /// Drops the pre-assigned output buffer when an input aliasing it is read through a
    /// non-contiguous view. Only direct argument slots are inspected.
    fn reject_unsafe_alias(&self, item: &ScheduleItem) {
        let Some(assigned) = item.out.output_buffer() else {
            return;
        };
        for (index, input) in item.inputs.iter().enumerate() {
            let aliases = input
                .realized()
                .is_some_and(|buffer| Arc::ptr_eq(buffer, &assigned));
            if !aliases {
                continue;
            }
            if item
                .ast
                .loads_of(index + 1)
                .any(|mem| !mem.view.is_contiguous())
            {
                tracing::debug!(
                    device = item.out.device(),
                    input = index,
                    "output aliases a strided input, allocating fresh buffer"
                );
                item.out.take_output_buffer();
                break;
            }
        }
    }

    fn run_item(&self, item: ScheduleItem) -> RuntimeResult<()> {
        self.check_preconditions(&item)?;
        self.reject_unsafe_alias(&item);

        let device = self.registry.get(item.out.device())?;
        let (buffer, origin) = match item.out.take_output_buffer() {
            Some(buffer) => (buffer, BufferOrigin::Adopted),
            None => {
                let size = item.out.max_size().ok_or_else(|| RuntimeError::OutOfMemory {
                    device: device.name().to_string(),
                    size: usize::MAX,
                    dtype: item.out.dtype(),
                })?;
                (
                    Arc::new(device.alloc(size, item.out.dtype())?),
                    BufferOrigin::Allocated,
                )
            }
        };

        if self.log_items {
            tracing::debug!(
                device = device.name(),
                op = ?item.ast.op,
                size = buffer.size(),
                dtype = ?buffer.dtype(),
                inputs = item.inputs.len(),
                ?origin,
                "realizing schedule item"
            );
        }

        if buffer.size() != 0 {
            let inputs = item
                .inputs
                .iter()
                .enumerate()
                .map(|(index, input)| {
                    input
                        .realized()
                        .map(Arc::as_ref)
                        .ok_or(ContractViolation::UnrealizedInput { index })
                })
                .collect::<Result<Vec<&Buffer>, _>>()?;
            match item.ast.load_op() {
                Some(op) => {
                    load_ops::validate_sources(&item.ast)?;
                    if self.log_items {
                        tracing::debug!(op = op.name(), device = device.name(), "load op");
                    }
                    load_ops::dispatch(op, &item.ast.arg, &buffer, &inputs)?;
                }
                None => {
                    let runner = device.get_runner(&item.ast)?;
                    let mut bufs = Vec::with_capacity(inputs.len() + 1);
                    bufs.push(buffer.as_ref());
                    bufs.extend(inputs);
                    runner.exec(&bufs, &item.var_vals, self.wait)?;
                }
            }
        }

        if buffer.dtype() != item.out.dtype() {
            return Err(ContractViolation::DTypeMismatch {
                realized: buffer.dtype(),
                expected: item.out.dtype(),
            }
            .into());
        }
        item.out.mark_realized(buffer, origin)?;
        Ok(())
    }
}
