pub use linkme;

pub mod config;
pub mod device;
mod env;
pub mod error;
pub mod hashing;
pub mod lazy;
pub mod logging;
pub mod ops;
pub mod profiling;
pub mod realize;
pub mod shape;
pub mod tensor;

pub use config::RuntimeConfig;
pub use device::{Buffer, Device, DeviceRegistry};
pub use error::{ContractViolation, RuntimeError, RuntimeResult};
pub use lazy::{BufferOrigin, LazyBuffer, ScheduleItem};
pub use ops::{LazyOp, LoadOp, Op};
pub use realize::{run_schedule, ScheduleExecutor};
pub use shape::{Dim, Variable, View};
pub use tensor::DType;
