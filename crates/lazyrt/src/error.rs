//! Error taxonomy shared by the executor, devices and allocators.

use thiserror::Error;

use crate::tensor::DType;

/// Programming-contract violations detected while realizing a schedule.
///
/// These point at a bug in the scheduler that produced the items (or in a backend); the
/// executor stops at the first one and never tries to salvage partial results.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("can't run schedule, input {index} is not realized")]
    UnrealizedInput { index: usize },
    #[error("all devices must be the same, output on {output} but input {index} on {input}")]
    DeviceMismatch {
        output: String,
        index: usize,
        input: String,
    },
    #[error("bad load op src {index}: {reason}")]
    MalformedLoadOp { index: usize, reason: String },
    #[error("realized dtype is incorrect, {realized:?} != {expected:?}")]
    DTypeMismatch { realized: DType, expected: DType },
    #[error("node on {device} was already realized")]
    AlreadyRealized { device: String },
}

/// Runtime error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
    #[error("{device} out of memory while allocating size={size} dtype={dtype:?}")]
    OutOfMemory {
        device: String,
        size: usize,
        dtype: DType,
    },
    #[error("{compiler} compile failed: {message}")]
    Compile {
        compiler: String,
        message: String,
        source_text: String,
    },
    #[error("local size {requested} bigger than hardware maximum {max}")]
    HardwareLimit { requested: usize, max: usize },
    #[error("size mismatch on {context}: expected {expected}, got {actual}")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("{backend} backend unavailable: {reason}")]
    Unavailable { backend: String, reason: String },
    #[error("execution failure: {message}")]
    Execution { message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn execution(message: impl Into<String>) -> Self {
        RuntimeError::Execution {
            message: message.into(),
        }
    }

    pub fn compile(
        compiler: impl Into<String>,
        message: impl Into<String>,
        source_text: impl Into<String>,
    ) -> Self {
        RuntimeError::Compile {
            compiler: compiler.into(),
            message: message.into(),
            source_text: source_text.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Returns the contract violation when this error is one.
    pub fn as_contract(&self) -> Option<&ContractViolation> {
        match self {
            RuntimeError::Contract(violation) => Some(violation),
            _ => None,
        }
    }
}

/// Convenience alias for results returned by runtime routines.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
