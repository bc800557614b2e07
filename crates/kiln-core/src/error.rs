use thiserror::Error;

use crate::device::Device;

/// Errors raised by tensor ops, layer construction and persistence.
///
/// Everything except `Io` and `Serialization` signals a programming or
/// configuration mistake (bad shapes, bad ids, bad hyper-parameters) and is
/// not meant to be retried.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("matmul dimension mismatch: [{m}, {k1}] @ [{k2}, {n}]")]
    MatmulDimMismatch { m: usize, k1: usize, k2: usize, n: usize },

    #[error("axis {axis} out of range for {ndim}-d tensor")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("index {index} out of range for size {size}")]
    IndexOutOfRange { index: f32, size: usize },

    #[error("sequence length {len} exceeds context window {max}")]
    ContextOverflow { len: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device {0} is not supported by this build")]
    UnsupportedDevice(Device),

    #[error("autograd: {0}")]
    Autograd(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
