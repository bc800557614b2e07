//! Tensor operations: arithmetic, reduction, manipulation, activations and
//! fused neural-network primitives.
//!
//! All operations return new tensors (functional style). Each differentiable
//! op records its backward rule through [`crate::autograd::record`].

pub mod arithmetic;
pub mod reduction;
pub mod manipulation;
pub mod activation;
pub mod nn;

/// Element count above which kernels fan out over rayon.
pub(crate) const PAR_THRESHOLD: usize = 8192;
