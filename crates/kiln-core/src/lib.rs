//! # kiln-core
//!
//! Core tensor engine for the kiln language-model toolkit.
//!
//! Provides the foundational `Tensor` type with:
//! - Contiguous row-major f32 storage shared through `Arc` (copy-on-write)
//! - Broadcasting element-wise ops, batched matmul, shape manipulation
//! - Tape-based reverse-mode autograd (`GradFn`, `GradNode`, `NoGradGuard`)
//! - Fused neural-network primitives: embedding gather, layer norm, softmax,
//!   cross-entropy

pub mod device;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod autograd;
pub mod ops;
pub mod error;
pub mod prelude;

pub use device::Device;
pub use storage::Storage;
pub use shape::Shape;
pub use tensor::Tensor;
pub use error::KilnError;

pub type Result<T> = std::result::Result<T, KilnError>;
