//! # kiln-optim
//!
//! Optimizers for kiln.

pub mod optimizer;
pub mod sgd;

pub use optimizer::{Optimizer, OptimizerKind};
pub use sgd::SGD;
