//! Convenience re-exports for common kiln-core types.
//!
//! ```rust
//! use kiln_core::prelude::*;
//! ```

pub use crate::autograd::NoGradGuard;
pub use crate::Device;
pub use crate::KilnError;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
