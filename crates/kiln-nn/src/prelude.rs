//! Convenience re-exports for common kiln-nn types.
//!
//! ```rust
//! use kiln_nn::prelude::*;
//! ```

pub use crate::Module;
pub use crate::{Activation, Dropout, Embedding, LayerNorm, Linear};
pub use crate::{CellKind, LastTimeStep, Rnn};
pub use crate::{cross_entropy_language_model, cross_entropy_loss};
pub use crate::{MetricTable, Trainer, TrainingConfig};
