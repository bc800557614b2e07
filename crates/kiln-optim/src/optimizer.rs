use kiln_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::sgd::SGD;

/// Gradient-based parameter update.
pub trait Optimizer: Send {
    /// Update `params` in place from the matching `grads`.
    ///
    /// `params` and `grads` correspond 1:1; a `None` gradient leaves its
    /// parameter untouched.
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Option<Tensor>]) -> Result<()>;

    fn lr(&self) -> f32;
}

/// Which optimizer a training run builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Plain fixed-rate SGD.
    #[default]
    Sgd,
}

impl OptimizerKind {
    pub fn build(self, lr: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Sgd => Box::new(SGD::new(lr)),
        }
    }
}
