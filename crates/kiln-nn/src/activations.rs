//! Activation functions as modules.

use kiln_core::{Result, Tensor};

use crate::module::Module;

/// Parameter-free element-wise non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    /// Tanh approximation.
    Gelu,
    Tanh,
}

impl Module for Activation {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => input.relu(),
            Activation::Gelu => input.gelu(),
            Activation::Tanh => input.tanh(),
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }
}
