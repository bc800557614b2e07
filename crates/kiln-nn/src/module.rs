use std::collections::HashMap;

use kiln_core::{Result, Tensor};

/// Base trait for all neural network modules.
///
/// `named_parameters` and `parameters_mut` must list parameters in the same
/// order; persistence and the optimizer step both rely on it.
pub trait Module: Send + Sync {
    /// Forward pass.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Named trainable parameters, dotted paths for nested modules.
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable access to every trainable parameter, for in-place updates.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor>;

    /// Get all trainable parameters.
    fn parameters(&self) -> Vec<&Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    /// Set training/eval mode.
    fn train(&mut self, _mode: bool) {}

    /// Whether the module is in training mode.
    fn is_training(&self) -> bool {
        true
    }

    /// Export state dictionary.
    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.detach()))
            .collect()
    }

    /// Total trainable element count.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }
}

impl<M: Module + ?Sized> Module for Box<M> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        (**self).forward(input)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        (**self).named_parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        (**self).parameters_mut()
    }

    fn train(&mut self, mode: bool) {
        (**self).train(mode)
    }

    fn is_training(&self) -> bool {
        (**self).is_training()
    }
}

/// Prefix a child's parameter names with `prefix.`.
pub fn prefixed<'a>(prefix: &str, params: Vec<(String, &'a Tensor)>) -> Vec<(String, &'a Tensor)> {
    params.into_iter().map(|(name, t)| (format!("{prefix}.{name}"), t)).collect()
}
