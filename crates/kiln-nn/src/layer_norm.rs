//! Layer Normalization.
//!
//! Normalizes across the last dimension: y = (x - mean) / sqrt(var + eps) * weight + bias

use kiln_core::{Result, Tensor};

use crate::module::Module;

pub const DEFAULT_EPS: f32 = 1e-5;

/// Layer Normalization over the last dimension with an optional bias.
///
/// Without a bias the parameter does not exist at all: it is absent from
/// `parameters()` and from the state dict.
pub struct LayerNorm {
    eps: f32,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Scale initialised to ones, bias (when enabled) to zeros, eps `1e-5`.
    pub fn new(normalized_shape: usize, bias: bool) -> Self {
        Self::with_eps(normalized_shape, bias, DEFAULT_EPS)
    }

    pub fn with_eps(normalized_shape: usize, bias: bool, eps: f32) -> Self {
        let mut weight = Tensor::ones(&[normalized_shape]);
        weight.set_requires_grad(true);
        let bias = bias.then(|| {
            let mut b = Tensor::zeros(&[normalized_shape]);
            b.set_requires_grad(true);
            b
        });
        Self { eps, weight, bias }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn normalized_shape(&self) -> usize {
        self.weight.numel()
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        input.layer_norm(&self.weight, self.bias.as_ref(), self.eps)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(ref b) = self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = vec![&mut self.weight];
        if let Some(ref mut b) = self.bias {
            params.push(b);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bias_absent_when_disabled() {
        let ln = LayerNorm::new(8, false);
        assert!(ln.bias().is_none());
        assert_eq!(ln.parameters().len(), 1);
        assert!(!ln.state_dict().contains_key("bias"));

        let ln = LayerNorm::new(8, true);
        assert_eq!(ln.parameters().len(), 2);
        assert!(ln.state_dict().contains_key("bias"));
    }

    #[test]
    fn test_no_bias_equals_zero_bias() {
        let x = Tensor::randn(&[2, 3, 8], 1.0);
        let with_bias = LayerNorm::new(8, true).forward(&x).unwrap();
        let without = LayerNorm::new(8, false).forward(&x).unwrap();
        for (a, b) in with_bias.as_slice().iter().zip(without.as_slice()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_wrong_width_is_error() {
        let ln = LayerNorm::new(4, true);
        assert!(ln.forward(&Tensor::ones(&[2, 5])).is_err());
    }
}
