//! Position-wise feed-forward network.
//!
//! FFN(x) = Dropout(Linear(4D → D)(act(Linear(D → 4D)(x))))

use kiln_core::{Result, Tensor};
use kiln_nn::module::prefixed;
use kiln_nn::{Activation, Dropout, Linear, Module};

/// Hidden width relative to the model width.
pub const EXPANSION: usize = 4;

pub struct FeedForward {
    expand: Linear,
    activation: Activation,
    project: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(embedding_dim: usize, activation: Activation, dropout: f32) -> Result<Self> {
        let hidden = EXPANSION * embedding_dim;
        Ok(Self {
            expand: Linear::new(embedding_dim, hidden, true),
            activation,
            project: Linear::new(hidden, embedding_dim, true),
            dropout: Dropout::new(dropout)?,
        })
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.activation.forward(&self.expand.forward(x)?)?;
        self.dropout.forward(&self.project.forward(&hidden)?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("expand", self.expand.named_parameters());
        params.extend(prefixed("project", self.project.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.expand.parameters_mut();
        params.extend(self.project.parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffn_shape() {
        let ffn = FeedForward::new(16, Activation::Relu, 0.0).unwrap();
        let out = ffn.forward(&Tensor::randn(&[2, 5, 16], 1.0)).unwrap();
        assert_eq!(out.dims(), &[2, 5, 16]);
        // 16·64 + 64 + 64·16 + 16
        assert_eq!(ffn.num_parameters(), 2128);
    }

    #[test]
    fn test_ffn_is_position_wise() {
        let ffn = FeedForward::new(4, Activation::Gelu, 0.0).unwrap();
        let x = Tensor::randn(&[1, 3, 4], 1.0);
        let full = ffn.forward(&x).unwrap();
        let last = ffn.forward(&x.narrow(1, 2, 1).unwrap()).unwrap();
        for (a, b) in full.as_slice()[8..].iter().zip(last.as_slice()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ffn_dropout_only_in_training() {
        let mut ffn = FeedForward::new(8, Activation::Relu, 0.5).unwrap();
        ffn.train(false);
        let x = Tensor::randn(&[4, 8], 1.0);
        assert_eq!(ffn.forward(&x).unwrap().as_slice(), ffn.forward(&x).unwrap().as_slice());
        assert!(!ffn.is_training());
    }
}
