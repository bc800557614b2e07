//! Transformer decoder block with configurable norm placement.
//!
//! One block type covers all three decoder variants; the
//! [`BlockArrangement`] decides where the norms sit relative to the
//! residual sums.

use kiln_core::{Result, Tensor};
use kiln_nn::module::prefixed;
use kiln_nn::{Activation, LayerNorm, Module};
use serde::{Deserialize, Serialize};

use crate::attention::MultiHeadAttention;
use crate::config::ModelConfig;
use crate::feed_forward::FeedForward;

/// Residual and normalization ordering inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockArrangement {
    /// `x = x + attn(ln1(x)); x = x + ffwd(ln2(x))`, biased norms, ReLU.
    PreNorm,
    /// `x = ln1(attn(x) + x); x = ln2(ffwd(x) + x)`, biased norms, ReLU.
    PostNorm,
    /// Pre-norm layout with `config.bias` deciding the norm bias, GELU.
    PreNormOptionalBias,
}

impl BlockArrangement {
    pub fn activation(self) -> Activation {
        match self {
            BlockArrangement::PreNorm | BlockArrangement::PostNorm => Activation::Relu,
            BlockArrangement::PreNormOptionalBias => Activation::Gelu,
        }
    }

    /// Whether the block norms carry a bias under `config_bias`.
    pub fn norm_bias(self, config_bias: bool) -> bool {
        match self {
            BlockArrangement::PreNormOptionalBias => config_bias,
            _ => true,
        }
    }

    pub fn is_pre_norm(self) -> bool {
        !matches!(self, BlockArrangement::PostNorm)
    }
}

/// Attention followed by feed-forward, each wrapped in a residual.
pub struct TransformerBlock {
    arrangement: BlockArrangement,
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
    ln1: LayerNorm,
    ln2: LayerNorm,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig, arrangement: BlockArrangement) -> Result<Self> {
        let bias = arrangement.norm_bias(config.bias);
        Ok(Self {
            arrangement,
            attention: MultiHeadAttention::from_config(config)?,
            feed_forward: FeedForward::new(config.embedding_dim, arrangement.activation(), config.dropout)?,
            ln1: LayerNorm::new(config.embedding_dim, bias),
            ln2: LayerNorm::new(config.embedding_dim, bias),
        })
    }

    pub fn arrangement(&self) -> BlockArrangement {
        self.arrangement
    }

    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attention
    }

    pub fn feed_forward(&self) -> &FeedForward {
        &self.feed_forward
    }

    pub fn norms(&self) -> (&LayerNorm, &LayerNorm) {
        (&self.ln1, &self.ln2)
    }
}

impl Module for TransformerBlock {
    /// `[B, T, D]` → `[B, T, D]`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.arrangement.is_pre_norm() {
            let x = x.add(&self.attention.forward(&self.ln1.forward(x)?)?)?;
            x.add(&self.feed_forward.forward(&self.ln2.forward(&x)?)?)
        } else {
            let x = self.ln1.forward(&self.attention.forward(x)?.add(x)?)?;
            self.ln2.forward(&self.feed_forward.forward(&x)?.add(&x)?)
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("attention", self.attention.named_parameters());
        params.extend(prefixed("feed_forward", self.feed_forward.named_parameters()));
        params.extend(prefixed("ln1", self.ln1.named_parameters()));
        params.extend(prefixed("ln2", self.ln2.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.attention.parameters_mut();
        params.extend(self.feed_forward.parameters_mut());
        params.extend(self.ln1.parameters_mut());
        params.extend(self.ln2.parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        self.attention.train(mode);
        self.feed_forward.train(mode);
    }

    fn is_training(&self) -> bool {
        self.attention.is_training()
    }
}
