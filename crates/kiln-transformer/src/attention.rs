//! Causal self-attention: single heads and the multi-head wrapper.
//!
//! Scores are `q @ kᵀ / √head_size`, future positions are filled with
//! `-inf` before the row softmax, so their weight is exactly zero.

use kiln_core::{KilnError, Result, Tensor};
use kiln_nn::module::prefixed;
use kiln_nn::{Dropout, Linear, Module};

use crate::config::ModelConfig;

/// Strictly-upper-triangular mask built once for the full context window.
///
/// Non-zero entries mark the positions a query may not attend to. Shorter
/// sequences use the leading `T×T` block.
#[derive(Debug, Clone)]
pub struct CausalMask {
    mask: Tensor,
    size: usize,
}

impl CausalMask {
    pub fn new(size: usize) -> Self {
        let mut data = vec![0.0f32; size * size];
        for i in 0..size {
            for j in (i + 1)..size {
                data[i * size + j] = 1.0;
            }
        }
        Self { mask: Tensor::from_f32(&data, &[size, size]), size }
    }

    /// Largest sequence length the mask covers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The active `[T, T]` block.
    pub fn slice(&self, len: usize) -> Result<Tensor> {
        if len > self.size {
            return Err(KilnError::ContextOverflow { len, max: self.size });
        }
        if len == self.size {
            return Ok(self.mask.clone());
        }
        self.mask.narrow(0, 0, len)?.narrow(1, 0, len)
    }

    /// Fill masked entries of `[.., T, T]` scores with `-inf`.
    pub fn apply(&self, scores: &Tensor) -> Result<Tensor> {
        let len = scores.shape().last_dim();
        scores.masked_fill(&self.slice(len)?, f32::NEG_INFINITY)
    }
}

/// One head of causal self-attention: `[B, T, D]` → `[B, T, head_size]`.
pub struct AttentionHead {
    key: Linear,
    query: Linear,
    value: Linear,
    mask: CausalMask,
    dropout: Dropout,
    head_size: usize,
}

impl AttentionHead {
    pub fn new(embedding_dim: usize, head_size: usize, context_window: usize, dropout: f32) -> Result<Self> {
        if head_size == 0 {
            return Err(KilnError::InvalidConfig("head_size must be > 0".into()));
        }
        Ok(Self {
            key: Linear::new(embedding_dim, head_size, false),
            query: Linear::new(embedding_dim, head_size, false),
            value: Linear::new(embedding_dim, head_size, false),
            mask: CausalMask::new(context_window),
            dropout: Dropout::new(dropout)?,
            head_size,
        })
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// Post-softmax, pre-dropout weights, `[B, T, T]`.
    ///
    /// Row `i` sums to one and is zero beyond column `i`.
    pub fn attention_weights(&self, x: &Tensor) -> Result<Tensor> {
        if x.ndim() < 2 {
            return Err(KilnError::ShapeMismatch { expected: vec![0, 0, self.key.in_features()], got: x.dims().to_vec() });
        }
        let len = x.dims()[x.ndim() - 2];
        if len > self.mask.size() {
            return Err(KilnError::ContextOverflow { len, max: self.mask.size() });
        }

        let k = self.key.forward(x)?;
        let q = self.query.forward(x)?;
        let scores = q.matmul(&k.transpose(-2, -1)?)?.mul_scalar((self.head_size as f32).powf(-0.5))?;
        self.mask.apply(&scores)?.softmax()
    }
}

impl Module for AttentionHead {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weights = self.dropout.forward(&self.attention_weights(x)?)?;
        weights.matmul(&self.value.forward(x)?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("key", self.key.named_parameters());
        params.extend(prefixed("query", self.query.named_parameters()));
        params.extend(prefixed("value", self.value.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.key.parameters_mut();
        params.extend(self.query.parameters_mut());
        params.extend(self.value.parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

/// `H` heads of width `D / H`, concatenated back to `D`, projected and dropped out.
pub struct MultiHeadAttention {
    heads: Vec<AttentionHead>,
    proj: Linear,
    dropout: Dropout,
}

impl MultiHeadAttention {
    /// Fails unless `head_count` divides `embedding_dim`.
    pub fn new(embedding_dim: usize, head_count: usize, context_window: usize, dropout: f32) -> Result<Self> {
        if head_count == 0 || embedding_dim % head_count != 0 {
            return Err(KilnError::InvalidConfig(format!(
                "embedding_dim {embedding_dim} is not divisible by head_count {head_count}"
            )));
        }
        let head_size = embedding_dim / head_count;
        let heads = (0..head_count)
            .map(|_| AttentionHead::new(embedding_dim, head_size, context_window, dropout))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { heads, proj: Linear::new(embedding_dim, embedding_dim, true), dropout: Dropout::new(dropout)? })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        Self::new(config.embedding_dim, config.head_count, config.context_window, config.dropout)
    }

    pub fn heads(&self) -> &[AttentionHead] {
        &self.heads
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let outputs = self.heads.iter().map(|h| h.forward(x)).collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = outputs.iter().collect();
        let out = self.proj.forward(&Tensor::cat(&refs, -1)?)?;
        self.dropout.forward(&out)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = Vec::new();
        for (i, head) in self.heads.iter().enumerate() {
            params.extend(prefixed(&format!("heads.{i}"), head.named_parameters()));
        }
        params.extend(prefixed("proj", self.proj.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params: Vec<&mut Tensor> = self.heads.iter_mut().flat_map(|h| h.parameters_mut()).collect();
        params.extend(self.proj.parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        for head in &mut self.heads {
            head.train(mode);
        }
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}
