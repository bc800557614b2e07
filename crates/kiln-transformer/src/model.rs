//! Decoder stacks.
//!
//! DecoderStack = TokenEmb + PosEmb → (Dropout) → N × TransformerBlock → (LayerNorm) → Linear(vocab)

use kiln_core::{KilnError, Result, Tensor};
use kiln_nn::module::prefixed;
use kiln_nn::{Dropout, Embedding, LayerNorm, Linear, Module};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{BlockArrangement, TransformerBlock};
use crate::config::ModelConfig;

/// Which decoder layout to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderVariant {
    /// Pre-norm blocks, no input dropout, no final norm.
    Simple,
    /// Post-norm blocks, no input dropout, no final norm.
    Gpt1,
    /// Bias-optional pre-norm blocks, input dropout and a final norm.
    Gpt2,
}

impl DecoderVariant {
    pub fn arrangement(self) -> BlockArrangement {
        match self {
            DecoderVariant::Simple => BlockArrangement::PreNorm,
            DecoderVariant::Gpt1 => BlockArrangement::PostNorm,
            DecoderVariant::Gpt2 => BlockArrangement::PreNormOptionalBias,
        }
    }

    pub fn has_input_dropout(self) -> bool {
        matches!(self, DecoderVariant::Gpt2)
    }

    pub fn has_final_norm(self) -> bool {
        matches!(self, DecoderVariant::Gpt2)
    }
}

/// Token and position embeddings, a stack of blocks, and a vocabulary head.
pub struct DecoderStack {
    config: ModelConfig,
    variant: DecoderVariant,
    token_embedding: Embedding,
    position_embedding: Embedding,
    input_dropout: Option<Dropout>,
    blocks: Vec<TransformerBlock>,
    final_norm: Option<LayerNorm>,
    lm_head: Linear,
}

impl DecoderStack {
    /// Build every sub-layer eagerly. The config is validated first.
    pub fn new(config: &ModelConfig, variant: DecoderVariant) -> Result<Self> {
        config.validate()?;
        let arrangement = variant.arrangement();
        let blocks = (0..config.layer_count)
            .map(|_| TransformerBlock::new(config, arrangement))
            .collect::<Result<Vec<_>>>()?;
        let input_dropout = if variant.has_input_dropout() { Some(Dropout::new(config.dropout)?) } else { None };
        let final_norm = variant.has_final_norm().then(|| LayerNorm::new(config.embedding_dim, config.bias));

        let model = Self {
            config: config.clone(),
            variant,
            token_embedding: Embedding::new(config.vocab_size, config.embedding_dim),
            position_embedding: Embedding::new(config.context_window, config.embedding_dim),
            input_dropout,
            blocks,
            final_norm,
            lm_head: Linear::new(config.embedding_dim, config.vocab_size, true),
        };
        debug!(variant = ?variant, parameters = model.num_parameters(), "built decoder stack");
        Ok(model)
    }

    pub fn simple(config: &ModelConfig) -> Result<Self> {
        Self::new(config, DecoderVariant::Simple)
    }

    pub fn gpt1(config: &ModelConfig) -> Result<Self> {
        Self::new(config, DecoderVariant::Gpt1)
    }

    pub fn gpt2(config: &ModelConfig) -> Result<Self> {
        Self::new(config, DecoderVariant::Gpt2)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn variant(&self) -> DecoderVariant {
        self.variant
    }

    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.blocks
    }
}

impl Module for DecoderStack {
    /// `[B, T]` ids → `[B, T, vocab]` logits, `T ≤ context_window`.
    fn forward(&self, idx: &Tensor) -> Result<Tensor> {
        if idx.ndim() == 0 {
            return Err(KilnError::ShapeMismatch { expected: vec![0, 0], got: Vec::new() });
        }
        let len = idx.shape().last_dim();
        if len > self.config.context_window {
            return Err(KilnError::ContextOverflow { len, max: self.config.context_window });
        }

        let tokens = self.token_embedding.forward(idx)?;
        let positions = self.position_embedding.forward(&Tensor::arange(len))?;
        let mut x = tokens.add(&positions)?;
        if let Some(dropout) = &self.input_dropout {
            x = dropout.forward(&x)?;
        }
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        if let Some(norm) = &self.final_norm {
            x = norm.forward(&x)?;
        }
        self.lm_head.forward(&x)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("token_embedding", self.token_embedding.named_parameters());
        params.extend(prefixed("position_embedding", self.position_embedding.named_parameters()));
        for (i, block) in self.blocks.iter().enumerate() {
            params.extend(prefixed(&format!("blocks.{i}"), block.named_parameters()));
        }
        if let Some(norm) = &self.final_norm {
            params.extend(prefixed("final_norm", norm.named_parameters()));
        }
        params.extend(prefixed("lm_head", self.lm_head.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.token_embedding.parameters_mut();
        params.extend(self.position_embedding.parameters_mut());
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        if let Some(norm) = &mut self.final_norm {
            params.extend(norm.parameters_mut());
        }
        params.extend(self.lm_head.parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        if let Some(dropout) = &mut self.input_dropout {
            dropout.train(mode);
        }
        for block in &mut self.blocks {
            block.train(mode);
        }
    }

    fn is_training(&self) -> bool {
        self.blocks.first().map_or(true, |b| b.is_training())
    }
}
