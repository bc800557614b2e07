//! Bigram baseline: each token id indexes a row of next-token logits.

use kiln_core::{Result, Tensor};
use kiln_nn::module::prefixed;
use kiln_nn::{Embedding, Module};

pub struct BigramLanguageModel {
    token_embedding: Embedding,
}

impl BigramLanguageModel {
    pub fn new(vocab_size: usize) -> Self {
        Self { token_embedding: Embedding::new(vocab_size, vocab_size) }
    }

    pub fn vocab_size(&self) -> usize {
        self.token_embedding.num_embeddings()
    }
}

impl Module for BigramLanguageModel {
    /// `[B, T]` → `[B, T, vocab]`. No length limit.
    fn forward(&self, idx: &Tensor) -> Result<Tensor> {
        self.token_embedding.forward(idx)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        prefixed("token_embedding", self.token_embedding.named_parameters())
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.token_embedding.parameters_mut()
    }
}
