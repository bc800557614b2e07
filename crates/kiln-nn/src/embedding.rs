//! Embedding layer: lookup table from token ids to dense vectors.

use kiln_core::{Result, Tensor};

use crate::module::Module;

/// Maps integral token ids to rows of a `[num_embeddings, embedding_dim]` table.
pub struct Embedding {
    weight: Tensor,
}

impl Embedding {
    /// Table drawn from N(0, 1).
    pub fn new(num_embeddings: usize, embedding_dim: usize) -> Self {
        let mut weight = Tensor::randn(&[num_embeddings, embedding_dim], 1.0);
        weight.set_requires_grad(true);
        Self { weight }
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for Embedding {
    /// `[..]` ids → `[.., embedding_dim]`. Fails on ids outside the table.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Tensor::embedding(&self.weight, input)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".to_string(), &self.weight)]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight]
    }
}
