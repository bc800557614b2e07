//! Recurrent sequence classifier.
//!
//! RnnClassifier = Embedding → Rnn → LastTimeStep → Linear(classes)

use kiln_core::{Result, Tensor};
use kiln_nn::module::prefixed;
use kiln_nn::{CellKind, Embedding, LastTimeStep, Linear, Module, Rnn};

/// Classifies whole token sequences from the final hidden state.
pub struct RnnClassifier {
    embedding: Embedding,
    rnn: Rnn,
    last_step: LastTimeStep,
    head: Linear,
}

impl RnnClassifier {
    /// Single-layer, unidirectional tanh RNN.
    pub fn new(vocab_size: usize, embedding_dim: usize, hidden_size: usize, num_classes: usize) -> Result<Self> {
        Self::with_cell(vocab_size, embedding_dim, hidden_size, num_classes, CellKind::Tanh, 1, false)
    }

    pub fn with_cell(
        vocab_size: usize,
        embedding_dim: usize,
        hidden_size: usize,
        num_classes: usize,
        cell: CellKind,
        num_layers: usize,
        bidirectional: bool,
    ) -> Result<Self> {
        let rnn = Rnn::new(cell, embedding_dim, hidden_size, num_layers, bidirectional)?;
        let features = hidden_size * rnn.directions();
        Ok(Self {
            embedding: Embedding::new(vocab_size, embedding_dim),
            rnn,
            last_step: LastTimeStep::new(num_layers, bidirectional),
            head: Linear::new(features, num_classes, true),
        })
    }

    pub fn rnn(&self) -> &Rnn {
        &self.rnn
    }
}

impl Module for RnnClassifier {
    /// `[B, T]` ids → `[B, classes]` logits.
    fn forward(&self, idx: &Tensor) -> Result<Tensor> {
        let embedded = self.embedding.forward(idx)?;
        let state = self.rnn.run(&embedded)?.state;
        self.head.forward(&self.last_step.apply(&state)?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("embedding", self.embedding.named_parameters());
        params.extend(prefixed("rnn", self.rnn.named_parameters()));
        params.extend(prefixed("head", self.head.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.embedding.parameters_mut();
        params.extend(self.rnn.parameters_mut());
        params.extend(self.head.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_shapes() {
        let idx = Tensor::from_ids(&[1, 2, 3, 4, 0, 1, 2, 3], &[2, 4]).unwrap();
        let simple = RnnClassifier::new(5, 4, 6, 3).unwrap();
        assert_eq!(simple.forward(&idx).unwrap().dims(), &[2, 3]);

        let lstm = RnnClassifier::with_cell(5, 4, 6, 3, CellKind::Lstm, 2, true).unwrap();
        assert_eq!(lstm.rnn().directions(), 2);
        assert_eq!(lstm.forward(&idx).unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn test_classifier_trains_end_to_end() {
        let model = RnnClassifier::new(5, 4, 6, 3).unwrap();
        let idx = Tensor::from_ids(&[1, 2, 3, 4], &[1, 4]).unwrap();
        let targets = Tensor::from_ids(&[2], &[1]).unwrap();
        model.forward(&idx).unwrap().cross_entropy(&targets).unwrap().backward().unwrap();
        assert!(model.named_parameters().iter().all(|(_, p)| p.grad().is_some()));
    }
}
