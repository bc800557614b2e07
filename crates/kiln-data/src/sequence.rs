//! Next-token windows over a single token stream.

use kiln_core::{KilnError, Result};

use crate::dataloader::{Dataset, Sample};

/// Input/target windows of `context` tokens, the target shifted by one.
///
/// Window `i` starts at `i * stride`; windows running past the end are
/// dropped.
#[derive(Debug, Clone)]
pub struct SequenceDataset {
    tokens: Vec<f32>,
    context: usize,
    stride: usize,
    shape: [usize; 1],
}

impl SequenceDataset {
    /// Non-overlapping windows.
    pub fn from_tokens(tokens: &[usize], context: usize) -> Result<Self> {
        Self::with_stride(tokens, context, context)
    }

    pub fn with_stride(tokens: &[usize], context: usize, stride: usize) -> Result<Self> {
        if context == 0 || stride == 0 {
            return Err(KilnError::InvalidConfig("context and stride must be > 0".into()));
        }
        Ok(Self {
            tokens: tokens.iter().map(|&t| t as f32).collect(),
            context,
            stride,
            shape: [context],
        })
    }

    pub fn context(&self) -> usize {
        self.context
    }
}

impl Dataset for SequenceDataset {
    fn len(&self) -> usize {
        if self.tokens.len() <= self.context {
            return 0;
        }
        (self.tokens.len() - self.context - 1) / self.stride + 1
    }

    fn get(&self, index: usize) -> Sample {
        let start = index * self.stride;
        Sample {
            input: self.tokens[start..start + self.context].to_vec(),
            target: self.tokens[start + 1..start + self.context + 1].to_vec(),
        }
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn target_shape(&self) -> &[usize] {
        &self.shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataLoader;

    #[test]
    fn test_windows_shift_by_one() {
        let tokens: Vec<usize> = (0..10).collect();
        let ds = SequenceDataset::from_tokens(&tokens, 4).unwrap();
        // [0..4]→[1..5], [4..8]→[5..9]
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1).input, vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(ds.get(1).target, vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_overlapping_stride() {
        let tokens: Vec<usize> = (0..6).collect();
        let ds = SequenceDataset::with_stride(&tokens, 3, 1).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.get(2).target, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_short_stream_is_empty() {
        let ds = SequenceDataset::from_tokens(&[1, 2, 3], 3).unwrap();
        assert!(ds.is_empty());
        assert!(SequenceDataset::from_tokens(&[1, 2], 0).is_err());
    }

    #[test]
    fn test_batches_are_token_grids() {
        let tokens: Vec<usize> = (0..17).map(|i| i % 5).collect();
        let ds = SequenceDataset::from_tokens(&tokens, 4).unwrap();
        let loader = DataLoader::new(Box::new(ds), 2, false, false, None).unwrap();
        let batch = loader.iter().next().unwrap();
        assert_eq!(batch.input.dims(), &[2, 4]);
        assert_eq!(batch.target.dims(), &[2, 4]);
    }
}
