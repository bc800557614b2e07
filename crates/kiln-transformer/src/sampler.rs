//! Autoregressive sampling.
//!
//! Each step crops the running sequence to the context window, runs the
//! model, softmaxes the last position's logits and draws one id per row
//! with [`WeightedIndex`]. Pass a seeded RNG for reproducible output.

use kiln_core::autograd::NoGradGuard;
use kiln_core::{KilnError, Result, Tensor};
use kiln_nn::Module;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::debug;

use crate::bigram::BigramLanguageModel;
use crate::model::DecoderStack;

/// A model mapping `[B, T]` ids to `[B, T, vocab]` logits.
pub trait LanguageModel: Module {
    fn vocab_size(&self) -> usize;

    /// Longest input the model accepts, `None` when unbounded.
    fn context_window(&self) -> Option<usize>;
}

impl LanguageModel for DecoderStack {
    fn vocab_size(&self) -> usize {
        self.config().vocab_size
    }

    fn context_window(&self) -> Option<usize> {
        Some(self.config().context_window)
    }
}

impl LanguageModel for BigramLanguageModel {
    fn vocab_size(&self) -> usize {
        BigramLanguageModel::vocab_size(self)
    }

    fn context_window(&self) -> Option<usize> {
        None
    }
}

/// Extend every row of `idx` (`[B, T]`) by `max_new_tokens` sampled ids.
///
/// `context_window` overrides the model's own window for cropping. The
/// model is switched to eval mode and left there.
pub fn generate<M, R>(
    model: &mut M,
    idx: &Tensor,
    max_new_tokens: usize,
    context_window: Option<usize>,
    rng: &mut R,
) -> Result<Tensor>
where
    M: LanguageModel + ?Sized,
    R: Rng + ?Sized,
{
    if idx.ndim() != 2 || idx.dims()[1] == 0 {
        return Err(KilnError::ShapeMismatch { expected: vec![1, 1], got: idx.dims().to_vec() });
    }
    if context_window == Some(0) {
        return Err(KilnError::InvalidConfig("context window override must be > 0".into()));
    }
    model.train(false);
    let _guard = NoGradGuard::new();

    let (batch, prompt_len) = (idx.dims()[0], idx.dims()[1]);
    let window = context_window.or_else(|| model.context_window());
    let mut rows: Vec<Vec<f32>> = idx.as_slice().chunks(prompt_len).map(<[f32]>::to_vec).collect();

    for step in 0..max_new_tokens {
        let len = prompt_len + step;
        let start = window.map_or(0, |w| len.saturating_sub(w));
        let cropped: Vec<f32> = rows.iter().flat_map(|row| row[start..].iter().copied()).collect();
        let logits = model.forward(&Tensor::from_vec(cropped, &[batch, len - start])?)?;
        if logits.ndim() != 3 {
            return Err(KilnError::ShapeMismatch {
                expected: vec![batch, len - start, model.vocab_size()],
                got: logits.dims().to_vec(),
            });
        }

        let probs = logits.narrow(1, logits.dims()[1] - 1, 1)?.softmax()?;
        let vocab = probs.shape().last_dim();
        for (row, p) in rows.iter_mut().zip(probs.as_slice().chunks(vocab)) {
            let dist = WeightedIndex::<f32>::new(p)
                .map_err(|e| KilnError::InvalidConfig(format!("cannot sample from next-token distribution: {e}")))?;
            row.push(dist.sample(rng) as f32);
        }
        debug!(step, context = len - start, "sampled next token");
    }

    Tensor::from_vec(rows.concat(), &[batch, prompt_len + max_new_tokens])
}

/// Single-sequence [`generate`] over plain ids.
pub fn generate_tokens<M, R>(
    model: &mut M,
    prompt: &[usize],
    max_new_tokens: usize,
    context_window: Option<usize>,
    rng: &mut R,
) -> Result<Vec<usize>>
where
    M: LanguageModel + ?Sized,
    R: Rng + ?Sized,
{
    let idx = Tensor::from_ids(prompt, &[1, prompt.len()])?;
    let vocab = model.vocab_size();
    generate(model, &idx, max_new_tokens, context_window, rng)?.to_ids(vocab)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generate_extends_each_row() {
        let mut model = DecoderStack::simple(&ModelConfig::new(7, 8, 4, 2, 1)).unwrap();
        let idx = Tensor::from_ids(&[1, 2, 3, 4, 5, 6], &[2, 3]).unwrap();
        let out = generate(&mut model, &idx, 6, None, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(out.dims(), &[2, 9]);
        let ids = out.to_ids(7).unwrap();
        assert_eq!(&ids[..3], &[1, 2, 3]);
        assert_eq!(&ids[9..12], &[4, 5, 6]);
    }

    #[test]
    fn test_generate_leaves_eval_mode() {
        let mut model = DecoderStack::gpt2(&ModelConfig::new(7, 8, 4, 2, 1).with_dropout(0.2)).unwrap();
        assert!(model.is_training());
        generate_tokens(&mut model, &[1], 1, None, &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(!model.is_training());
    }

    #[test]
    fn test_zero_new_tokens_is_identity() {
        let mut model = BigramLanguageModel::new(5);
        let out = generate_tokens(&mut model, &[4, 0, 2], 0, None, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(out, vec![4, 0, 2]);
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let mut model = BigramLanguageModel::new(5);
        let a = generate_tokens(&mut model, &[1], 10, None, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = generate_tokens(&mut model, &[1], 10, None, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_window_override_crops_context() {
        let mut model = DecoderStack::gpt1(&ModelConfig::new(7, 8, 4, 2, 1)).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        // prompt longer than the model window still works once cropped
        let out = generate_tokens(&mut model, &[1, 2, 3, 4, 5, 6], 3, Some(2), &mut rng).unwrap();
        assert_eq!(out.len(), 9);
        assert!(generate_tokens(&mut model, &[1, 2, 3, 4, 5, 6], 1, Some(6), &mut rng).is_err());
    }

    #[test]
    fn test_generate_rejects_bad_prompt() {
        let mut model = BigramLanguageModel::new(5);
        let mut rng = StdRng::seed_from_u64(5);
        assert!(generate_tokens(&mut model, &[], 1, None, &mut rng).is_err());
        assert!(generate(&mut model, &Tensor::from_ids(&[1, 2], &[2]).unwrap(), 1, None, &mut rng).is_err());
    }
}
