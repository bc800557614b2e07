//! Loss functions for training.

use kiln_core::{KilnError, Result, Tensor};

/// Loss function signature: `(prediction, target) -> scalar loss Tensor`.
pub type LossFn = fn(&Tensor, &Tensor) -> Result<Tensor>;

/// Mean cross-entropy of `[N, C]` logits against `[N]` class ids.
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    logits.cross_entropy(targets)
}

/// Cross-entropy for next-token prediction.
///
/// Folds the time axis into the batch: `[B, T, C]` logits and `[B, T]`
/// targets become `[B·T, C]` and `[B·T]`.
pub fn cross_entropy_language_model(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let dims = logits.dims();
    if dims.len() != 3 {
        return Err(KilnError::ShapeMismatch { expected: vec![0, 0, 0], got: dims.to_vec() });
    }
    let (b, t, c) = (dims[0], dims[1], dims[2]);
    if targets.dims() != [b, t] {
        return Err(KilnError::ShapeMismatch { expected: vec![b, t], got: targets.dims().to_vec() });
    }
    let flat_logits = logits.reshape(&[(b * t) as isize, c as isize])?;
    let flat_targets = targets.reshape(&[(b * t) as isize])?;
    flat_logits.cross_entropy(&flat_targets)
}
