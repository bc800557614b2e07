//! Reduction operations: sum, mean, max, min, argmax.

use rayon::prelude::*;

use crate::autograd::{record, GradFn};
use crate::error::KilnError;
use crate::ops::PAR_THRESHOLD;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Sum all elements, returning a scalar tensor.
    pub fn sum(&self) -> Result<Tensor> {
        let out = Tensor::scalar(total(self.as_slice()));
        Ok(record(out, &[self], || SumBackward { input_shape: self.shape().clone(), scale: 1.0 }))
    }

    /// Mean of all elements, returning a scalar tensor.
    pub fn mean(&self) -> Result<Tensor> {
        let n = self.numel();
        if n == 0 {
            return Err(KilnError::ShapeMismatch { expected: vec![1], got: self.dims().to_vec() });
        }
        let out = Tensor::scalar(total(self.as_slice()) / n as f32);
        Ok(record(out, &[self], || SumBackward {
            input_shape: self.shape().clone(),
            scale: 1.0 / n as f32,
        }))
    }

    /// Maximum element (not differentiable).
    pub fn max(&self) -> Result<Tensor> {
        self.as_slice()
            .iter()
            .copied()
            .reduce(f32::max)
            .map(Tensor::scalar)
            .ok_or_else(|| KilnError::ShapeMismatch { expected: vec![1], got: self.dims().to_vec() })
    }

    /// Minimum element (not differentiable).
    pub fn min(&self) -> Result<Tensor> {
        self.as_slice()
            .iter()
            .copied()
            .reduce(f32::min)
            .map(Tensor::scalar)
            .ok_or_else(|| KilnError::ShapeMismatch { expected: vec![1], got: self.dims().to_vec() })
    }

    /// Index of the largest value along the last axis, as f32 ids.
    ///
    /// `[.., C]` → `[..]`. Ties resolve to the first index. Never tracks grad.
    pub fn argmax(&self) -> Result<Tensor> {
        if self.ndim() == 0 {
            return Err(KilnError::InvalidAxis { axis: 0, ndim: 0 });
        }
        let c = self.shape().last_dim();
        if c == 0 {
            return Err(KilnError::ShapeMismatch { expected: vec![1], got: self.dims().to_vec() });
        }
        let data: Vec<f32> = self
            .as_slice()
            .chunks(c)
            .map(|row| {
                let mut best = 0;
                for (j, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = j;
                    }
                }
                best as f32
            })
            .collect();
        let dims = &self.dims()[..self.ndim() - 1];
        Ok(Tensor::from_parts(data, Shape::new(dims)))
    }
}

fn total(slice: &[f32]) -> f32 {
    if slice.len() >= PAR_THRESHOLD {
        slice.par_iter().sum()
    } else {
        slice.iter().sum()
    }
}

/// Broadcasts the scalar upstream gradient back over the input, scaled for `mean`.
struct SumBackward {
    input_shape: Shape,
    scale: f32,
}

impl GradFn for SumBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let g = grad_output.item()? * self.scale;
        Ok(vec![Some(Tensor::full(self.input_shape.dims(), g))])
    }

    fn name(&self) -> &str {
        "SumBackward"
    }
}

#[cfg(test)]
mod tests {
    use crate::Tensor;

    #[test]
    fn test_sum() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]);
        assert_eq!(t.sum().unwrap().item().unwrap(), 10.0);
    }

    #[test]
    fn test_sum_parallel_path() {
        let t = Tensor::ones(&[20_000]);
        assert_eq!(t.sum().unwrap().item().unwrap(), 20_000.0);
    }

    #[test]
    fn test_mean() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]);
        assert!((t.mean().unwrap().item().unwrap() - 2.5).abs() < 1e-6);
        assert!(Tensor::zeros(&[0]).mean().is_err());
    }

    #[test]
    fn test_max_min() {
        let t = Tensor::from_f32(&[3.0, 1.0, 4.0, 1.0, 5.0], &[5]);
        assert_eq!(t.max().unwrap().item().unwrap(), 5.0);
        assert_eq!(t.min().unwrap().item().unwrap(), 1.0);
    }

    #[test]
    fn test_argmax_last_axis() {
        let t = Tensor::from_f32(&[0.1, 0.7, 0.2, 0.9, 0.05, 0.05], &[2, 3]);
        let idx = t.argmax().unwrap();
        assert_eq!(idx.dims(), &[2]);
        assert_eq!(idx.as_slice(), &[1.0, 0.0]);
    }

    #[test]
    fn test_mean_backward() {
        let mut t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        t.set_requires_grad(true);
        t.mean().unwrap().backward().unwrap();
        assert_eq!(t.grad().unwrap().as_slice(), &[0.25; 4]);
    }
}
