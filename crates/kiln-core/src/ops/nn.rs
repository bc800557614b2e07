//! Fused neural-network primitives: embedding gather, layer norm and
//! cross-entropy.

use crate::autograd::{record, GradFn};
use crate::error::KilnError;
use crate::ops::activation::softmax_in_place;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Gather rows of `weight` (`[V, D]`) for each id in `ids`.
    ///
    /// Output shape is `ids.dims() ++ [D]`. Ids must be integral values in
    /// `[0, V)`.
    pub fn embedding(weight: &Tensor, ids: &Tensor) -> Result<Tensor> {
        if weight.ndim() != 2 {
            return Err(KilnError::ShapeMismatch { expected: vec![0, 0], got: weight.dims().to_vec() });
        }
        let (vocab, dim) = (weight.dims()[0], weight.dims()[1]);
        let indices = ids.to_ids(vocab)?;

        let table = weight.as_slice();
        let mut data = Vec::with_capacity(indices.len() * dim);
        for &id in &indices {
            data.extend_from_slice(&table[id * dim..(id + 1) * dim]);
        }

        let mut out_dims = ids.dims().to_vec();
        out_dims.push(dim);
        let out = Tensor::from_parts(data, Shape::new(&out_dims));
        Ok(record(out, &[weight, ids], || EmbeddingBackward { indices, vocab, dim }))
    }

    /// Normalise over the last axis, then scale by `weight` and shift by
    /// `bias` when present. Both are `[D]`.
    pub fn layer_norm(&self, weight: &Tensor, bias: Option<&Tensor>, eps: f32) -> Result<Tensor> {
        if self.ndim() == 0 {
            return Err(KilnError::InvalidAxis { axis: 0, ndim: 0 });
        }
        let d = self.shape().last_dim();
        for param in std::iter::once(weight).chain(bias) {
            if param.dims() != [d] {
                return Err(KilnError::ShapeMismatch { expected: vec![d], got: param.dims().to_vec() });
            }
        }

        let w = weight.as_slice();
        let b = bias.map(|b| b.as_slice());
        let rows = if d == 0 { 0 } else { self.numel() / d };
        let mut normalized = Vec::with_capacity(self.numel());
        let mut rstd = Vec::with_capacity(rows);
        let mut data = Vec::with_capacity(self.numel());

        if d > 0 {
            for row in self.as_slice().chunks(d) {
                let mean = row.iter().sum::<f32>() / d as f32;
                let var = row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / d as f32;
                let r = 1.0 / (var + eps).sqrt();
                rstd.push(r);
                for (j, &x) in row.iter().enumerate() {
                    let xhat = (x - mean) * r;
                    normalized.push(xhat);
                    data.push(xhat * w[j] + b.map_or(0.0, |b| b[j]));
                }
            }
        }

        let out = Tensor::from_parts(data, self.shape().clone());
        let mut inputs = vec![self, weight];
        inputs.extend(bias);
        Ok(record(out, &inputs, || LayerNormBackward {
            normalized,
            rstd,
            weight: w.to_vec(),
            shape: self.shape().clone(),
            has_bias: bias.is_some(),
        }))
    }

    /// Mean cross-entropy of `[N, C]` logits against `[N]` class ids.
    pub fn cross_entropy(&self, targets: &Tensor) -> Result<Tensor> {
        if self.ndim() != 2 {
            return Err(KilnError::ShapeMismatch { expected: vec![0, 0], got: self.dims().to_vec() });
        }
        let (n, c) = (self.dims()[0], self.dims()[1]);
        if targets.numel() != n || n == 0 {
            return Err(KilnError::ShapeMismatch { expected: vec![n], got: targets.dims().to_vec() });
        }
        let labels = targets.to_ids(c)?;

        let mut probs = self.to_vec();
        let mut loss = 0.0f32;
        for (logits, &label) in self.as_slice().chunks(c).zip(&labels) {
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_total = logits.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
            loss += log_total - logits[label];
        }
        for row in probs.chunks_mut(c) {
            softmax_in_place(row);
        }

        let out = Tensor::scalar(loss / n as f32);
        Ok(record(out, &[self, targets], || CrossEntropyBackward { probs, labels, n, c }))
    }
}

// ============================================================================
// Backward rules
// ============================================================================

/// Scatter-adds row gradients back into the table; repeated ids accumulate.
struct EmbeddingBackward {
    indices: Vec<usize>,
    vocab: usize,
    dim: usize,
}

impl GradFn for EmbeddingBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let mut table = vec![0.0f32; self.vocab * self.dim];
        if self.dim > 0 {
            for (&id, g) in self.indices.iter().zip(grad_output.as_slice().chunks(self.dim)) {
                for (acc, &v) in table[id * self.dim..(id + 1) * self.dim].iter_mut().zip(g) {
                    *acc += v;
                }
            }
        }
        Ok(vec![Some(Tensor::from_parts(table, Shape::new(&[self.vocab, self.dim]))), None])
    }

    fn name(&self) -> &str {
        "EmbeddingBackward"
    }
}

struct LayerNormBackward {
    normalized: Vec<f32>,
    rstd: Vec<f32>,
    weight: Vec<f32>,
    shape: Shape,
    has_bias: bool,
}

impl GradFn for LayerNormBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let d = self.weight.len();
        let mut grad_input = vec![0.0f32; self.normalized.len()];
        let mut grad_weight = vec![0.0f32; d];
        let mut grad_bias = vec![0.0f32; d];

        if d > 0 {
            let g_rows = grad_output.as_slice().chunks(d);
            let x_rows = self.normalized.chunks(d);
            let out_rows = grad_input.chunks_mut(d);
            for (((g, xhat), dx), &r) in g_rows.zip(x_rows).zip(out_rows).zip(&self.rstd) {
                let mut mean_gw = 0.0f32;
                let mut mean_gw_x = 0.0f32;
                for j in 0..d {
                    let gw = g[j] * self.weight[j];
                    mean_gw += gw;
                    mean_gw_x += gw * xhat[j];
                    grad_weight[j] += g[j] * xhat[j];
                    grad_bias[j] += g[j];
                }
                mean_gw /= d as f32;
                mean_gw_x /= d as f32;
                for j in 0..d {
                    let gw = g[j] * self.weight[j];
                    dx[j] = r * (gw - mean_gw - xhat[j] * mean_gw_x);
                }
            }
        }

        let param_shape = Shape::new(&[d]);
        let mut grads = vec![
            Some(Tensor::from_parts(grad_input, self.shape.clone())),
            Some(Tensor::from_parts(grad_weight, param_shape.clone())),
        ];
        if self.has_bias {
            grads.push(Some(Tensor::from_parts(grad_bias, param_shape)));
        }
        Ok(grads)
    }

    fn name(&self) -> &str {
        "LayerNormBackward"
    }
}

/// (softmax - onehot) / N, scaled by the upstream scalar.
struct CrossEntropyBackward {
    probs: Vec<f32>,
    labels: Vec<usize>,
    n: usize,
    c: usize,
}

impl GradFn for CrossEntropyBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let scale = grad_output.item()? / self.n as f32;
        let mut grad = self.probs.clone();
        for (row, &label) in grad.chunks_mut(self.c).zip(&self.labels) {
            row[label] -= 1.0;
            for v in row.iter_mut() {
                *v *= scale;
            }
        }
        Ok(vec![Some(Tensor::from_parts(grad, Shape::new(&[self.n, self.c]))), None])
    }

    fn name(&self) -> &str {
        "CrossEntropyBackward"
    }
}

#[cfg(test)]
mod tests {
    use crate::Tensor;

    #[test]
    fn test_embedding_gather() {
        let w = Tensor::from_f32(&[0.0, 1.0, 10.0, 11.0, 20.0, 21.0], &[3, 2]);
        let ids = Tensor::from_ids(&[2, 0, 2], &[1, 3]).unwrap();
        let out = Tensor::embedding(&w, &ids).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2]);
        assert_eq!(out.as_slice(), &[20.0, 21.0, 0.0, 1.0, 20.0, 21.0]);
    }

    #[test]
    fn test_embedding_rejects_bad_ids() {
        let w = Tensor::zeros(&[3, 2]);
        assert!(Tensor::embedding(&w, &Tensor::from_f32(&[3.0], &[1])).is_err());
        assert!(Tensor::embedding(&w, &Tensor::from_f32(&[-1.0], &[1])).is_err());
        assert!(Tensor::embedding(&w, &Tensor::from_f32(&[0.5], &[1])).is_err());
    }

    #[test]
    fn test_embedding_backward_accumulates_repeats() {
        let mut w = Tensor::zeros(&[3, 2]);
        w.set_requires_grad(true);
        let ids = Tensor::from_ids(&[2, 0, 2], &[3]).unwrap();
        Tensor::embedding(&w, &ids).unwrap().sum().unwrap().backward().unwrap();
        assert_eq!(w.grad().unwrap().as_slice(), &[1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn test_layer_norm_normalizes_rows() {
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0], &[2, 4]);
        let w = Tensor::ones(&[4]);
        let y = x.layer_norm(&w, None, 1e-5).unwrap();
        for row in y.as_slice().chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_layer_norm_zero_bias_matches_no_bias() {
        let x = Tensor::from_f32(&[0.5, -1.5, 3.0, 2.0, 0.0, 1.0], &[2, 3]);
        let w = Tensor::from_f32(&[1.0, 2.0, 0.5], &[3]);
        let b = Tensor::zeros(&[3]);
        let with_bias = x.layer_norm(&w, Some(&b), 1e-5).unwrap();
        let without = x.layer_norm(&w, None, 1e-5).unwrap();
        assert_eq!(with_bias.as_slice(), without.as_slice());
    }

    #[test]
    fn test_layer_norm_backward_param_grads() {
        let x = Tensor::from_f32(&[1.0, 3.0], &[1, 2]);
        let mut w = Tensor::ones(&[2]);
        w.set_requires_grad(true);
        let mut b = Tensor::zeros(&[2]);
        b.set_requires_grad(true);
        x.layer_norm(&w, Some(&b), 0.0).unwrap().sum().unwrap().backward().unwrap();
        let gw = w.grad().unwrap();
        assert!((gw.get(0).unwrap() + 1.0).abs() < 1e-5);
        assert!((gw.get(1).unwrap() - 1.0).abs() < 1e-5);
        assert_eq!(b.grad().unwrap().as_slice(), &[1.0, 1.0]);
    }

    #[test]
    fn test_layer_norm_input_grad_matches_finite_difference() {
        let w = Tensor::from_f32(&[0.5, 2.0, -1.0], &[3]);
        let coeffs = Tensor::from_f32(&[1.0, -2.0, 0.5], &[3]);
        let f = |v: &[f32]| {
            Tensor::from_f32(v, &[1, 3]).layer_norm(&w, None, 1e-5).unwrap().mul(&coeffs).unwrap().sum().unwrap().item().unwrap()
        };

        let base = [0.2f32, -0.7, 1.3];
        let mut x = Tensor::from_f32(&base, &[1, 3]);
        x.set_requires_grad(true);
        x.layer_norm(&w, None, 1e-5).unwrap().mul(&coeffs).unwrap().sum().unwrap().backward().unwrap();
        let grad = x.grad().unwrap();

        let h = 1e-3;
        for i in 0..3 {
            let mut plus = base;
            let mut minus = base;
            plus[i] += h;
            minus[i] -= h;
            let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
            assert!((grad.get(i).unwrap() - numeric).abs() < 1e-2);
        }
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Tensor::zeros(&[2, 4]);
        let targets = Tensor::from_ids(&[1, 3], &[2]).unwrap();
        let loss = logits.cross_entropy(&targets).unwrap().item().unwrap();
        assert!((loss - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_backward() {
        let mut logits = Tensor::zeros(&[2, 2]);
        logits.set_requires_grad(true);
        let targets = Tensor::from_ids(&[0, 1], &[2]).unwrap();
        logits.cross_entropy(&targets).unwrap().backward().unwrap();
        assert_eq!(logits.grad().unwrap().as_slice(), &[-0.25, 0.25, 0.25, -0.25]);
    }

    #[test]
    fn test_cross_entropy_rejects_out_of_range_target() {
        let logits = Tensor::zeros(&[1, 3]);
        let targets = Tensor::from_ids(&[3], &[1]).unwrap();
        assert!(logits.cross_entropy(&targets).is_err());
    }
}
