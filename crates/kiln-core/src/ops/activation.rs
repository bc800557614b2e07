//! Activation functions and softmax.

use crate::autograd::{record, GradFn};
use crate::error::KilnError;
use crate::ops::arithmetic::{binary_op, unary_op};
use crate::tensor::Tensor;
use crate::Result;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

impl Tensor {
    pub fn relu(&self) -> Result<Tensor> {
        let out = unary_op(self, |x| x.max(0.0));
        Ok(record(out, &[self], || ReluBackward { input: self.detach() }))
    }

    /// GELU, tanh approximation.
    pub fn gelu(&self) -> Result<Tensor> {
        let out = unary_op(self, gelu);
        Ok(record(out, &[self], || GeluBackward { input: self.detach() }))
    }

    pub fn tanh(&self) -> Result<Tensor> {
        let out = unary_op(self, f32::tanh);
        Ok(record(out.clone(), &[self], || TanhBackward { output: out.detach() }))
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        let out = unary_op(self, sigmoid);
        Ok(record(out.clone(), &[self], || SigmoidBackward { output: out.detach() }))
    }

    /// Softmax over the last axis. `-inf` entries get probability zero.
    pub fn softmax(&self) -> Result<Tensor> {
        if self.ndim() == 0 {
            return Err(KilnError::InvalidAxis { axis: 0, ndim: 0 });
        }
        let c = self.shape().last_dim();
        let mut data = self.to_vec();
        if c > 0 {
            for row in data.chunks_mut(c) {
                softmax_in_place(row);
            }
        }
        let out = Tensor::from_parts(data, self.shape().clone());
        Ok(record(out.clone(), &[self], || SoftmaxBackward { output: out.detach() }))
    }
}

pub(crate) fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        total += *v;
    }
    for v in row.iter_mut() {
        *v /= total;
    }
}

fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x)).tanh())
}

fn gelu_grad(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    let t = inner.tanh();
    let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ============================================================================
// Backward rules
// ============================================================================

struct ReluBackward {
    input: Tensor,
}

impl GradFn for ReluBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad = binary_op(grad_output, &self.input, |g, x| if x > 0.0 { g } else { 0.0 })?;
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &str {
        "ReluBackward"
    }
}

struct GeluBackward {
    input: Tensor,
}

impl GradFn for GeluBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad = binary_op(grad_output, &self.input, |g, x| g * gelu_grad(x))?;
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &str {
        "GeluBackward"
    }
}

struct TanhBackward {
    output: Tensor,
}

impl GradFn for TanhBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad = binary_op(grad_output, &self.output, |g, y| g * (1.0 - y * y))?;
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &str {
        "TanhBackward"
    }
}

struct SigmoidBackward {
    output: Tensor,
}

impl GradFn for SigmoidBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad = binary_op(grad_output, &self.output, |g, y| g * y * (1.0 - y))?;
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &str {
        "SigmoidBackward"
    }
}

/// dx = y * (g - Σ g·y), per row.
struct SoftmaxBackward {
    output: Tensor,
}

impl GradFn for SoftmaxBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let c = self.output.shape().last_dim();
        let mut data = vec![0.0f32; self.output.numel()];
        if c > 0 {
            let rows = self.output.as_slice().chunks(c).zip(grad_output.as_slice().chunks(c));
            for ((y, g), dx) in rows.zip(data.chunks_mut(c)) {
                let dot: f32 = y.iter().zip(g).map(|(&yi, &gi)| yi * gi).sum();
                for ((d, &yi), &gi) in dx.iter_mut().zip(y).zip(g) {
                    *d = yi * (gi - dot);
                }
            }
        }
        Ok(vec![Some(Tensor::from_parts(data, self.output.shape().clone()))])
    }

    fn name(&self) -> &str {
        "SoftmaxBackward"
    }
}
