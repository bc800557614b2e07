//! Element-wise arithmetic and matrix multiplication.

use rayon::prelude::*;

use crate::autograd::{record, GradFn};
use crate::error::KilnError;
use crate::ops::PAR_THRESHOLD;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Element-wise addition with broadcasting: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a + b)?;
        Ok(record(out, &[self, other], || AddBackward {
            lhs_shape: self.shape().clone(),
            rhs_shape: other.shape().clone(),
        }))
    }

    /// Element-wise subtraction with broadcasting: self - other.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a - b)?;
        Ok(record(out, &[self, other], || SubBackward {
            lhs_shape: self.shape().clone(),
            rhs_shape: other.shape().clone(),
        }))
    }

    /// Element-wise multiplication with broadcasting: self * other.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a * b)?;
        Ok(record(out, &[self, other], || MulBackward { lhs: self.detach(), rhs: other.detach() }))
    }

    /// Scalar addition: self + scalar.
    pub fn add_scalar(&self, scalar: f32) -> Result<Tensor> {
        let out = unary_op(self, |a| a + scalar);
        Ok(record(out, &[self], || AddScalarBackward))
    }

    /// Scalar multiplication: self * scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Result<Tensor> {
        let out = unary_op(self, |a| a * scalar);
        Ok(record(out, &[self], || MulScalarBackward { scalar }))
    }

    /// Matrix multiplication: self @ other.
    ///
    /// Supports:
    /// - [.., M, K] @ [K, N] → [.., M, N] (shared right-hand matrix)
    /// - [.., M, K] @ [.., K, N] → [.., M, N] (batched, equal leading dims)
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let a_dims = self.dims();
        let b_dims = other.dims();
        if a_dims.is_empty() || b_dims.len() < 2 {
            return Err(KilnError::ShapeMismatch { expected: a_dims.to_vec(), got: b_dims.to_vec() });
        }

        let k1 = a_dims[a_dims.len() - 1];
        let k2 = b_dims[b_dims.len() - 2];
        let n = b_dims[b_dims.len() - 1];
        let m = if a_dims.len() >= 2 { a_dims[a_dims.len() - 2] } else { 1 };
        if k1 != k2 {
            return Err(KilnError::MatmulDimMismatch { m, k1, k2, n });
        }

        let mut out_dims = a_dims[..a_dims.len() - 1].to_vec();
        out_dims.push(n);

        let data = if b_dims.len() == 2 {
            let rows: usize = a_dims[..a_dims.len() - 1].iter().product();
            gemm(self.as_slice(), other.as_slice(), rows, k1, n)
        } else {
            if a_dims.len() != b_dims.len() || a_dims[..a_dims.len() - 2] != b_dims[..b_dims.len() - 2] {
                return Err(KilnError::ShapeMismatch { expected: a_dims.to_vec(), got: b_dims.to_vec() });
            }
            let batch: usize = a_dims[..a_dims.len() - 2].iter().product();
            gemm_batched(self.as_slice(), other.as_slice(), batch, m, k1, n)
        };

        let out = Tensor::from_parts(data, Shape::new(&out_dims));
        Ok(record(out, &[self, other], || MatmulBackward { lhs: self.detach(), rhs: other.detach() }))
    }
}

/// Apply a unary operation element-wise.
pub(crate) fn unary_op(a: &Tensor, op: impl Fn(f32) -> f32 + Sync + Send) -> Tensor {
    let src = a.as_slice();
    let data: Vec<f32> = if src.len() >= PAR_THRESHOLD {
        src.par_iter().map(|&v| op(v)).collect()
    } else {
        src.iter().map(|&v| op(v)).collect()
    };
    Tensor::from_parts(data, a.shape().clone())
}

/// Apply a binary operation element-wise with broadcasting.
pub(crate) fn binary_op(a: &Tensor, b: &Tensor, op: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    let out_shape = a.shape().broadcast_with(b.shape()).ok_or_else(|| KilnError::BroadcastError {
        a: a.dims().to_vec(),
        b: b.dims().to_vec(),
    })?;

    let a_data = a.as_slice();
    let b_data = b.as_slice();

    let data: Vec<f32> = if a.shape() == b.shape() {
        a_data.iter().zip(b_data).map(|(&x, &y)| op(x, y)).collect()
    } else if a.shape() == &out_shape && is_trailing(b.dims(), a.dims()) && !b_data.is_empty() {
        // bias-style broadcast: b repeats over the leading axes of a
        let bn = b_data.len();
        a_data.iter().enumerate().map(|(i, &x)| op(x, b_data[i % bn])).collect()
    } else {
        (0..out_shape.numel())
            .map(|i| {
                let ai = out_shape.broadcast_source_index(i, a.shape());
                let bi = out_shape.broadcast_source_index(i, b.shape());
                op(a_data[ai], b_data[bi])
            })
            .collect()
    };

    Ok(Tensor::from_parts(data, out_shape))
}

fn is_trailing(suffix: &[usize], dims: &[usize]) -> bool {
    suffix.len() <= dims.len() && dims[dims.len() - suffix.len()..] == *suffix
}

/// Sum a broadcast gradient back down to `target`.
fn reduce_to_shape(grad: &Tensor, target: &Shape) -> Tensor {
    if grad.shape() == target {
        return grad.clone();
    }
    let mut out = vec![0.0f32; target.numel()];
    let grad_shape = grad.shape();
    for (i, &g) in grad.as_slice().iter().enumerate() {
        out[grad_shape.broadcast_source_index(i, target)] += g;
    }
    Tensor::from_parts(out, target.clone())
}

// ============================================================================
// Kernels
// ============================================================================

/// [M, K] @ [K, N] → [M, N], i-k-j loop order. Rows run in parallel once
/// the problem is large enough.
pub(crate) fn gemm(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    if n == 0 {
        return c;
    }
    let row = |(i, c_row): (usize, &mut [f32])| {
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &a_ip) in a_row.iter().enumerate() {
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (c_ij, &b_pj) in c_row.iter_mut().zip(b_row) {
                *c_ij += a_ip * b_pj;
            }
        }
    };
    if m * k * n >= PAR_THRESHOLD * 8 {
        c.par_chunks_mut(n).enumerate().for_each(row);
    } else {
        c.chunks_mut(n).enumerate().for_each(row);
    }
    c
}

/// [B, M, K] @ [B, K, N] → [B, M, N]
fn gemm_batched(a: &[f32], b: &[f32], batch: usize, m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = Vec::with_capacity(batch * m * n);
    for bi in 0..batch {
        let a_slice = &a[bi * m * k..(bi + 1) * m * k];
        let b_slice = &b[bi * k * n..(bi + 1) * k * n];
        c.extend(gemm(a_slice, b_slice, m, k, n));
    }
    c
}

/// Row-major transpose of an [rows, cols] matrix.
pub(crate) fn transpose_2d(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

// ============================================================================
// Backward rules
// ============================================================================

struct AddBackward {
    lhs_shape: Shape,
    rhs_shape: Shape,
}

impl GradFn for AddBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(reduce_to_shape(grad_output, &self.lhs_shape)),
            Some(reduce_to_shape(grad_output, &self.rhs_shape)),
        ])
    }

    fn name(&self) -> &str {
        "AddBackward"
    }
}

struct SubBackward {
    lhs_shape: Shape,
    rhs_shape: Shape,
}

impl GradFn for SubBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let negated = unary_op(grad_output, |g| -g);
        Ok(vec![
            Some(reduce_to_shape(grad_output, &self.lhs_shape)),
            Some(reduce_to_shape(&negated, &self.rhs_shape)),
        ])
    }

    fn name(&self) -> &str {
        "SubBackward"
    }
}

struct MulBackward {
    lhs: Tensor,
    rhs: Tensor,
}

impl GradFn for MulBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad_lhs = binary_op(grad_output, &self.rhs, |g, b| g * b)?;
        let grad_rhs = binary_op(grad_output, &self.lhs, |g, a| g * a)?;
        Ok(vec![
            Some(reduce_to_shape(&grad_lhs, self.lhs.shape())),
            Some(reduce_to_shape(&grad_rhs, self.rhs.shape())),
        ])
    }

    fn name(&self) -> &str {
        "MulBackward"
    }
}

struct AddScalarBackward;

impl GradFn for AddScalarBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.clone())])
    }

    fn name(&self) -> &str {
        "AddScalarBackward"
    }
}

struct MulScalarBackward {
    scalar: f32,
}

impl GradFn for MulScalarBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let s = self.scalar;
        Ok(vec![Some(unary_op(grad_output, |g| g * s))])
    }

    fn name(&self) -> &str {
        "MulScalarBackward"
    }
}

/// dA = G @ Bᵀ, dB = Aᵀ @ G. A shared 2-D right-hand side accumulates its
/// gradient over every row of the left operand.
struct MatmulBackward {
    lhs: Tensor,
    rhs: Tensor,
}

impl GradFn for MatmulBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let a_dims = self.lhs.dims();
        let b_dims = self.rhs.dims();
        let k = a_dims[a_dims.len() - 1];
        let n = b_dims[b_dims.len() - 1];
        let g = grad_output.as_slice();
        let a = self.lhs.as_slice();
        let b = self.rhs.as_slice();

        let (grad_a, grad_b) = if b_dims.len() == 2 {
            let rows: usize = a_dims[..a_dims.len() - 1].iter().product();
            let grad_a = gemm(g, &transpose_2d(b, k, n), rows, n, k);
            let grad_b = gemm(&transpose_2d(a, rows, k), g, k, rows, n);
            (grad_a, grad_b)
        } else {
            let m = a_dims[a_dims.len() - 2];
            let batch: usize = a_dims[..a_dims.len() - 2].iter().product();
            let mut grad_a = Vec::with_capacity(a.len());
            let mut grad_b = Vec::with_capacity(b.len());
            for bi in 0..batch {
                let g_s = &g[bi * m * n..(bi + 1) * m * n];
                let a_s = &a[bi * m * k..(bi + 1) * m * k];
                let b_s = &b[bi * k * n..(bi + 1) * k * n];
                grad_a.extend(gemm(g_s, &transpose_2d(b_s, k, n), m, n, k));
                grad_b.extend(gemm(&transpose_2d(a_s, m, k), g_s, k, m, n));
            }
            (grad_a, grad_b)
        };

        Ok(vec![
            Some(Tensor::from_parts(grad_a, self.lhs.shape().clone())),
            Some(Tensor::from_parts(grad_b, self.rhs.shape().clone())),
        ])
    }

    fn name(&self) -> &str {
        "MatmulBackward"
    }
}
