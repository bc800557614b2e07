//! Shape manipulation: reshape, permute, transpose, narrow, select, cat,
//! stack, masked_fill.

use crate::autograd::{record, GradFn};
use crate::error::KilnError;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Reinterpret the elements under a new shape. One entry may be `-1`.
    ///
    /// The result shares this tensor's buffer.
    pub fn reshape(&self, shape: &[isize]) -> Result<Tensor> {
        let new_shape = self.shape().resolve_reshape(shape).ok_or_else(|| KilnError::InvalidReshape {
            numel: self.numel(),
            shape: shape.to_vec(),
        })?;
        let out = self.with_shape(new_shape);
        Ok(record(out, &[self], || ReshapeBackward { input_shape: self.shape().clone() }))
    }

    /// Insert a length-1 axis at `axis`.
    pub fn unsqueeze(&self, axis: usize) -> Result<Tensor> {
        if axis > self.ndim() {
            return Err(KilnError::InvalidAxis { axis, ndim: self.ndim() });
        }
        let mut dims: Vec<isize> = self.dims().iter().map(|&d| d as isize).collect();
        dims.insert(axis, 1);
        self.reshape(&dims)
    }

    /// Reorder axes: output axis `i` is input axis `order[i]`.
    pub fn permute(&self, order: &[usize]) -> Result<Tensor> {
        let out_shape = self.shape().permuted(order)?;
        let src_strides = self.shape().contiguous_strides();
        let out_strides = out_shape.contiguous_strides();
        let src = self.as_slice();

        let data: Vec<f32> = (0..out_shape.numel())
            .map(|flat| {
                let mut remaining = flat;
                let mut src_idx = 0;
                for (axis, &stride) in out_strides.iter().enumerate() {
                    let coord = remaining / stride;
                    remaining %= stride;
                    src_idx += coord * src_strides[order[axis]];
                }
                src[src_idx]
            })
            .collect();

        let mut inverse = vec![0; order.len()];
        for (i, &axis) in order.iter().enumerate() {
            inverse[axis] = i;
        }

        let out = Tensor::from_parts(data, out_shape);
        Ok(record(out, &[self], || PermuteBackward { inverse }))
    }

    /// Swap two axes. Negative axes count from the end.
    pub fn transpose(&self, dim0: isize, dim1: isize) -> Result<Tensor> {
        let a = self.shape().normalize_axis(dim0)?;
        let b = self.shape().normalize_axis(dim1)?;
        let mut order: Vec<usize> = (0..self.ndim()).collect();
        order.swap(a, b);
        self.permute(&order)
    }

    /// Slice `len` entries of `axis` starting at `start`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let dims = self.dims();
        if axis >= dims.len() {
            return Err(KilnError::InvalidAxis { axis, ndim: dims.len() });
        }
        if start + len > dims[axis] {
            return Err(KilnError::IndexOutOfRange { index: (start + len) as f32, size: dims[axis] });
        }

        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();
        let src = self.as_slice();
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * dims[axis] + start) * inner;
            data.extend_from_slice(&src[base..base + len * inner]);
        }

        let mut out_dims = dims.to_vec();
        out_dims[axis] = len;
        let out = Tensor::from_parts(data, Shape::new(&out_dims));
        Ok(record(out, &[self], || NarrowBackward { input_shape: self.shape().clone(), axis, start }))
    }

    /// Pick index `index` of `axis`, dropping that axis.
    pub fn select(&self, axis: usize, index: usize) -> Result<Tensor> {
        let picked = self.narrow(axis, index, 1)?;
        let dims: Vec<isize> = self
            .dims()
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != axis)
            .map(|(_, &d)| d as isize)
            .collect();
        picked.reshape(&dims)
    }

    /// Concatenate tensors along a given axis.
    ///
    /// All tensors must have the same shape except along `axis`.
    pub fn cat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| KilnError::ShapeMismatch { expected: vec![1], got: vec![0] })?;
        let axis = first.shape().normalize_axis(axis)?;
        let ndim = first.ndim();

        for t in &tensors[1..] {
            let compatible = t.ndim() == ndim
                && (0..ndim).all(|d| d == axis || t.dims()[d] == first.dims()[d]);
            if !compatible {
                return Err(KilnError::ShapeMismatch {
                    expected: first.dims().to_vec(),
                    got: t.dims().to_vec(),
                });
            }
        }

        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[axis]).collect();
        let mut out_dims = first.dims().to_vec();
        out_dims[axis] = sizes.iter().sum();

        let outer: usize = out_dims[..axis].iter().product();
        let inner: usize = out_dims[axis + 1..].iter().product();
        let mut data = Vec::with_capacity(out_dims.iter().product());
        for o in 0..outer {
            for (t, &size) in tensors.iter().zip(&sizes) {
                let chunk = size * inner;
                data.extend_from_slice(&t.as_slice()[o * chunk..(o + 1) * chunk]);
            }
        }

        let out = Tensor::from_parts(data, Shape::new(&out_dims));
        Ok(record(out, tensors, || CatBackward { axis, sizes }))
    }

    /// Stack equally shaped tensors along a new axis.
    pub fn stack(tensors: &[&Tensor], axis: usize) -> Result<Tensor> {
        let expanded = tensors.iter().map(|t| t.unsqueeze(axis)).collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = expanded.iter().collect();
        Tensor::cat(&refs, axis as isize)
    }

    /// Replace elements where `mask` is non-zero with `value`.
    ///
    /// `mask` must broadcast to this tensor's shape.
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Result<Tensor> {
        let broadcast = self.shape().broadcast_with(mask.shape());
        if broadcast.as_ref() != Some(self.shape()) {
            return Err(KilnError::BroadcastError { a: self.dims().to_vec(), b: mask.dims().to_vec() });
        }

        let shape = self.shape();
        let m = mask.as_slice();
        let data: Vec<f32> = self
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, &v)| if m[shape.broadcast_source_index(i, mask.shape())] != 0.0 { value } else { v })
            .collect();

        let out = Tensor::from_parts(data, shape.clone());
        Ok(record(out, &[self], || MaskedFillBackward { mask: mask.detach() }))
    }
}

// ============================================================================
// Backward rules
// ============================================================================

struct ReshapeBackward {
    input_shape: Shape,
}

impl GradFn for ReshapeBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.with_shape(self.input_shape.clone()))])
    }

    fn name(&self) -> &str {
        "ReshapeBackward"
    }
}

struct PermuteBackward {
    inverse: Vec<usize>,
}

impl GradFn for PermuteBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.permute(&self.inverse)?)])
    }

    fn name(&self) -> &str {
        "PermuteBackward"
    }
}

/// Scatters the slice gradient into a zero tensor of the input shape.
struct NarrowBackward {
    input_shape: Shape,
    axis: usize,
    start: usize,
}

impl GradFn for NarrowBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let dims = self.input_shape.dims();
        let len = grad_output.dims()[self.axis];
        let outer: usize = dims[..self.axis].iter().product();
        let inner: usize = dims[self.axis + 1..].iter().product();
        let g = grad_output.as_slice();

        let mut data = vec![0.0f32; self.input_shape.numel()];
        for o in 0..outer {
            let dst = (o * dims[self.axis] + self.start) * inner;
            let src = o * len * inner;
            data[dst..dst + len * inner].copy_from_slice(&g[src..src + len * inner]);
        }
        Ok(vec![Some(Tensor::from_parts(data, self.input_shape.clone()))])
    }

    fn name(&self) -> &str {
        "NarrowBackward"
    }
}

struct CatBackward {
    axis: usize,
    sizes: Vec<usize>,
}

impl GradFn for CatBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let mut offset = 0;
        let mut grads = Vec::with_capacity(self.sizes.len());
        for &size in &self.sizes {
            grads.push(Some(grad_output.narrow(self.axis, offset, size)?));
            offset += size;
        }
        Ok(grads)
    }

    fn name(&self) -> &str {
        "CatBackward"
    }
}

/// Filled positions are constants, so their gradient is zero.
struct MaskedFillBackward {
    mask: Tensor,
}

impl GradFn for MaskedFillBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let shape = grad_output.shape();
        let m = self.mask.as_slice();
        let data: Vec<f32> = grad_output
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, &g)| if m[shape.broadcast_source_index(i, self.mask.shape())] != 0.0 { 0.0 } else { g })
            .collect();
        Ok(vec![Some(Tensor::from_parts(data, shape.clone()))])
    }

    fn name(&self) -> &str {
        "MaskedFillBackward"
    }
}
