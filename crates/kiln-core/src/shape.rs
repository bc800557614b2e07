use smallvec::SmallVec;
use std::fmt;

use crate::error::KilnError;
use crate::Result;

/// Tensor shape with inline storage for up to four dimensions.
///
/// Activations in this crate are at most `[layers, dirs, batch, hidden]`,
/// so the common case never touches the heap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: SmallVec::from_slice(dims) }
    }

    pub fn scalar() -> Self {
        Self { dims: SmallVec::new() }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements. A scalar holds one.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Size of the trailing dimension (1 for scalars).
    pub fn last_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Resolve a possibly negative axis against this rank.
    pub fn normalize_axis(&self, axis: isize) -> Result<usize> {
        let ndim = self.ndim() as isize;
        let resolved = if axis < 0 { ndim + axis } else { axis };
        if resolved < 0 || resolved >= ndim {
            return Err(KilnError::InvalidAxis { axis: axis.unsigned_abs(), ndim: self.ndim() });
        }
        Ok(resolved as usize)
    }

    /// Row-major strides, in elements.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let ndim = self.dims.len();
        let mut strides = SmallVec::from_elem(1usize, ndim);
        for i in (0..ndim.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// NumPy-style broadcast of two shapes, aligned from the right.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let max_ndim = self.ndim().max(other.ndim());
        let mut result: SmallVec<[usize; 4]> = SmallVec::with_capacity(max_ndim);

        for i in 0..max_ndim {
            let a = if i < self.ndim() { self.dims[self.ndim() - 1 - i] } else { 1 };
            let b = if i < other.ndim() { other.dims[other.ndim() - 1 - i] } else { 1 };
            match (a, b) {
                (a, b) if a == b => result.push(a),
                (1, b) => result.push(b),
                (a, 1) => result.push(a),
                _ => return None,
            }
        }

        result.reverse();
        Some(Shape { dims: result })
    }

    /// Map a flat index of `self` (a broadcast result) onto a flat index of
    /// `src`, which must broadcast to `self`.
    pub fn broadcast_source_index(&self, flat_idx: usize, src: &Shape) -> usize {
        let out_strides = self.contiguous_strides();
        let src_strides = src.contiguous_strides();
        let offset = self.ndim() - src.ndim();

        let mut remaining = flat_idx;
        let mut src_idx = 0;
        for (i, &stride) in out_strides.iter().enumerate() {
            let coord = remaining / stride;
            remaining %= stride;
            if i >= offset {
                let si = i - offset;
                if src.dims[si] > 1 {
                    src_idx += coord * src_strides[si];
                }
            }
        }
        src_idx
    }

    /// Validate and compute a reshape target. At most one entry may be -1.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut inferred = None;
        let mut known: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => inferred = Some(i),
                d if d > 0 => known = known.checked_mul(d as usize)?,
                _ => return None,
            }
        }

        let mut dims: SmallVec<[usize; 4]> =
            target.iter().map(|&d| if d == -1 { 0 } else { d as usize }).collect();

        if let Some(idx) = inferred {
            if known == 0 || numel % known != 0 {
                return None;
            }
            dims[idx] = numel / known;
        }

        let resolved = Shape { dims };
        (resolved.numel() == numel).then_some(resolved)
    }

    /// Shape after reordering axes by `order` (`order[i]` is the source axis
    /// of output axis `i`).
    pub fn permuted(&self, order: &[usize]) -> Result<Shape> {
        let mut seen = vec![false; self.ndim()];
        if order.len() != self.ndim() {
            return Err(KilnError::ShapeMismatch {
                expected: self.dims.to_vec(),
                got: order.to_vec(),
            });
        }
        for &axis in order {
            if axis >= self.ndim() || seen[axis] {
                return Err(KilnError::InvalidAxis { axis, ndim: self.ndim() });
            }
            seen[axis] = true;
        }
        Ok(Shape { dims: order.iter().map(|&a| self.dims[a]).collect() })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape { dims: SmallVec::from_vec(dims) }
    }
}
