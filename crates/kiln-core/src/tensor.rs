use std::fmt;
use std::sync::Arc;

use rand::Rng;

use crate::autograd::{self, GradNode};
use crate::device::Device;
use crate::error::KilnError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A contiguous, row-major f32 array with optional gradient tracking.
///
/// Token ids travel as tensors too: each element holds an integral id.
///
/// # Examples
///
/// ```
/// use kiln_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.dims(), &[2, 2]);
///
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.dims(), &[4]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Build a tensor whose element count is already known to match `shape`.
    pub(crate) fn from_parts(data: Vec<f32>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.numel());
        Self { storage: Storage::from_vec(data), shape, requires_grad: false, grad_node: None }
    }

    /// Same buffer under a new shape of equal element count. No grad node.
    pub(crate) fn with_shape(&self, shape: Shape) -> Self {
        debug_assert_eq!(self.numel(), shape.numel());
        Self { storage: self.storage.clone(), shape, requires_grad: false, grad_node: None }
    }

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_parts(data.to_vec(), s)
    }

    /// Fallible variant of [`Tensor::from_f32`] that takes ownership of the buffer.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(KilnError::ShapeMismatch { expected: shape.to_vec(), got: vec![data.len()] });
        }
        Ok(Self::from_parts(data, s))
    }

    /// Create a tensor of token ids.
    pub fn from_ids(ids: &[usize], shape: &[usize]) -> Result<Self> {
        Self::from_vec(ids.iter().map(|&id| id as f32).collect(), shape)
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        Self::from_parts(vec![0.0; s.numel()], s)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        Self::from_parts(vec![value; s.numel()], s)
    }

    /// Samples from N(0, std²) via Box-Muller.
    pub fn randn(shape: &[usize], std: f32) -> Self {
        let s = Shape::new(shape);
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..s.numel())
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos() * std
            })
            .collect();
        Self::from_parts(data, s)
    }

    /// Samples uniformly from `[low, high)`.
    pub fn rand_uniform(shape: &[usize], low: f32, high: f32) -> Self {
        let s = Shape::new(shape);
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..s.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_parts(data, s)
    }

    /// 1-D tensor `[0, 1, ..., len - 1]`, used for position ids.
    pub fn arange(len: usize) -> Self {
        Self::from_parts((0..len).map(|i| i as f32).collect(), Shape::new(&[len]))
    }

    pub fn scalar(value: f32) -> Self {
        Self::from_parts(vec![value], Shape::scalar())
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Dimension sizes, shorthand for `shape().dims()`.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Mark this tensor as a trainable leaf. Creates its leaf `GradNode`.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad && self.grad_node.is_none() {
            self.grad_node = Some(GradNode::leaf());
        }
        if !requires_grad {
            self.grad_node = None;
        }
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    /// Attach a GradNode produced by an op. Marks the tensor as tracked.
    pub fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.grad_node = Some(node);
        self.requires_grad = true;
        self
    }

    /// Accumulated gradient, if backward has reached this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    pub fn zero_grad(&self) {
        if let Some(ref node) = self.grad_node {
            node.zero_grad();
        }
    }

    /// Back-propagate from this tensor, which must hold exactly one element.
    pub fn backward(&self) -> Result<()> {
        if self.numel() != 1 {
            return Err(KilnError::ShapeMismatch { expected: vec![1], got: self.dims().to_vec() });
        }
        let node = self.grad_node.as_ref().ok_or_else(|| {
            KilnError::Autograd("backward() called on tensor without grad tracking".into())
        })?;
        autograd::backward(node, Tensor::scalar(1.0))
    }

    /// Whether ops on this tensor should record a graph node right now.
    pub fn tracks_grad(&self) -> bool {
        self.requires_grad && self.grad_node.is_some() && autograd::is_grad_enabled()
    }

    /// Same data, cut off from the graph.
    pub fn detach(&self) -> Tensor {
        Self { storage: self.storage.clone(), shape: self.shape.clone(), requires_grad: false, grad_node: None }
    }

    // =========================================================================
    // Data access
    // =========================================================================

    pub fn as_slice(&self) -> &[f32] {
        self.storage.as_slice()
    }

    /// Mutable element access. Copies the buffer first if it is shared.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.storage.as_mut_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.as_slice().to_vec()
    }

    pub fn get(&self, flat_index: usize) -> Option<f32> {
        self.as_slice().get(flat_index).copied()
    }

    /// Value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.numel() != 1 {
            return Err(KilnError::ShapeMismatch { expected: vec![1], got: self.dims().to_vec() });
        }
        Ok(self.as_slice()[0])
    }

    /// Interpret the elements as token ids in `[0, limit)`.
    pub fn to_ids(&self, limit: usize) -> Result<Vec<usize>> {
        self.as_slice()
            .iter()
            .map(|&v| {
                if v < 0.0 || v.fract() != 0.0 || v as usize >= limit {
                    Err(KilnError::IndexOutOfRange { index: v, size: limit })
                } else {
                    Ok(v as usize)
                }
            })
            .collect()
    }

    /// Whether both tensors share one underlying buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.storage.shares_buffer(&other.storage)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, device={}, requires_grad={})",
            self.shape,
            self.device(),
            self.requires_grad,
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.as_slice();
        if data.len() <= 20 {
            write!(f, "tensor({:?}, shape={})", data, self.shape)
        } else {
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape
            )
        }
    }
}
