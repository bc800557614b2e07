//! Tape-based reverse-mode autograd.
//!
//! Every differentiable op that sees a tracked input wraps its output in a
//! `GradNode` holding a `GradFn` and strong references to the input nodes.
//! `backward` walks that DAG in reverse topological order, so a node's
//! gradient is complete before it is propagated further.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::KilnError;
use crate::tensor::Tensor;
use crate::Result;

// ============================================================================
// GradFn trait
// ============================================================================

/// Backward rule of one differentiable operation.
pub trait GradFn: Send + Sync {
    /// Gradients for each input, in the order the inputs were recorded.
    /// `None` for inputs that take no gradient.
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;

    /// Name of this gradient function (for debugging).
    fn name(&self) -> &str;
}

// ============================================================================
// GradNode
// ============================================================================

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the autograd graph.
pub struct GradNode {
    pub id: usize,
    grad_fn: Option<Box<dyn GradFn>>,
    inputs: Vec<Option<Arc<GradNode>>>,
    grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    /// Leaf node for a trainable parameter.
    pub fn leaf() -> Arc<Self> {
        Arc::new(Self { id: next_id(), grad_fn: None, inputs: Vec::new(), grad: RwLock::new(None) })
    }

    /// Interior node. `inputs[i]` is `None` when input `i` is untracked.
    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Option<Arc<GradNode>>>) -> Arc<Self> {
        Arc::new(Self { id: next_id(), grad_fn: Some(grad_fn), inputs, grad: RwLock::new(None) })
    }

    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    pub fn name(&self) -> &str {
        self.grad_fn.as_ref().map_or("Leaf", |f| f.name())
    }

    /// Add `grad` into this node's gradient slot.
    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let mut slot = self.grad.write();
        match slot.as_mut() {
            Some(existing) => {
                if existing.dims() != grad.dims() {
                    return Err(KilnError::ShapeMismatch {
                        expected: existing.dims().to_vec(),
                        got: grad.dims().to_vec(),
                    });
                }
                for (acc, &g) in existing.as_mut_slice().iter_mut().zip(grad.as_slice()) {
                    *acc += g;
                }
            }
            None => *slot = Some(grad.detach()),
        }
        Ok(())
    }

    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    pub fn zero_grad(&self) {
        *self.grad.write() = None;
    }

    fn take_grad(&self) -> Option<Tensor> {
        self.grad.write().take()
    }
}

/// Wrap `output` in a graph node when any of `inputs` is tracked.
///
/// `make` is only called when a node is actually recorded, so saved
/// activations are not cloned during inference.
pub fn record<F, G>(output: Tensor, inputs: &[&Tensor], make: F) -> Tensor
where
    F: FnOnce() -> G,
    G: GradFn + 'static,
{
    if !inputs.iter().any(|t| t.tracks_grad()) {
        return output;
    }
    let nodes = inputs
        .iter()
        .map(|t| if t.tracks_grad() { t.grad_node().cloned() } else { None })
        .collect();
    output.with_grad_node(GradNode::with_grad_fn(Box::new(make()), nodes))
}

// ============================================================================
// Backward pass
// ============================================================================

/// Propagate `grad_output` from `root` to every reachable leaf.
///
/// Interior gradients are released once consumed; leaves keep theirs until
/// `zero_grad`.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) -> Result<()> {
    let _guard = NoGradGuard::new();
    root.accumulate_grad(&grad_output)?;

    for node in topological_order(root) {
        let Some(grad_fn) = node.grad_fn.as_ref() else { continue };
        let Some(node_grad) = node.take_grad() else { continue };

        let input_grads = grad_fn.apply(&node_grad)?;
        if input_grads.len() != node.inputs.len() {
            return Err(KilnError::Autograd(format!(
                "{} returned {} gradients for {} inputs",
                grad_fn.name(),
                input_grads.len(),
                node.inputs.len()
            )));
        }

        for (input, grad) in node.inputs.iter().zip(input_grads) {
            if let (Some(input), Some(grad)) = (input, grad) {
                input.accumulate_grad(&grad)?;
            }
        }
    }
    Ok(())
}

/// Reverse DFS post-order: every node appears before the nodes it consumed.
fn topological_order(root: &Arc<GradNode>) -> Vec<Arc<GradNode>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Arc<GradNode>, bool)> = vec![(Arc::clone(root), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for input in node.inputs.iter().flatten() {
            if !visited.contains(&input.id) {
                stack.push((Arc::clone(input), false));
            }
        }
    }

    order.reverse();
    order
}

// ============================================================================
// No-grad scope
// ============================================================================

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Check if gradient recording is currently enabled on this thread.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| {
        let prev = g.get();
        g.set(enabled);
        prev
    })
}

/// RAII guard that disables gradient recording in its scope.
///
/// # Example
/// ```
/// use kiln_core::autograd::{is_grad_enabled, NoGradGuard};
///
/// {
///     let _guard = NoGradGuard::new();
///     assert!(!is_grad_enabled());
/// }
/// assert!(is_grad_enabled());
/// ```
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        let prev = set_grad_enabled(false);
        Self { prev }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}
