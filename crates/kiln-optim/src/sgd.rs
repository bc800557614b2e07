use kiln_core::{KilnError, Result, Tensor};

use crate::optimizer::Optimizer;

/// Fixed-rate stochastic gradient descent: `p -= lr * g`.
pub struct SGD {
    lr: f32,
}

impl SGD {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Option<Tensor>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(KilnError::ShapeMismatch { expected: vec![params.len()], got: vec![grads.len()] });
        }

        for (param, grad) in params.iter_mut().zip(grads) {
            let Some(grad) = grad else { continue };
            if grad.dims() != param.dims() {
                return Err(KilnError::ShapeMismatch {
                    expected: param.dims().to_vec(),
                    got: grad.dims().to_vec(),
                });
            }
            for (p, &g) in param.as_mut_slice().iter_mut().zip(grad.as_slice()) {
                *p -= self.lr * g;
            }
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}
