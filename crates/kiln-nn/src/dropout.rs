//! Dropout layer: randomly zeroes elements during training.

use kiln_core::{KilnError, Result, Tensor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::module::Module;

/// Zeroes each element with probability `p` during training and scales the
/// survivors by `1 / (1 - p)`. Identity in eval mode.
pub struct Dropout {
    p: f32,
    training: bool,
    rng: Mutex<StdRng>,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        Self::build(p, StdRng::from_entropy())
    }

    /// Reproducible masks.
    pub fn with_seed(p: f32, seed: u64) -> Result<Self> {
        Self::build(p, StdRng::seed_from_u64(seed))
    }

    fn build(p: f32, rng: StdRng) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(KilnError::InvalidConfig(format!("dropout probability {p} outside [0, 1)")));
        }
        Ok(Self { p, training: true, rng: Mutex::new(rng) })
    }

    /// Drop probability.
    pub fn p(&self) -> f32 {
        self.p
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.training || self.p == 0.0 {
            return Ok(input.clone());
        }

        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = {
            let mut rng = self.rng.lock();
            (0..input.numel()).map(|_| if rng.gen::<f32>() < self.p { 0.0 } else { scale }).collect()
        };
        input.mul(&Tensor::from_vec(mask, input.dims())?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropout_eval_is_identity() {
        let mut d = Dropout::new(0.5).unwrap();
        d.train(false);
        let x = Tensor::ones(&[4, 4]);
        assert_eq!(d.forward(&x).unwrap().as_slice(), x.as_slice());
    }

    #[test]
    fn test_dropout_train_zeroes_and_scales() {
        let d = Dropout::with_seed(0.5, 7).unwrap();
        let y = d.forward(&Tensor::ones(&[1000])).unwrap();
        let zeros = y.as_slice().iter().filter(|&&v| v == 0.0).count();
        assert!(y.as_slice().iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!((300..700).contains(&zeros), "zeros {zeros}");
    }

    #[test]
    fn test_dropout_rejects_bad_probability() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
        assert_eq!(Dropout::new(0.0).unwrap().p(), 0.0);
    }
}
