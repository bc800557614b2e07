//! Trainer: supervised training loop with per-epoch metrics.
//!
//! Each epoch runs one training pass (forward, loss, backward, optimizer
//! step) and, when a validation loader is given, one gradient-free
//! validation pass. Results come back as a [`MetricTable`] with one row per
//! epoch.
//!
//! # Example
//! ```
//! use kiln_core::Tensor;
//! use kiln_data::{DataLoader, TensorDataset};
//! use kiln_nn::{cross_entropy_loss, Linear, Trainer, TrainingConfig};
//!
//! let x = Tensor::randn(&[8, 4], 1.0);
//! let y = Tensor::from_ids(&[0, 1, 2, 0, 1, 2, 0, 1], &[8]).unwrap();
//! let loader = DataLoader::new(Box::new(TensorDataset::new(&x, &y).unwrap()), 4, true, false, Some(1)).unwrap();
//!
//! let config = TrainingConfig::new().with_lr(0.1).with_epochs(2);
//! let mut trainer = Trainer::new(Linear::new(4, 3, true), cross_entropy_loss, config).unwrap();
//! let results = trainer.fit(&loader, None).unwrap();
//!
//! assert_eq!(results.get("training_loss").unwrap().len(), 2);
//! assert!(!results.contains("validation_loss"));
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use kiln_core::autograd::NoGradGuard;
use kiln_core::{Device, Result, Tensor};
use kiln_data::DataLoader;
use kiln_optim::{Optimizer, OptimizerKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::loss::LossFn;
use crate::metrics::{MetricTable, ScoreFn, ScoreFns};
use crate::module::Module;
use crate::serialization::{export_inference_graph, save_module};

/// Where and under which name the trained model is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveConfig {
    pub dir: PathBuf,
    pub model_name: String,
}

impl SaveConfig {
    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(format!("{}.safetensors", self.model_name))
    }

    pub fn graph_path(&self) -> PathBuf {
        self.dir.join(format!("{}.graph.json", self.model_name))
    }
}

/// Hyper-parameters and bookkeeping for one call to [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub lr: f32,
    pub optimizer: OptimizerKind,
    pub epochs: usize,
    pub device: Device,
    pub save: Option<SaveConfig>,
    pub score_fns: ScoreFns,
}

impl TrainingConfig {
    /// lr `0.001`, SGD, 2 epochs, CPU, no saving, and a fresh score map
    /// holding `accuracy`.
    pub fn new() -> Self {
        Self {
            lr: 0.001,
            optimizer: OptimizerKind::Sgd,
            epochs: 2,
            device: Device::Cpu,
            save: None,
            score_fns: ScoreFns::with_accuracy(),
        }
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_save(mut self, dir: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        self.save = Some(SaveConfig { dir: dir.into(), model_name: model_name.into() });
        self
    }

    pub fn with_score_fn(mut self, name: impl Into<String>, score: ScoreFn) -> Self {
        self.score_fns.insert(name, score);
        self
    }

    pub fn without_scores(mut self) -> Self {
        self.score_fns = ScoreFns::new();
        self
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Training,
    Validation,
}

impl Phase {
    fn prefix(self) -> &'static str {
        match self {
            Phase::Training => "training",
            Phase::Validation => "validation",
        }
    }
}

/// Outcome of one pass over a loader.
struct EpochPass {
    mean_loss: f64,
    elapsed: f64,
    targets: Vec<f32>,
    predictions: Vec<f32>,
    /// Mismatched prediction widths across batches make scores meaningless.
    consistent: bool,
    last_input: Option<Tensor>,
}

/// Drives a model through epochs of training and validation.
pub struct Trainer<M: Module> {
    model: M,
    loss_fn: LossFn,
    optimizer: Box<dyn Optimizer>,
    config: TrainingConfig,
}

impl<M: Module> Trainer<M> {
    /// Builds the optimizer and creates the save directory when saving is
    /// configured. Non-CPU devices are rejected.
    pub fn new(model: M, loss_fn: LossFn, config: TrainingConfig) -> Result<Self> {
        config.device.ensure_available()?;
        if let Some(save) = &config.save {
            std::fs::create_dir_all(&save.dir)?;
        }
        let optimizer = config.optimizer.build(config.lr);
        Ok(Self { model, loss_fn, optimizer, config })
    }

    /// Train for `config.epochs` epochs.
    ///
    /// Columns: `epoch_time`, `training_loss`, `training_<score>` always;
    /// `validation_loss` and `validation_<score>` only with a validation
    /// loader.
    pub fn fit(&mut self, train: &DataLoader, validation: Option<&DataLoader>) -> Result<MetricTable> {
        let mut results = MetricTable::with_columns(self.column_names(validation.is_some()));
        let mut sample_input = None;

        for epoch in 0..self.config.epochs {
            self.model.train(true);
            let pass = self.run_epoch(train, Phase::Training)?;
            self.record(&mut results, Phase::Training, &pass);
            sample_input = pass.last_input.clone().or(sample_input);

            let mut validation_loss = None;
            if let Some(loader) = validation {
                self.model.train(false);
                let _guard = NoGradGuard::new();
                let val = self.run_epoch(loader, Phase::Validation)?;
                self.record(&mut results, Phase::Validation, &val);
                validation_loss = Some(val.mean_loss);
            }

            results.push("epoch_time", pass.elapsed);
            info!(
                epoch = epoch + 1,
                epochs = self.config.epochs,
                training_loss = pass.mean_loss,
                validation_loss = ?validation_loss,
                epoch_time = pass.elapsed,
                "epoch complete"
            );
        }

        if let Some(save) = self.config.save.clone() {
            self.save(&save, sample_input.as_ref())?;
        }
        Ok(results)
    }

    /// Mean loss over `loader` in eval mode, without gradients. Restores
    /// the previous mode.
    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<f64> {
        let was_training = self.model.is_training();
        self.model.train(false);
        let pass = {
            let _guard = NoGradGuard::new();
            self.run_epoch(loader, Phase::Validation)
        };
        self.model.train(was_training);
        Ok(pass?.mean_loss)
    }

    fn column_names(&self, with_validation: bool) -> Vec<String> {
        let mut names = vec!["epoch_time".to_string(), "training_loss".to_string()];
        if with_validation {
            names.push("validation_loss".to_string());
        }
        for name in self.config.score_fns.names() {
            names.push(format!("training_{name}"));
            if with_validation {
                names.push(format!("validation_{name}"));
            }
        }
        names
    }

    fn run_epoch(&mut self, loader: &DataLoader, phase: Phase) -> Result<EpochPass> {
        let scoring = !self.config.score_fns.is_empty();
        let mut losses = Vec::with_capacity(loader.num_batches());
        let mut targets = Vec::new();
        let mut predictions = Vec::new();
        let mut width = None;
        let mut consistent = true;
        let mut last_input = None;

        let start = Instant::now();
        for batch in loader.iter() {
            let output = self.model.forward(&batch.input)?;
            let loss = (self.loss_fn)(&output, &batch.target)?;

            if phase == Phase::Training {
                loss.backward()?;
                let grads: Vec<Option<Tensor>> = self.model.parameters().iter().map(|p| p.grad()).collect();
                self.optimizer.step(&mut self.model.parameters_mut(), &grads)?;
                self.model.zero_grad();
                last_input = Some(batch.input.clone());
            }

            losses.push(loss.item()? as f64);

            if scoring {
                targets.extend_from_slice(batch.target.as_slice());
                let classes = if output.ndim() >= 2 { output.shape().last_dim() } else { 1 };
                consistent &= *width.get_or_insert(classes) == classes;
                if classes > 1 {
                    predictions.extend_from_slice(output.argmax()?.as_slice());
                } else {
                    predictions.extend_from_slice(output.as_slice());
                }
            }
        }
        let elapsed = start.elapsed().as_secs_f64();

        let mean_loss = if losses.is_empty() {
            f64::NAN
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };
        Ok(EpochPass { mean_loss, elapsed, targets, predictions, consistent, last_input })
    }

    fn record(&self, results: &mut MetricTable, phase: Phase, pass: &EpochPass) {
        let prefix = phase.prefix();
        results.push(&format!("{prefix}_loss"), pass.mean_loss);

        for (name, score) in self.config.score_fns.iter() {
            let value = if !pass.consistent || pass.targets.len() != pass.predictions.len() {
                warn!(
                    score = name,
                    phase = prefix,
                    targets = pass.targets.len(),
                    predictions = pass.predictions.len(),
                    "predictions do not line up with targets, recording NaN"
                );
                f64::NAN
            } else {
                match score(&pass.targets, &pass.predictions) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(score = name, phase = prefix, error = %e, "score function failed, recording NaN");
                        f64::NAN
                    }
                }
            };
            results.push(&format!("{prefix}_{name}"), value);
        }
    }

    fn save(&mut self, save: &SaveConfig, sample_input: Option<&Tensor>) -> Result<()> {
        let weights = save.weights_path();
        save_module(&self.model, &weights)?;
        match sample_input {
            Some(sample) => {
                let file_name = weights.file_name().map(|n| n.to_string_lossy().into_owned());
                export_inference_graph(&mut self.model, sample, &save.graph_path(), file_name.as_deref())?;
            }
            None => warn!(model = %save.model_name, "no training batch seen, skipping inference graph export"),
        }
        debug!(dir = %save.dir.display(), model = %save.model_name, "saved trained model");
        Ok(())
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }
}

/// Convenience for ad-hoc score functions.
pub fn score_fn<F>(f: F) -> ScoreFn
where
    F: Fn(&[f32], &[f32]) -> Result<f64> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::cross_entropy_loss;
    use crate::Linear;
    use kiln_core::KilnError;
    use kiln_data::TensorDataset;

    fn loader(n: usize) -> DataLoader {
        let x = Tensor::randn(&[n, 4], 1.0);
        let labels: Vec<usize> = (0..n).map(|i| i % 3).collect();
        let y = Tensor::from_ids(&labels, &[n]).unwrap();
        DataLoader::new(Box::new(TensorDataset::new(&x, &y).unwrap()), 4, false, false, None).unwrap()
    }

    #[test]
    fn test_config_defaults_are_fresh() {
        let mut a = TrainingConfig::new();
        a.score_fns.insert("other", score_fn(|_, _| Ok(0.0)));
        let b = TrainingConfig::new();
        assert_eq!(b.score_fns.names().collect::<Vec<_>>(), vec!["accuracy"]);
        assert_eq!(b.optimizer, OptimizerKind::Sgd);
        assert_eq!(b.epochs, 2);
    }

    #[test]
    fn test_trainer_rejects_unavailable_device() {
        let config = TrainingConfig::new().with_device(Device::Cuda(0));
        assert!(Trainer::new(Linear::new(4, 3, true), cross_entropy_loss, config).is_err());
    }

    #[test]
    fn test_fit_columns_with_validation() {
        let (train, val) = (loader(8), loader(4));
        let config = TrainingConfig::new().with_lr(0.1).with_epochs(3);
        let mut trainer = Trainer::new(Linear::new(4, 3, true), cross_entropy_loss, config).unwrap();
        let results = trainer.fit(&train, Some(&val)).unwrap();

        let columns: Vec<&str> = results.columns().collect();
        assert_eq!(
            columns,
            vec!["epoch_time", "training_loss", "validation_loss", "training_accuracy", "validation_accuracy"]
        );
        assert_eq!(results.num_rows(), 3);
        for acc in results.get("validation_accuracy").unwrap() {
            assert!((0.0..=1.0).contains(acc));
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let x = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0], &[4, 2]);
        let y = Tensor::from_ids(&[0, 1, 0, 1], &[4]).unwrap();
        let train = DataLoader::new(Box::new(TensorDataset::new(&x, &y).unwrap()), 4, false, false, None).unwrap();
        let config = TrainingConfig::new().with_lr(0.5).with_epochs(30).without_scores();
        let mut trainer = Trainer::new(Linear::new(2, 2, true), cross_entropy_loss, config).unwrap();

        let results = trainer.fit(&train, None).unwrap();
        let losses = results.get("training_loss").unwrap();
        assert!(losses[29] < losses[0]);
        assert!(!results.contains("training_accuracy"));
    }

    #[test]
    fn test_failing_score_records_nan() {
        let config = TrainingConfig::new()
            .with_epochs(2)
            .with_score_fn("broken", score_fn(|_, _| Err(KilnError::InvalidConfig("boom".into()))));
        let mut trainer = Trainer::new(Linear::new(4, 3, true), cross_entropy_loss, config).unwrap();
        let results = trainer.fit(&loader(8), None).unwrap();
        assert!(results.get("training_broken").unwrap().iter().all(|v| v.is_nan()));
        assert!(results.get("training_accuracy").unwrap().iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_evaluate_restores_mode() {
        let mut trainer =
            Trainer::new(Linear::new(4, 3, true), cross_entropy_loss, TrainingConfig::new()).unwrap();
        let loss = trainer.evaluate(&loader(4)).unwrap();
        assert!(loss.is_finite());
        assert!(trainer.model().is_training());
        assert!((trainer.lr() - 0.001).abs() < 1e-9);
    }
}
