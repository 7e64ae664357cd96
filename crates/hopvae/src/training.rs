//! Reference training loop
//!
//! [`Trainer`] owns the parameters, the model and an AdamW optimizer. Each
//! epoch visits the training images in an order shuffled with
//! `seed + epoch`; evaluation decodes the interpolation of every pair of
//! consecutive test batches and measures it against the first batch of the
//! pair.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::HopVaeConfig;
use crate::data::ImageSource;
use crate::error::{HopVaeError, Result};
use crate::model::{HopVae, Interpolation};

/// Optimisation hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Images per optimizer step
    pub batch_size: usize,
    /// Passes over the training set
    pub epochs: usize,
    /// AdamW learning rate
    pub learning_rate: f64,
    /// AdamW decoupled weight decay
    pub weight_decay: f64,
    /// Seeds shuffling and sampling
    pub seed: u64,
    /// Emit an `info!` line every this many epochs
    pub log_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            epochs: 50,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            seed: 42,
            log_interval: 1,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HopVaeError::config("batch_size must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(HopVaeError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(HopVaeError::config(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Summary of one training epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    /// Average of the per-batch losses
    pub mean_batch_loss: f64,
    /// Sum of per-batch losses divided by the number of images, the figure
    /// historically reported for this model
    pub dataset_normalised_loss: f64,
    pub num_batches: usize,
    pub num_images: usize,
}

/// Summary of an interpolation pass over a test set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalStats {
    /// Average normalised reconstruction error over batch pairs
    pub mean_batch_loss: f64,
    /// Sum of pair errors divided by the number of images
    pub dataset_normalised_loss: f64,
    pub num_pairs: usize,
    /// Pairs whose shapes differed and were passed through unchanged
    pub num_passthrough: usize,
}

/// Owns parameters, model and optimizer
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    varmap: VarMap,
    model: HopVae,
    optimizer: AdamW,
    epoch: usize,
}

impl Trainer {
    /// Build a freshly initialised model on `device`
    pub fn new(
        model_config: &HopVaeConfig,
        config: TrainingConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = HopVae::new(model_config, vb)?;

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: config.weight_decay,
            },
        )?;

        let trainer = Self {
            config,
            device: device.clone(),
            varmap,
            model,
            optimizer,
            epoch: 0,
        };
        info!(
            parameters = trainer.num_parameters(),
            batch_size = trainer.config.batch_size,
            learning_rate = trainer.config.learning_rate,
            "Initialised trainer"
        );
        Ok(trainer)
    }

    /// Build a model and restore its parameters from a safetensors file
    pub fn from_checkpoint(
        model_config: &HopVaeConfig,
        config: TrainingConfig,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let mut trainer = Self::new(model_config, config, device)?;
        trainer.load(path)?;
        Ok(trainer)
    }

    pub fn model(&self) -> &HopVae {
        &self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Epochs completed so far
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Total number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|var| var.elem_count())
            .sum()
    }

    /// One optimizer step on `batch`, returning the loss before the update
    pub fn train_step(&mut self, batch: &Tensor, data_variance: f64) -> Result<f64> {
        let batch = batch.to_device(&self.device)?;
        let loss = self.model.loss(&batch, data_variance)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }

    /// One shuffled pass over `source`
    pub fn train_epoch<S: ImageSource + ?Sized>(&mut self, source: &S) -> Result<EpochStats> {
        if source.is_empty() {
            return Err(HopVaeError::config("training set is empty"));
        }
        let variance = source.data_variance()?;
        let seed = self.config.seed.wrapping_add(self.epoch as u64);

        let mut total = 0.0;
        let mut num_batches = 0;
        for batch in source.batches(self.config.batch_size, Some(seed)) {
            let loss = self.train_step(&batch?, variance)?;
            total += loss;
            num_batches += 1;
            debug!(epoch = self.epoch, batch = num_batches, loss, "Train step");
        }

        let stats = EpochStats {
            epoch: self.epoch,
            mean_batch_loss: total / num_batches as f64,
            dataset_normalised_loss: total / source.len() as f64,
            num_batches,
            num_images: source.len(),
        };
        if self.config.log_interval > 0 && self.epoch % self.config.log_interval == 0 {
            info!(
                epoch = stats.epoch + 1,
                epochs = self.config.epochs,
                loss = stats.mean_batch_loss,
                dataset_normalised = stats.dataset_normalised_loss,
                "Train epoch"
            );
        }
        self.epoch += 1;
        Ok(stats)
    }

    /// Interpolation error over consecutive batches of `source`
    ///
    /// The first pair is the first batch with itself. Mixture outputs are
    /// compared through their mean image.
    pub fn evaluate<S: ImageSource + ?Sized>(&self, source: &S) -> Result<EvalStats> {
        if source.is_empty() {
            return Err(HopVaeError::config("test set is empty"));
        }
        let variance = source.data_variance()?;

        let mut batches = source.batches(self.config.batch_size, None);
        let first = match batches.next() {
            Some(batch) => batch?.to_device(&self.device)?,
            None => return Err(HopVaeError::config("test set is empty")),
        };
        let mut previous = first.clone();

        let mut total = 0.0;
        let mut num_pairs = 0;
        let mut num_passthrough = 0;
        for current in std::iter::once(Ok(first)).chain(batches) {
            let current = current?.to_device(&self.device)?;
            let output = match self.model.interpolate(&previous, &current)? {
                Interpolation::Blended(decoded) => self.model.to_image(&decoded)?,
                Interpolation::ShapeMismatch(unchanged) => {
                    num_passthrough += 1;
                    unchanged
                }
            };
            let error = (output - &previous)?.sqr()?.mean_all()?;
            total += error.to_dtype(DType::F64)?.to_scalar::<f64>()? / variance;
            num_pairs += 1;
            previous = current;
        }

        let stats = EvalStats {
            mean_batch_loss: total / num_pairs as f64,
            dataset_normalised_loss: total / source.len() as f64,
            num_pairs,
            num_passthrough,
        };
        info!(
            loss = stats.mean_batch_loss,
            dataset_normalised = stats.dataset_normalised_loss,
            passthrough = stats.num_passthrough,
            "Evaluation"
        );
        Ok(stats)
    }

    /// Train for the configured number of epochs, evaluating on `test` after
    /// each one
    pub fn fit<S, T>(&mut self, train: &S, test: &T) -> Result<Vec<(EpochStats, EvalStats)>>
    where
        S: ImageSource + ?Sized,
        T: ImageSource + ?Sized,
    {
        let mut history = Vec::with_capacity(self.config.epochs);
        for _ in 0..self.config.epochs {
            let train_stats = self.train_epoch(train)?;
            let eval_stats = self.evaluate(test)?;
            history.push((train_stats, eval_stats));
        }
        Ok(history)
    }

    /// Write all parameters to a safetensors file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap.save(path)?;
        info!(path = %path.display(), "Saved checkpoint");
        Ok(())
    }

    /// Overwrite parameters from a safetensors file written by [`Trainer::save`]
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap.load(path)?;
        info!(path = %path.display(), "Loaded checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryImages;

    fn tiny_config() -> HopVaeConfig {
        HopVaeConfig {
            image_size: 8,
            num_channels: 1,
            num_hiddens: 8,
            num_residual_layers: 1,
            num_residual_hiddens: 4,
            embedding_dim: 4,
            num_embeddings: 16,
            representation_dim: 2,
            ..HopVaeConfig::mnist()
        }
    }

    fn training_config() -> TrainingConfig {
        TrainingConfig {
            batch_size: 4,
            epochs: 2,
            learning_rate: 1e-2,
            ..Default::default()
        }
    }

    fn bank(trainer: &Trainer) -> Vec<f32> {
        let patterns = trainer.model().hopfield().stored_patterns();
        patterns.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn images(count: usize, seed: u64) -> InMemoryImages {
        InMemoryImages::synthetic(count, 1, 8, seed, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.epochs, 50);
        assert_eq!(config.seed, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_batch() {
        let config = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_train_epoch_reports_both_losses() {
        let mut trainer = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        let data = images(10, 0);

        let stats = trainer.train_epoch(&data).unwrap();
        assert_eq!(stats.epoch, 0);
        assert_eq!(stats.num_batches, 3);
        assert_eq!(stats.num_images, 10);
        assert!(stats.mean_batch_loss.is_finite());
        let expected = stats.mean_batch_loss * 3.0 / 10.0;
        assert!((stats.dataset_normalised_loss - expected).abs() < 1e-9);
        assert_eq!(trainer.epoch(), 1);
    }

    #[test]
    fn test_train_step_updates_parameters() {
        let mut trainer = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        let data = images(4, 0);
        let batch = data.batch(&[0, 1, 2, 3]).unwrap();

        let before = bank(&trainer);
        trainer.train_step(&batch, data.data_variance().unwrap()).unwrap();
        assert_ne!(before, bank(&trainer));
    }

    #[test]
    fn test_loss_decreases_on_fixed_batch() {
        let mut trainer = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        let data = images(4, 2);
        let batch = data.batch(&[0, 1, 2, 3]).unwrap();
        let variance = data.data_variance().unwrap();

        let first = trainer.train_step(&batch, variance).unwrap();
        let mut last = first;
        for _ in 0..30 {
            last = trainer.train_step(&batch, variance).unwrap();
        }
        assert!(last < first);
    }

    #[test]
    fn test_evaluate_counts_pairs_and_passthrough() {
        let trainer = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        // batches of 4, 4, 2: pairs (b0,b0), (b0,b1), (b1,b2) where the last
        // pair differs in shape
        let stats = trainer.evaluate(&images(10, 1)).unwrap();
        assert_eq!(stats.num_pairs, 3);
        assert_eq!(stats.num_passthrough, 1);
        assert!(stats.mean_batch_loss.is_finite());
    }

    #[test]
    fn test_fit_runs_all_epochs() {
        let mut trainer = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        let history = trainer.fit(&images(8, 0), &images(4, 1)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].0.epoch, 1);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let mut trainer = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        trainer.train_epoch(&images(4, 0)).unwrap();
        trainer.save(&path).unwrap();

        let restored =
            Trainer::from_checkpoint(&tiny_config(), training_config(), &path, &Device::Cpu)
                .unwrap();
        assert_eq!(bank(&trainer), bank(&restored));
    }

    #[test]
    fn test_constant_images_train_with_mixture_head() {
        let flat = Tensor::zeros((6, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let data = InMemoryImages::new(flat).unwrap();
        assert_eq!(data.data_variance().unwrap(), 0.0);

        let mixture = tiny_config().with_head(crate::HeadConfig::mixture(2));
        let mut trainer = Trainer::new(&mixture, training_config(), &Device::Cpu).unwrap();
        let stats = trainer.train_epoch(&data).unwrap();
        assert!(stats.mean_batch_loss.is_finite());

        let mut direct = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        assert!(matches!(direct.train_epoch(&data), Err(HopVaeError::Config(_))));
    }

    #[test]
    fn test_empty_source_is_rejected() {
        struct Empty;
        impl ImageSource for Empty {
            fn len(&self) -> usize {
                0
            }
            fn image_shape(&self) -> (usize, usize, usize) {
                (1, 8, 8)
            }
            fn batch(&self, _indices: &[usize]) -> Result<Tensor> {
                unreachable!()
            }
            fn data_variance(&self) -> Result<f64> {
                Ok(1.0)
            }
        }

        let mut trainer = Trainer::new(&tiny_config(), training_config(), &Device::Cpu).unwrap();
        assert!(trainer.train_epoch(&Empty).is_err());
        assert!(trainer.evaluate(&Empty).is_err());
    }
}
