//! # HopVAE
//!
//! A VQ-VAE style autoencoder whose nearest-neighbour codebook is replaced by
//! a modern Hopfield layer, with an optional discretized logistic mixture
//! output head (the PixelCNN++ likelihood) in place of plain MSE.
//!
//! ## Pipeline
//!
//! 1. [`encoder::Encoder`] downsamples images by 4 into a feature grid
//! 2. a 1×1 convolution projects features to `embedding_dim`
//! 3. [`hopfield::HopfieldLayer`] replaces every grid vector with a soft
//!    retrieval from a learned memory bank
//! 4. [`decoder::Decoder`] upsamples back to image resolution
//! 5. [`OutputHead`] reads the decoder output as pixels or as
//!    [`likelihood::DiscretizedLogisticMixture`] parameters
//!
//! ## Usage
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use hopvae::{ForwardMode, HeadConfig, HopVae, HopVaeConfig};
//! use rand::SeedableRng;
//!
//! # fn main() -> hopvae::Result<()> {
//! let config = HopVaeConfig::cifar10().with_head(HeadConfig::mixture(10));
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let model = HopVae::new(&config, vb)?;
//!
//! let images = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu)?;
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! let log_likelihood = model.forward(&images, ForwardMode::Train, &mut rng)?;
//! assert_eq!(log_likelihood.tensor().dims(), &[2, 3 * 32 * 32]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod head;
pub mod hopfield;
pub mod likelihood;
pub mod model;
pub mod residual;
pub mod training;

pub use config::{DeviceSpec, HeadConfig, HopVaeConfig, HopfieldConfig};
pub use data::{ImageSource, InMemoryImages, PIXEL_RANGE};
pub use error::{HopVaeError, Result};
pub use head::{HeadOutput, OutputHead};
pub use hopfield::HopfieldLayer;
pub use likelihood::{DiscretizedLogisticMixture, MixtureParams, MIN_LOG_SCALE};
pub use model::{ForwardMode, HopVae, Interpolation};
pub use training::{EpochStats, EvalStats, Trainer, TrainingConfig};
