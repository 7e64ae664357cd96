//! Architecture configuration
//!
//! [`HopVaeConfig`] fully determines every tensor shape in the model. It is
//! built once, validated, and then only ever borrowed by constructors.

use std::fs;
use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::data::PIXEL_RANGE;
use crate::error::{HopVaeError, Result};

/// Output head selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadConfig {
    /// Decoder emits pixels directly; trained with MSE
    Direct,
    /// Decoder emits discretized logistic mixture parameters
    Mixture {
        /// Number of logistic components per pixel
        num_mixtures: usize,
        /// Number of quantisation levels per channel
        #[serde(default = "default_num_bins")]
        num_bins: usize,
        /// Value of the lowest level
        #[serde(default = "default_low")]
        low: f64,
        /// Value of the highest level
        #[serde(default = "default_high")]
        high: f64,
    },
}

fn default_num_bins() -> usize {
    256
}

fn default_low() -> f64 {
    PIXEL_RANGE.0
}

fn default_high() -> f64 {
    PIXEL_RANGE.1
}

impl HeadConfig {
    /// Mixture head with 256 levels on the 8-bit pixel grid of
    /// [`crate::InMemoryImages::from_pixels`]
    pub fn mixture(num_mixtures: usize) -> Self {
        HeadConfig::Mixture {
            num_mixtures,
            num_bins: default_num_bins(),
            low: default_low(),
            high: default_high(),
        }
    }
}

/// Hopfield bottleneck settings
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HopfieldConfig {
    /// Inverse temperature β; `None` uses `1/sqrt(embedding_dim)`
    #[serde(default)]
    pub scaling: Option<f64>,
    /// Whether β is a trainable parameter
    #[serde(default)]
    pub learn_scaling: bool,
}

/// Target compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSpec {
    /// Host CPU
    #[default]
    Cpu,
    /// CUDA device with the given ordinal
    Cuda(usize),
    /// Metal device with the given ordinal
    Metal(usize),
}

impl DeviceSpec {
    /// Resolve to a candle device, falling back to CPU when the accelerator
    /// is unavailable or not compiled in.
    pub fn resolve(self) -> Device {
        let device = match self {
            DeviceSpec::Cpu => return Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal),
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal),
        };
        device.unwrap_or_else(|e| {
            tracing::warn!("Falling back to CPU, {:?} unavailable: {}", self, e);
            Device::Cpu
        })
    }
}

/// Architecture hyperparameters for [`crate::HopVae`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopVaeConfig {
    /// Side length of the square input images
    pub image_size: usize,
    /// Image channel count (1 for greyscale, 3 for RGB)
    pub num_channels: usize,
    /// Hidden width of encoder and decoder
    pub num_hiddens: usize,
    /// Residual blocks per stack
    pub num_residual_layers: usize,
    /// Bottleneck width inside each residual block
    pub num_residual_hiddens: usize,
    /// Dimension of each query / stored pattern
    pub embedding_dim: usize,
    /// Number of stored patterns in the memory bank
    pub num_embeddings: usize,
    /// Side length of the bottleneck grid
    pub representation_dim: usize,
    /// Output head
    pub head: HeadConfig,
    /// Hopfield bottleneck settings
    #[serde(default)]
    pub hopfield: HopfieldConfig,
}

impl Default for HopVaeConfig {
    fn default() -> Self {
        Self::cifar10()
    }
}

/// `floor((input + 2*padding - kernel) / stride) + 1`, or `None` when the
/// kernel does not fit.
pub(crate) fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Option<usize> {
    let padded = input + 2 * padding;
    if padded < kernel || stride == 0 {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

impl HopVaeConfig {
    /// 32×32 RGB configuration used for CIFAR-10
    pub fn cifar10() -> Self {
        Self {
            image_size: 32,
            num_channels: 3,
            num_hiddens: 128,
            num_residual_layers: 2,
            num_residual_hiddens: 32,
            embedding_dim: 64,
            num_embeddings: 512,
            representation_dim: 8,
            head: HeadConfig::Direct,
            hopfield: HopfieldConfig::default(),
        }
    }

    /// 28×28 greyscale configuration used for MNIST
    pub fn mnist() -> Self {
        Self {
            image_size: 28,
            num_channels: 1,
            num_hiddens: 64,
            num_residual_layers: 2,
            num_residual_hiddens: 32,
            embedding_dim: 64,
            num_embeddings: 512,
            representation_dim: 7,
            head: HeadConfig::Direct,
            hopfield: HopfieldConfig::default(),
        }
    }

    /// Replace the output head
    pub fn with_head(mut self, head: HeadConfig) -> Self {
        self.head = head;
        self
    }

    /// Spatial size of the encoder output for `image_size` inputs
    pub fn encoder_grid_size(&self) -> Option<usize> {
        let size = conv_output_size(self.image_size, 4, 2, 1)?;
        let size = conv_output_size(size, 4, 2, 1)?;
        let size = conv_output_size(size, 3, 1, 1)?;
        conv_output_size(size, 3, 1, 1)
    }

    /// Number of query patterns per image
    pub fn num_patterns(&self) -> usize {
        self.representation_dim * self.representation_dim
    }

    /// Channel count of the final decoder layer
    pub fn decoder_out_channels(&self) -> usize {
        match self.head {
            HeadConfig::Direct => self.num_channels,
            HeadConfig::Mixture { num_mixtures, .. } => {
                num_mixtures * (1 + 2 * self.num_channels)
            }
        }
    }

    /// Inverse temperature used by the bottleneck
    pub fn hopfield_scaling(&self) -> f64 {
        self.hopfield
            .scaling
            .unwrap_or_else(|| 1.0 / (self.embedding_dim as f64).sqrt())
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`HopVaeError::Config`] for zero or malformed sizes and
    /// [`HopVaeError::DimensionMismatch`] when the encoder grid disagrees with
    /// `representation_dim`.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("image_size", self.image_size),
            ("num_channels", self.num_channels),
            ("num_hiddens", self.num_hiddens),
            ("num_residual_hiddens", self.num_residual_hiddens),
            ("embedding_dim", self.embedding_dim),
            ("num_embeddings", self.num_embeddings),
            ("representation_dim", self.representation_dim),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(HopVaeError::config(format!("{} must be positive", name)));
            }
        }

        if self.num_hiddens < 2 || self.num_hiddens % 2 != 0 {
            return Err(HopVaeError::config(format!(
                "num_hiddens must be even and at least 2, got {}",
                self.num_hiddens
            )));
        }

        if let HeadConfig::Mixture {
            num_mixtures,
            num_bins,
            low,
            high,
        } = self.head
        {
            if num_mixtures == 0 {
                return Err(HopVaeError::config("num_mixtures must be positive"));
            }
            if num_bins < 2 {
                return Err(HopVaeError::config(format!(
                    "num_bins must be at least 2, got {}",
                    num_bins
                )));
            }
            if !(low.is_finite() && high.is_finite() && low < high) {
                return Err(HopVaeError::config(format!(
                    "invalid mixture range [{}, {}]",
                    low, high
                )));
            }
        }

        if let Some(beta) = self.hopfield.scaling {
            if !(beta.is_finite() && beta > 0.0) {
                return Err(HopVaeError::config(format!(
                    "Hopfield scaling must be positive and finite, got {}",
                    beta
                )));
            }
        }

        let grid = self.encoder_grid_size().ok_or_else(|| {
            HopVaeError::config(format!(
                "image_size {} is too small for the encoder",
                self.image_size
            ))
        })?;
        if grid != self.representation_dim {
            return Err(HopVaeError::DimensionMismatch {
                what: "representation grid",
                expected: self.representation_dim,
                actual: grid,
            });
        }

        Ok(())
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}
