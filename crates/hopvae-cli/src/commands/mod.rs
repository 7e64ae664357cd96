//! CLI command implementations for HopVAE
//!
//! - `train` - Train on synthetic data and save a checkpoint
//! - `sample` - Generate images from a checkpoint
//! - `info` - Inspect a configuration

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use hopvae::{DeviceSpec, HeadConfig, HopVaeConfig, TrainingConfig};
use serde::{Deserialize, Serialize};

pub mod info;
pub mod sample;
pub mod train;

/// Parameter file inside a checkpoint directory
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Run configuration file inside a checkpoint directory
pub const CONFIG_FILE: &str = "config.json";

/// Built-in architecture presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// 32×32 RGB
    Cifar10,
    /// 28×28 greyscale
    Mnist,
}

impl Preset {
    fn config(self) -> HopVaeConfig {
        match self {
            Preset::Cifar10 => HopVaeConfig::cifar10(),
            Preset::Mnist => HopVaeConfig::mnist(),
        }
    }
}

/// Everything needed to rebuild a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: HopVaeConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.model.validate()?;
        config.training.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Model selection shared by `train` and `info`
#[derive(Debug, Args)]
pub struct ModelArgs {
    /// Architecture preset
    #[arg(short, long, value_enum, default_value = "cifar10")]
    pub preset: Preset,

    /// JSON run configuration; overrides the preset
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use the mixture likelihood head with this many components
    #[arg(short, long)]
    pub mixtures: Option<usize>,
}

impl ModelArgs {
    /// Resolve preset, file and head override into a validated run config
    pub fn resolve(&self) -> Result<RunConfig> {
        let mut run = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig {
                model: self.preset.config(),
                training: TrainingConfig::default(),
            },
        };
        if let Some(num_mixtures) = self.mixtures {
            run.model.head = HeadConfig::mixture(num_mixtures);
        }
        run.model.validate()?;
        Ok(run)
    }
}

/// Parse `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`
pub fn parse_device(spec: &str) -> Result<DeviceSpec> {
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal
                .parse::<usize>()
                .with_context(|| format!("Invalid device ordinal in '{}'", spec))?;
            (kind, ordinal)
        }
        None => (spec, 0),
    };
    match kind.to_ascii_lowercase().as_str() {
        "cpu" => Ok(DeviceSpec::Cpu),
        "cuda" => Ok(DeviceSpec::Cuda(ordinal)),
        "metal" => Ok(DeviceSpec::Metal(ordinal)),
        other => bail!("Unknown device '{}', expected cpu, cuda or metal", other),
    }
}
