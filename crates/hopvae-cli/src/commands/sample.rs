//! Sample command implementation

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use hopvae::{DeviceSpec, Trainer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::{RunConfig, CONFIG_FILE, WEIGHTS_FILE};

#[derive(Debug, Args)]
pub struct SampleArgs {
    /// Checkpoint directory written by `hopvae train`
    pub checkpoint: PathBuf,

    /// Number of images to draw
    #[arg(short, long, default_value = "8")]
    pub num_samples: usize,

    /// Random seed
    #[arg(short, long, default_value = "0")]
    pub seed: u64,

    /// Output `.npy` file, shaped (N, C, H, W)
    #[arg(short, long, default_value = "samples.npy")]
    pub output: PathBuf,
}

/// Run the sample command
pub fn run(args: SampleArgs, device: DeviceSpec) -> Result<()> {
    let run = RunConfig::load(&args.checkpoint.join(CONFIG_FILE))?;
    let device = device.resolve();
    let trainer = Trainer::from_checkpoint(
        &run.model,
        run.training,
        args.checkpoint.join(WEIGHTS_FILE),
        &device,
    )?;

    debug!(checkpoint = %args.checkpoint.display(), seed = args.seed, "Restored checkpoint");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let samples = trainer.model().sample(args.num_samples, &mut rng)?;
    samples
        .write_npy(&args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!(
        "{} {} samples {:?} to {}",
        "Wrote".green(),
        args.num_samples,
        samples.dims(),
        args.output.display()
    );
    Ok(())
}
