//! Train command implementation
//!
//! Trains on deterministic synthetic gratings sized to the configuration and
//! writes `model.safetensors` plus `config.json` into the output directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use hopvae::{DeviceSpec, InMemoryImages, Trainer};
use tracing::info;

use super::{ModelArgs, CONFIG_FILE, WEIGHTS_FILE};

#[derive(Debug, Args)]
pub struct TrainArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Number of synthetic training images
    #[arg(long, default_value = "512")]
    pub train_size: usize,

    /// Number of synthetic test images
    #[arg(long, default_value = "128")]
    pub test_size: usize,

    /// Override the number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Override the batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Override the learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Override the random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Checkpoint directory
    #[arg(short, long, default_value = "checkpoints")]
    pub output: PathBuf,
}

/// Run the train command
pub fn run(args: TrainArgs, device: DeviceSpec) -> Result<()> {
    let mut run = args.model.resolve()?;
    if let Some(epochs) = args.epochs {
        run.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        run.training.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        run.training.learning_rate = learning_rate;
    }
    if let Some(seed) = args.seed {
        run.training.seed = seed;
    }
    run.training.validate()?;

    let device = device.resolve();
    let model = &run.model;
    let seed = run.training.seed;
    let train_set = InMemoryImages::synthetic(
        args.train_size,
        model.num_channels,
        model.image_size,
        seed,
        &device,
    )?;
    let test_set = InMemoryImages::synthetic(
        args.test_size,
        model.num_channels,
        model.image_size,
        seed.wrapping_add(1),
        &device,
    )?;

    let mut trainer = Trainer::new(model, run.training.clone(), &device)?;
    info!(
        train = args.train_size,
        test = args.test_size,
        parameters = trainer.num_parameters(),
        "Generated synthetic data"
    );

    println!();
    println!("{}", "HopVAE training".bold().cyan());
    println!("  Images:      {}×{}×{}", model.num_channels, model.image_size, model.image_size);
    println!("  Head:        {:?}", model.head);
    println!("  Memory:      {} × {}", model.num_embeddings, model.embedding_dim);
    println!("  Parameters:  {}", trainer.num_parameters());
    println!("  Train/Test:  {}/{}", args.train_size, args.test_size);
    println!();

    for _ in 0..run.training.epochs {
        let train_stats = trainer.train_epoch(&train_set)?;
        let eval_stats = trainer.evaluate(&test_set)?;
        println!(
            "{} {:>4}/{}  train {:.5} ({:.5} per image)  test {:.5}",
            "epoch".dimmed(),
            train_stats.epoch + 1,
            run.training.epochs,
            train_stats.mean_batch_loss,
            train_stats.dataset_normalised_loss,
            eval_stats.mean_batch_loss
        );
    }

    fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    trainer.save(args.output.join(WEIGHTS_FILE))?;
    run.save(&args.output.join(CONFIG_FILE))?;
    info!(path = %args.output.display(), "Checkpoint written");

    println!();
    println!("{} {}", "Saved checkpoint to".green(), args.output.display());
    Ok(())
}
