//! HopVAE CLI - train, sample and inspect Hopfield autoencoders
//!
//! ## Commands
//!
//! - `hopvae train` - Train on synthetic gratings and write a checkpoint
//! - `hopvae sample` - Draw images from a checkpoint into a `.npy` file
//! - `hopvae info` - Show a resolved configuration and its derived shapes

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{info, sample, train};

/// HopVAE - autoencoder with an associative-memory bottleneck
#[derive(Parser)]
#[command(name = "hopvae")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Compute device: cpu, cuda[:N] or metal[:N]
    #[arg(long, global = true, env = "HOPVAE_DEVICE", default_value = "cpu")]
    device: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and write a checkpoint directory
    Train(train::TrainArgs),

    /// Sample images from a trained checkpoint
    Sample(sample::SampleArgs),

    /// Show configuration, derived shapes and parameter count
    Info(info::InfoArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let device = commands::parse_device(&cli.device)?;
    tracing::debug!(?device, "Parsed device");

    match cli.command {
        Commands::Train(args) => train::run(args, device),
        Commands::Sample(args) => sample::run(args, device),
        Commands::Info(args) => info::run(args),
    }
}
