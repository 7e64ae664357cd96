//! Info command implementation
//!
//! Builds the model on the CPU to report the exact parameter count.

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use colored::Colorize;
use hopvae::{HeadConfig, HopVae};

use super::ModelArgs;

#[derive(Debug, Args)]
pub struct InfoArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Print the resolved configuration as JSON only
    #[arg(long)]
    pub json: bool,
}

/// Run the info command
pub fn run(args: InfoArgs) -> Result<()> {
    let run = args.model.resolve()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    let config = &run.model;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    HopVae::new(config, vb)?;
    let parameters: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();

    let grid = config.representation_dim;
    let size = config.image_size;
    println!();
    println!("{}", "Architecture".bold().cyan());
    println!("  Input:            ({}, {}, {})", config.num_channels, size, size);
    println!("  Hidden width:     {}", config.num_hiddens);
    println!(
        "  Residual stack:   {} × {} channels",
        config.num_residual_layers, config.num_residual_hiddens
    );
    println!("  Embedding grid:   ({}, {}, {})", config.embedding_dim, grid, grid);
    println!(
        "  Query sequence:   ({}, {})",
        config.num_patterns(),
        config.embedding_dim
    );
    println!(
        "  Memory bank:      ({}, {})  β = {:.4}{}",
        config.num_embeddings,
        config.embedding_dim,
        config.hopfield_scaling(),
        if config.hopfield.learn_scaling { " (learned)" } else { "" }
    );
    println!(
        "  Decoder output:   ({}, {}, {})",
        config.decoder_out_channels(),
        size,
        size
    );
    match config.head {
        HeadConfig::Direct => println!("  Head:             direct pixels"),
        HeadConfig::Mixture {
            num_mixtures,
            num_bins,
            low,
            high,
        } => println!(
            "  Head:             {} logistics over {} levels in [{}, {}], sequence {}",
            num_mixtures,
            num_bins,
            low,
            high,
            config.num_channels * size * size
        ),
    }
    println!("  Parameters:       {}", parameters.to_string().bold());

    println!();
    println!("{}", "Training".bold().cyan());
    let training = &run.training;
    println!("  Batch size:       {}", training.batch_size);
    println!("  Epochs:           {}", training.epochs);
    println!("  Learning rate:    {}", training.learning_rate);
    println!("  Seed:             {}", training.seed);
    Ok(())
}
