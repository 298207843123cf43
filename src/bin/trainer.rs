//! Infrared to visible consistency model trainer
//!
//! Usage: cargo run --release --bin trainer -- config/llvip.yaml

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train an infrared to visible consistency model")]
struct Args {
    /// Path to the training configuration YAML file
    config: PathBuf,

    /// Resume from a checkpoint-<step> directory
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Override learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Override batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Device to use (cuda, cuda:1, cpu); defaults to the config, then CUDA if available
    #[arg(long)]
    device: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    llvip_icm::logging::init_logger();

    info!("Starting trainer with config: {}", args.config.display());
    let mut config = llvip_icm::load_config(&args.config)?;

    if let Some(lr) = args.lr {
        info!("Overriding learning rate: {lr}");
        config.train.lr = lr;
    }
    if let Some(batch_size) = args.batch_size {
        info!("Overriding batch size: {batch_size}");
        config.train.batch_size = batch_size;
    }
    if let Some(resume) = &args.resume {
        info!("Resuming from: {}", resume.display());
    }

    llvip_icm::trainers::icm_trainer::run(config, args.resume.as_deref(), args.device.as_deref())?;

    info!("Training completed successfully");
    Ok(())
}
