//! Translate infrared images to visible ones with a trained checkpoint
//!
//! Usage: cargo run --release --bin sample -- --checkpoint checkpoints/llvip512x512_128x128/ema_model \
//!            --input LLVIP/infrared/test --output translated --sigmas 80,0.661

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use llvip_icm::trainers::icm_trainer::select_device;
use llvip_icm::trainers::image_utils::{load_image_tensor, save_image};
use llvip_icm::trainers::{ConsistencySampler, NoiseSchedule, NoiseScheduleConfig};
use llvip_icm::UNet;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sample visible images from infrared inputs")]
struct Args {
    /// Directory holding config.json and model.safetensors
    #[arg(long)]
    checkpoint: PathBuf,

    /// Infrared image, or a directory of them
    #[arg(long)]
    input: PathBuf,

    /// Output directory
    #[arg(long)]
    output: PathBuf,

    /// Comma separated, strictly decreasing noise levels
    #[arg(long, value_delimiter = ',', default_value = "80,0.661")]
    sigmas: Vec<f64>,

    /// Network input size
    #[arg(long, default_value_t = 128)]
    size: u32,

    /// Training config, for the noise schedule section
    #[arg(long)]
    config: Option<PathBuf>,

    /// Visible image directory to edit from instead of sampling from noise,
    /// matched to the inputs by file name
    #[arg(long)]
    init: Option<PathBuf>,

    #[arg(long)]
    device: Option<String>,

    /// Noise seed, applied on accelerators only; CPU draws stay unseeded
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Leave outputs unclamped between steps
    #[arg(long)]
    no_clip: bool,
}

fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = fs::read_dir(input)
        .with_context(|| format!("Failed to read input directory: {}", input.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref(),
                Some("jpg" | "jpeg" | "png" | "bmp")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn main() -> Result<()> {
    let args = Args::parse();
    llvip_icm::logging::init_logger();

    let device = select_device(args.device.as_deref())?;
    if !device.is_cpu() {
        device.set_seed(args.seed)?;
    }

    let schedule_config = match &args.config {
        Some(path) => llvip_icm::load_config(path)?.consistency,
        None => NoiseScheduleConfig::default(),
    };
    let sampler = ConsistencySampler::new(NoiseSchedule::new(schedule_config)?);
    sampler.validate_sigmas(&args.sigmas)?;

    let model = UNet::from_pretrained(&args.checkpoint, &device)
        .with_context(|| format!("Failed to load checkpoint {}", args.checkpoint.display()))?;
    fs::create_dir_all(&args.output)?;

    let inputs = collect_inputs(&args.input)?;
    info!(
        "Translating {} images with sigmas {:?} on {:?}",
        inputs.len(),
        args.sigmas,
        device
    );

    for path in &inputs {
        let file_name = path.file_name().context("Input path has no file name")?;
        let condition = load_image_tensor(path, Some(args.size), &device)?.unsqueeze(0)?;

        let output = match &args.init {
            Some(init_dir) => {
                let init_path = init_dir.join(file_name);
                if !init_path.is_file() {
                    warn!("No init image {}, skipping", init_path.display());
                    continue;
                }
                let image = load_image_tensor(&init_path, Some(args.size), &device)?.unsqueeze(0)?;
                sampler.edit(&model, &image, &args.sigmas, &condition, None, !args.no_clip)?
            }
            None => {
                let noise = condition.randn_like(0.0, 1.0)?;
                sampler.sample(&model, &noise, &args.sigmas, &condition, !args.no_clip)?
            }
        };

        let out_path = args.output.join(file_name).with_extension("png");
        save_image(&output.squeeze(0)?, &out_path)?;
        info!("{} -> {}", path.display(), out_path.display());
    }

    Ok(())
}
