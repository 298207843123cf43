//! Training loop for the infrared to visible consistency model
//!
//! Each step runs the consistency objective on the online network, applies
//! one Adam update, then moves the EMA shadow towards the online weights.
//! Samples are drawn from the EMA network at step 0 and every
//! `sample.sample_every` steps; checkpoints hold both networks, the optimizer
//! moments and the step counter so a run can be resumed.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor, Var};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::models::unet::{CONFIG_FILE, WEIGHTS_FILE};
use crate::models::{UNet, UNetConfig};
use crate::trainers::adam::Adam;
use crate::trainers::consistency_sampling::ConsistencySampler;
use crate::trainers::consistency_training::ConsistencyTraining;
use crate::trainers::ema::EmaUpdater;
use crate::trainers::image_utils::{create_sample_directory, make_grid, save_image};
use crate::trainers::lr_scheduler::{create_scheduler, LRScheduler};
use crate::trainers::noise_schedule::NoiseSchedule;
use crate::trainers::paired_data_loader::{PairedDataLoader, PairedDataset};
use crate::trainers::TrainingConfig;

const MODEL_DIR: &str = "model";
const EMA_MODEL_DIR: &str = "ema_model";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const STATE_FILE: &str = "training_state.json";

/// Scalars logged for one optimisation step
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub loss: f32,
    pub num_timesteps: usize,
    pub lr: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrainingState {
    global_step: usize,
    learning_rate: f64,
    last_loss: Option<f32>,
    timestamp: String,
}

/// Picks the requested device, or CUDA when available and the CPU otherwise
pub fn select_device(name: Option<&str>) -> Result<Device> {
    let device = match name {
        None => Device::cuda_if_available(0)?,
        Some("cpu") => Device::Cpu,
        Some("cuda") => Device::new_cuda(0)?,
        Some(other) => match other.strip_prefix("cuda:") {
            Some(ordinal) => Device::new_cuda(
                ordinal
                    .parse()
                    .with_context(|| format!("Invalid CUDA ordinal in device {other}"))?,
            )?,
            None => anyhow::bail!("Unknown device {other}, expected cpu, cuda or cuda:<n>"),
        },
    };
    Ok(device)
}

pub struct ICMTrainer {
    config: TrainingConfig,
    device: Device,
    model: UNet,
    ema_model: UNet,
    trainable: Vec<(String, Var)>,
    training: ConsistencyTraining,
    sampler: ConsistencySampler,
    ema: EmaUpdater,
    optimizer: Adam,
    lr_scheduler: Box<dyn LRScheduler>,
    rng: StdRng,
    global_step: usize,
    last_loss: Option<f32>,
}

impl ICMTrainer {
    pub fn new(config: TrainingConfig, device: Device) -> Result<Self> {
        if !device.is_cpu() {
            device.set_seed(config.train.seed)?;
        }
        let schedule = NoiseSchedule::new(config.consistency.clone())?;

        let model = UNet::new(config.model.clone(), &device)?;
        let ema_model = EmaUpdater::init_shadow(&model)?;
        let trainable = model.trainable_vars()?;
        info!(
            "UNet: {} parameters, {} trainable tensors",
            model.num_parameters(),
            trainable.len()
        );

        let optimizer = Adam::new(config.train.adam_params());
        let lr_scheduler = create_scheduler(&config.train.lr_scheduler, config.train.lr);

        Ok(Self {
            rng: StdRng::seed_from_u64(config.train.seed),
            training: ConsistencyTraining::new(schedule.clone()),
            sampler: ConsistencySampler::new(schedule),
            ema: EmaUpdater::new(config.train.ema_decay),
            config,
            device,
            model,
            ema_model,
            trainable,
            optimizer,
            lr_scheduler,
            global_step: 0,
            last_loss: None,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn model(&self) -> &UNet {
        &self.model
    }

    pub fn ema_model(&self) -> &UNet {
        &self.ema_model
    }

    /// `<output_dir>/<name>`
    pub fn run_dir(&self) -> PathBuf {
        self.config.save.output_dir.join(&self.config.name)
    }

    /// One optimisation step on a `(visible, infrared)` batch
    pub fn train_step(&mut self, visible: &Tensor, infrared: &Tensor) -> Result<StepMetrics> {
        let lr = self.lr_scheduler.get_lr(self.global_step);
        self.optimizer.set_lr(lr);

        let output = self.training.step(
            &self.model,
            infrared,
            visible,
            self.global_step,
            self.config.train.max_steps,
            &mut self.rng,
        )?;
        let loss = output.weighted_loss()?;
        let grads = loss.backward()?;
        self.optimizer.step(&self.trainable, &grads)?;
        self.ema.update(&self.model, &self.ema_model)?;

        let loss = loss.to_scalar::<f32>()?;
        if !loss.is_finite() {
            warn!("Non-finite loss {loss} at step {}", self.global_step);
        }
        self.last_loss = Some(loss);

        Ok(StepMetrics {
            loss,
            num_timesteps: output.num_timesteps,
            lr,
        })
    }

    fn should_sample(&self) -> bool {
        let every = self.config.sample.sample_every;
        every > 0 && (self.global_step == 0 || (self.global_step + 1) % every == 0)
    }

    /// Translates the first images of the batch with the EMA network and
    /// writes grids of the inputs, the ground truth and every sigma sequence
    pub fn sample_and_save(&self, visible: &Tensor, infrared: &Tensor) -> Result<PathBuf> {
        let num = self.config.sample.num_samples.min(visible.dim(0)?).max(1);
        let visible = visible.narrow(0, 0, num)?;
        let infrared = infrared.narrow(0, 0, num)?;
        let noise = visible.randn_like(0.0, 1.0)?;

        let sample_dir = create_sample_directory(&self.run_dir(), self.global_step)?;
        save_image(&make_grid(&infrared, num, 2, -1.0)?, sample_dir.join("infrared.png"))?;
        save_image(&make_grid(&visible, num, 2, -1.0)?, sample_dir.join("ground_truth.png"))?;

        for sigmas in &self.config.sample.sigmas {
            let samples = self.sampler.sample(
                &self.ema_model,
                &noise,
                sigmas,
                &infrared,
                self.config.sample.clip_output,
            )?;
            let label = sigmas
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join("_");
            let path = sample_dir.join(format!("generated_sigmas={label}.png"));
            save_image(&make_grid(&samples.clamp(-1f32, 1f32)?, num, 2, -1.0)?, &path)?;
            debug!("Saved {}", path.display());
        }

        info!("Samples for step {} saved to {}", self.global_step, sample_dir.display());
        Ok(sample_dir)
    }

    /// Writes `checkpoint-<step>/` under the run directory
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let checkpoint_dir = self.run_dir().join(format!("checkpoint-{}", self.global_step));
        fs::create_dir_all(&checkpoint_dir)?;

        self.model.save_pretrained(checkpoint_dir.join(MODEL_DIR))?;
        self.ema_model.save_pretrained(checkpoint_dir.join(EMA_MODEL_DIR))?;
        self.optimizer.save(&checkpoint_dir.join(OPTIMIZER_FILE))?;

        let state = TrainingState {
            global_step: self.global_step,
            learning_rate: self.optimizer.learning_rate(),
            last_loss: self.last_loss,
            timestamp: chrono::Local::now().to_rfc3339(),
        };
        fs::write(checkpoint_dir.join(STATE_FILE), serde_json::to_string_pretty(&state)?)?;

        info!("Saved checkpoint to {}", checkpoint_dir.display());
        self.prune_checkpoints()?;
        Ok(checkpoint_dir)
    }

    /// Removes the oldest step checkpoints beyond `max_step_saves_to_keep`
    fn prune_checkpoints(&self) -> Result<()> {
        let keep = self.config.save.max_step_saves_to_keep;
        if keep == 0 {
            return Ok(());
        }
        let mut checkpoints: Vec<(usize, PathBuf)> = fs::read_dir(self.run_dir())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| {
                let step = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix("checkpoint-")?
                    .parse()
                    .ok()?;
                Some((step, path))
            })
            .collect();
        checkpoints.sort();

        let excess = checkpoints.len().saturating_sub(keep);
        for (_, path) in checkpoints.into_iter().take(excess) {
            fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove old checkpoint {}", path.display()))?;
            debug!("Removed old checkpoint {}", path.display());
        }
        Ok(())
    }

    /// Restores networks, optimizer and step counter from a training checkpoint
    pub fn resume(&mut self, checkpoint_dir: &Path) -> Result<()> {
        let saved_config: UNetConfig = serde_json::from_str(
            &fs::read_to_string(checkpoint_dir.join(MODEL_DIR).join(CONFIG_FILE))
                .with_context(|| format!("No model config in {}", checkpoint_dir.display()))?,
        )?;
        if &saved_config != self.model.config() {
            anyhow::bail!(
                "Checkpoint {} was trained with a different model config",
                checkpoint_dir.display()
            );
        }

        for (dir, model) in [(MODEL_DIR, &self.model), (EMA_MODEL_DIR, &self.ema_model)] {
            let tensors =
                candle_core::safetensors::load(checkpoint_dir.join(dir).join(WEIGHTS_FILE), &self.device)?;
            model
                .load_state_dict(&tensors)
                .with_context(|| format!("Failed to load {dir} weights"))?;
        }
        self.optimizer
            .load(&checkpoint_dir.join(OPTIMIZER_FILE), &self.device)?;

        let state: TrainingState =
            serde_json::from_str(&fs::read_to_string(checkpoint_dir.join(STATE_FILE))?)?;
        self.global_step = state.global_step;
        self.last_loss = state.last_loss;
        // advance the stream so a resumed run does not replay the same draws
        self.rng = StdRng::seed_from_u64(self.config.train.seed.wrapping_add(state.global_step as u64));

        info!(
            "Resumed from {} at step {}",
            checkpoint_dir.display(),
            self.global_step
        );
        Ok(())
    }

    /// Runs until `train.max_steps`, then saves the final networks
    pub fn train(&mut self, loader: &mut PairedDataLoader) -> Result<()> {
        let max_steps = self.config.train.max_steps;
        let log_every = self.config.train.log_every.max(1);
        let save_every = self.config.save.save_every;

        info!(
            "Training {} from step {} to {} (batch size {})",
            self.config.name, self.global_step, max_steps, self.config.train.batch_size
        );

        #[cfg(feature = "progress-bar")]
        let pb = {
            let pb = ProgressBar::new(max_steps as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                    .progress_chars("#>-"),
            );
            pb.set_position(self.global_step as u64);
            pb
        };

        while self.global_step < max_steps {
            let (visible, infrared) = loader.next_batch()?;
            let metrics = self.train_step(&visible, &infrared)?;

            if self.global_step % log_every == 0 {
                info!(
                    "step {} | loss {:.6} | num_timesteps {} | lr {:.2e} | epoch {}",
                    self.global_step,
                    metrics.loss,
                    metrics.num_timesteps,
                    metrics.lr,
                    loader.epoch()
                );
            }
            #[cfg(feature = "progress-bar")]
            {
                pb.set_message(format!("loss {:.5} N={}", metrics.loss, metrics.num_timesteps));
                pb.inc(1);
            }

            if self.should_sample() {
                self.sample_and_save(&visible, &infrared)?;
            }

            self.global_step += 1;
            if save_every > 0 && self.global_step % save_every == 0 {
                self.save_checkpoint()?;
            }
        }

        #[cfg(feature = "progress-bar")]
        pb.finish_with_message("done");

        self.save_final()?;
        Ok(())
    }

    /// Online network at the run directory, EMA network in `ema_model/` beneath it
    pub fn save_final(&self) -> Result<()> {
        let run_dir = self.run_dir();
        self.model.save_pretrained(&run_dir)?;
        self.ema_model.save_pretrained(run_dir.join(EMA_MODEL_DIR))?;
        info!("Training complete, final model saved to {}", run_dir.display());
        Ok(())
    }
}

/// Builds the data pipeline and trainer from a config and trains to completion
pub fn run(config: TrainingConfig, resume: Option<&Path>, device: Option<&str>) -> Result<()> {
    let device = select_device(device.or(config.train.device.as_deref()))?;
    info!("Using device {:?}", device);

    let dataset = PairedDataset::new(config.data.clone())
        .with_context(|| format!("Failed to load dataset from {}", config.data.root.display()))?;
    let mut loader = PairedDataLoader::new(
        dataset,
        config.train.batch_size,
        config.train.seed,
        device.clone(),
    );

    let mut trainer = ICMTrainer::new(config, device)?;
    if let Some(checkpoint) = resume {
        trainer.resume(checkpoint)?;
    }
    trainer.train(&mut loader)
}
