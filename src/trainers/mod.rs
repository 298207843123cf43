pub mod adam;
pub mod consistency_sampling;
pub mod consistency_training;
pub mod ema;
pub mod icm_trainer;
pub mod image_utils;
pub mod lr_scheduler;
pub mod noise_schedule;
pub mod paired_data_loader;

// Re-export key types
pub use adam::{Adam, AdamParams};
pub use consistency_sampling::ConsistencySampler;
pub use consistency_training::{pseudo_huber_loss, ConsistencyOutput, ConsistencyTraining};
pub use ema::{update_ema, EmaUpdater};
pub use icm_trainer::ICMTrainer;
pub use lr_scheduler::{create_scheduler, LRScheduler, SchedulerConfig};
pub use noise_schedule::{Curriculum, NoiseSchedule, NoiseScheduleConfig};
pub use paired_data_loader::{DataConfig, PairedDataLoader, PairedDataset};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::UNetConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub name: String,
    pub model: UNetConfig,
    pub consistency: NoiseScheduleConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
    pub sample: SampleConfig,
    pub save: SaveConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            name: "llvip512x512_128x128".to_string(),
            model: UNetConfig::default(),
            consistency: NoiseScheduleConfig {
                final_timesteps: 11,
                ..Default::default()
            },
            train: TrainConfig::default(),
            data: DataConfig::default(),
            sample: SampleConfig::default(),
            save: SaveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub max_steps: usize,
    pub lr: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
    pub lr_scheduler: SchedulerConfig,
    pub ema_decay: f64,
    /// Seeds timestep draws and data shuffling; candle's noise draws are
    /// seeded through `Device::set_seed` on accelerators only, so CPU runs
    /// are not bit-for-bit reproducible
    pub seed: u64,
    /// "cpu", "cuda" or "cuda:<ordinal>"; the best available device when unset
    pub device: Option<String>,
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            max_steps: 200_000,
            lr: 1e-4,
            betas: (0.9, 0.995),
            eps: 1e-8,
            weight_decay: 0.0,
            lr_scheduler: SchedulerConfig::default(),
            ema_decay: 0.99993,
            seed: 42,
            device: None,
            log_every: 10,
        }
    }
}

impl TrainConfig {
    pub fn adam_params(&self) -> AdamParams {
        AdamParams {
            learning_rate: self.lr,
            beta1: self.betas.0,
            beta2: self.betas.1,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// 0 disables periodic sampling; step 0 is always sampled otherwise
    pub sample_every: usize,
    pub num_samples: usize,
    pub sigmas: Vec<Vec<f64>>,
    pub clip_output: bool,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            sample_every: 10_000,
            num_samples: 8,
            sigmas: vec![
                vec![80.0],
                vec![80.0, 0.661],
                vec![80.0, 24.4, 5.84, 0.9, 0.661],
            ],
            clip_output: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub output_dir: PathBuf,
    /// Training checkpoint interval in steps, 0 to only save at the end
    pub save_every: usize,
    pub max_step_saves_to_keep: usize,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("checkpoints"),
            save_every: 10_000,
            max_step_saves_to_keep: 3,
        }
    }
}

pub fn load_config(path: &Path) -> Result<TrainingConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TrainingConfig =
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
name: tiny
model:
  noise_level_channels: 16
consistency:
  final_timesteps: 21
  curriculum: doubling
train:
  batch_size: 2
  lr_scheduler:
    type: constant
sample:
  sigmas: [[80.0, 0.661]]
"#;
        let config: TrainingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "tiny");
        assert_eq!(config.model.noise_level_channels, 16);
        assert_eq!(config.model.channels, 3);
        assert_eq!(config.consistency.final_timesteps, 21);
        assert_eq!(config.consistency.curriculum, Curriculum::Doubling);
        assert_eq!(config.consistency.sigma_max, 80.0);
        assert_eq!(config.train.batch_size, 2);
        assert_eq!(config.train.betas, (0.9, 0.995));
        assert_eq!(config.train.lr_scheduler, SchedulerConfig::Constant);
        assert_eq!(config.sample.sigmas, vec![vec![80.0, 0.661]]);
        assert_eq!(config.data.resize_size, 128);
    }

    #[test]
    fn test_shipped_llvip_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/llvip.yaml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.model, UNetConfig::default());
        assert_eq!(config.consistency.final_timesteps, 11);
        assert_eq!(config.train.ema_decay, 0.99993);
        assert_eq!(config.sample.sigmas.len(), 3);
        assert_eq!(config.data.crop_size, 512);
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(format!("{err}").contains("/nonexistent/config.yaml"));
    }
}
