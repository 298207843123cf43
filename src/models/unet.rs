//! Noise-level and image conditioned U-Net
//!
//! The network is conditioned by concatenating the conditioning image with the
//! noisy input along the channel axis. Each encoder/decoder stage is a tagged
//! sequence of residual blocks and resamplers; residual blocks are the only
//! entries that push or pop skip activations.

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder, VarMap};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::icm_core::{DenoisingModel, ModelInputs};
use crate::error::{ConsistencyError, Result};
use crate::models::unet_blocks::{ensure_f32, Downsample, NoiseLevelEmbedding, ResidualBlock, Upsample};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Parameters that are stored in checkpoints but never updated by the optimizer
const FROZEN_PARAMETERS: &[&str] = &["noise_level_embedding.W"];

/// Architecture hyperparameters, persisted as `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    pub channels: usize,
    pub noise_level_channels: usize,
    pub noise_level_scale: f64,
    pub n_heads: usize,
    pub top_blocks_channels: Vec<usize>,
    pub top_blocks_n_blocks_per_resolution: Vec<usize>,
    pub top_blocks_has_resampling: Vec<bool>,
    pub top_blocks_dropout: Vec<f32>,
    pub mid_blocks_channels: Vec<usize>,
    pub mid_blocks_n_blocks_per_resolution: Vec<usize>,
    pub mid_blocks_has_resampling: Vec<bool>,
    pub mid_blocks_dropout: Vec<f32>,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            channels: 3,
            noise_level_channels: 256,
            noise_level_scale: 0.02,
            n_heads: 8,
            top_blocks_channels: vec![128, 128],
            top_blocks_n_blocks_per_resolution: vec![2, 2],
            top_blocks_has_resampling: vec![true, true],
            top_blocks_dropout: vec![0.0, 0.0],
            mid_blocks_channels: vec![256, 512],
            mid_blocks_n_blocks_per_resolution: vec![4, 4],
            mid_blocks_has_resampling: vec![true, false],
            mid_blocks_dropout: vec![0.0, 0.3],
        }
    }
}

impl UNetConfig {
    /// Per-level settings of the top (plain) and mid (attention) stages
    fn levels(&self) -> Result<(Vec<Level>, Vec<Level>)> {
        let top_channels: Vec<usize> = self
            .top_blocks_channels
            .iter()
            .chain(self.mid_blocks_channels.first())
            .copied()
            .collect();
        let mid_channels: Vec<usize> = self
            .mid_blocks_channels
            .iter()
            .chain(self.mid_blocks_channels.last())
            .copied()
            .collect();

        let top = Level::zip(
            "top",
            &top_channels,
            &self.top_blocks_n_blocks_per_resolution,
            &self.top_blocks_has_resampling,
            &self.top_blocks_dropout,
        )?;
        let mid = Level::zip(
            "mid",
            &mid_channels,
            &self.mid_blocks_n_blocks_per_resolution,
            &self.mid_blocks_has_resampling,
            &self.mid_blocks_dropout,
        )?;
        Ok((top, mid))
    }

    /// Spatial reduction factor between input and bottleneck
    pub fn downsampling_factor(&self) -> usize {
        let n = self
            .top_blocks_has_resampling
            .iter()
            .chain(&self.mid_blocks_has_resampling)
            .filter(|&&r| r)
            .count();
        1 << n
    }
}

#[derive(Debug, Clone, Copy)]
struct Level {
    in_channels: usize,
    out_channels: usize,
    n_blocks: usize,
    has_resampling: bool,
    dropout: f32,
}

impl Level {
    fn zip(
        stage: &str,
        channels: &[usize],
        n_blocks: &[usize],
        has_resampling: &[bool],
        dropout: &[f32],
    ) -> Result<Vec<Level>> {
        let n = channels.len().saturating_sub(1);
        if n == 0 || n_blocks.len() != n || has_resampling.len() != n || dropout.len() != n {
            return Err(candle_core::Error::Msg(format!(
                "{stage} stage config is inconsistent: {} channel pairs, {} block counts, {} resampling flags, {} dropouts",
                n,
                n_blocks.len(),
                has_resampling.len(),
                dropout.len()
            ))
            .into());
        }
        Ok((0..n)
            .map(|i| Level {
                in_channels: channels[i],
                out_channels: channels[i + 1],
                n_blocks: n_blocks[i],
                has_resampling: has_resampling[i],
                dropout: dropout[i],
            })
            .collect())
    }
}

/// One entry of a stage; only `Residual` takes part in skip bookkeeping
pub enum StageBlock {
    Residual(ResidualBlock),
    Downsample(Downsample),
    Upsample(Upsample),
}

impl StageBlock {
    pub fn is_residual(&self) -> bool {
        matches!(self, StageBlock::Residual(_))
    }
}

fn build_encoder(
    levels: &[Level],
    noise_level_channels: usize,
    attention_heads: Option<usize>,
    vb: VarBuilder,
) -> candle_core::Result<Vec<StageBlock>> {
    let mut blocks = Vec::new();
    for level in levels {
        let mut in_channels = level.in_channels;
        for _ in 0..level.n_blocks {
            blocks.push(StageBlock::Residual(ResidualBlock::new(
                in_channels,
                level.out_channels,
                noise_level_channels,
                level.dropout,
                attention_heads,
                vb.pp(blocks.len()),
            )?));
            in_channels = level.out_channels;
        }
        if level.has_resampling {
            blocks.push(StageBlock::Downsample(Downsample::new(
                level.out_channels,
                vb.pp(blocks.len()),
            )?));
        }
    }
    Ok(blocks)
}

fn build_decoder(
    levels: &[Level],
    noise_level_channels: usize,
    attention_heads: Option<usize>,
    vb: VarBuilder,
) -> candle_core::Result<Vec<StageBlock>> {
    let mut blocks = Vec::new();
    for level in levels.iter().rev() {
        // decoder runs the level backwards: in = the level's output width
        let in_channels = level.out_channels;
        if level.has_resampling {
            blocks.push(StageBlock::Upsample(Upsample::new(in_channels, vb.pp(blocks.len()))?));
        }

        // every block but the last keeps the width; the last maps back down
        for i in 0..level.n_blocks {
            let out_channels = if i + 1 == level.n_blocks {
                level.in_channels
            } else {
                in_channels
            };
            blocks.push(StageBlock::Residual(ResidualBlock::new(
                in_channels * 2,
                out_channels,
                noise_level_channels,
                level.dropout,
                attention_heads,
                vb.pp(blocks.len()),
            )?));
        }
    }
    Ok(blocks)
}

/// Encoder fold: residual outputs are pushed onto `skips`
fn run_encoder(
    blocks: &[StageBlock],
    h: Tensor,
    noise_emb: &Tensor,
    skips: &mut Vec<Tensor>,
    train: bool,
) -> candle_core::Result<Tensor> {
    blocks.iter().try_fold(h, |h, block| match block {
        StageBlock::Residual(b) => {
            let h = b.forward(&h, noise_emb, train)?;
            skips.push(h.clone());
            Ok(h)
        }
        StageBlock::Downsample(d) => d.forward(&h),
        StageBlock::Upsample(u) => u.forward(&h),
    })
}

/// Decoder fold: residual inputs are concatenated with the popped skip
fn run_decoder(
    blocks: &[StageBlock],
    h: Tensor,
    noise_emb: &Tensor,
    skips: &mut Vec<Tensor>,
    train: bool,
) -> candle_core::Result<Tensor> {
    blocks.iter().try_fold(h, |h, block| match block {
        StageBlock::Residual(b) => {
            let skip = skips
                .pop()
                .ok_or_else(|| candle_core::Error::Msg("decoder ran out of skip activations".into()))?;
            b.forward(&Tensor::cat(&[&h, &skip], 1)?, noise_emb, train)
        }
        StageBlock::Downsample(d) => d.forward(&h),
        StageBlock::Upsample(u) => u.forward(&h),
    })
}

/// The denoiser `F(x, sigma, condition)`, owning its parameter table
pub struct UNet {
    config: UNetConfig,
    varmap: VarMap,
    device: Device,
    input_projection: Conv2d,
    noise_level_embedding: NoiseLevelEmbedding,
    top_encoder_blocks: Vec<StageBlock>,
    mid_encoder_blocks: Vec<StageBlock>,
    mid_decoder_blocks: Vec<StageBlock>,
    top_decoder_blocks: Vec<StageBlock>,
    output_projection: Conv2d,
}

impl UNet {
    /// Builds a freshly initialised network
    pub fn new(config: UNetConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let (top, mid) = config.levels()?;
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let input_projection = conv2d(
            config.channels * 2,
            config.top_blocks_channels[0],
            3,
            padded,
            vb.pp("input_projection"),
        )?;
        let noise_level_embedding = NoiseLevelEmbedding::new(
            config.noise_level_channels,
            config.noise_level_scale,
            vb.pp("noise_level_embedding"),
        )?;
        let nlc = config.noise_level_channels;
        let heads = Some(config.n_heads);
        let top_encoder_blocks = build_encoder(&top, nlc, None, vb.pp("top_encoder_blocks"))?;
        let mid_encoder_blocks = build_encoder(&mid, nlc, heads, vb.pp("mid_encoder_blocks"))?;
        let mid_decoder_blocks = build_decoder(&mid, nlc, heads, vb.pp("mid_decoder_blocks"))?;
        let top_decoder_blocks = build_decoder(&top, nlc, None, vb.pp("top_decoder_blocks"))?;
        let output_projection = conv2d(
            config.top_blocks_channels[0],
            config.channels,
            3,
            padded,
            vb.pp("output_projection"),
        )?;

        debug!(
            "Built UNet with {} parameter tensors",
            varmap.all_vars().len()
        );

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            input_projection,
            noise_level_embedding,
            top_encoder_blocks,
            mid_encoder_blocks,
            mid_decoder_blocks,
            top_decoder_blocks,
            output_projection,
        })
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Raw network prediction, without boundary-condition scaling
    pub fn forward(
        &self,
        x: &Tensor,
        noise_level: &Tensor,
        condition: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        if x.dims() != condition.dims() {
            candle_core::bail!(
                "noisy input {:?} and condition {:?} must share a shape",
                x.dims(),
                condition.dims()
            );
        }
        let (_, _, h, w) = x.dims4()?;
        let factor = self.config.downsampling_factor();
        if h % factor != 0 || w % factor != 0 {
            candle_core::bail!("spatial size {h}x{w} is not divisible by {factor}");
        }

        let x = Tensor::cat(&[ensure_f32(x)?, ensure_f32(condition)?], 1)?;
        let h = self.input_projection.forward(&x)?;
        let noise_emb = self.noise_level_embedding.forward(&ensure_f32(noise_level)?)?;

        let mut top_skips = Vec::new();
        let mut mid_skips = Vec::new();
        let h = run_encoder(&self.top_encoder_blocks, h, &noise_emb, &mut top_skips, train)?;
        let h = run_encoder(&self.mid_encoder_blocks, h, &noise_emb, &mut mid_skips, train)?;
        let h = run_decoder(&self.mid_decoder_blocks, h, &noise_emb, &mut mid_skips, train)?;
        let h = run_decoder(&self.top_decoder_blocks, h, &noise_emb, &mut top_skips, train)?;

        self.output_projection.forward(&h)
    }

    /// All parameters keyed by name, sorted for deterministic iteration
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| ConsistencyError::LockPoisoned)?;
        let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Parameters updated by the optimizer
    pub fn trainable_vars(&self) -> Result<Vec<(String, Var)>> {
        Ok(self
            .named_vars()?
            .into_iter()
            .filter(|(name, _)| !FROZEN_PARAMETERS.contains(&name.as_str()))
            .collect())
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Snapshot of every parameter value
    ///
    /// Values are copied out of the variables' storage, so later `Var::set`
    /// calls from the optimizer or the EMA update leave them untouched.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        self.named_vars()?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrites parameters in place; names and shapes must match exactly
    pub fn load_state_dict(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.named_vars()? {
            let tensor = tensors
                .get(&name)
                .ok_or_else(|| ConsistencyError::MissingParameter(name.clone()))?;
            if tensor.dims() != var.dims() {
                return Err(ConsistencyError::ShapeMismatch {
                    name,
                    expected: var.dims().to_vec(),
                    found: tensor.dims().to_vec(),
                });
            }
            let value = tensor.to_device(&self.device)?.to_dtype(var.dtype())?;
            var.set(&value)?;
        }
        Ok(())
    }

    /// Separately constructed network holding a copy of this one's parameters
    pub fn try_clone(&self) -> Result<Self> {
        let copy = Self::new(self.config.clone(), &self.device)?;
        copy.load_state_dict(&self.state_dict()?)?;
        Ok(copy)
    }

    /// Writes `config.json` and `model.safetensors` into `dir`
    pub fn save_pretrained<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&self.config)?)?;
        candle_core::safetensors::save(&self.state_dict()?, dir.join(WEIGHTS_FILE))?;
        info!("Saved UNet to {}", dir.display());
        Ok(())
    }

    /// Rebuilds the architecture from `config.json`, then loads the weights
    pub fn from_pretrained<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config: UNetConfig = serde_json::from_str(&fs::read_to_string(dir.join(CONFIG_FILE))?)?;
        let model = Self::new(config, device)?;
        let tensors = candle_core::safetensors::load(dir.join(WEIGHTS_FILE), device)?;
        model.load_state_dict(&tensors)?;
        info!("Loaded UNet from {}", dir.display());
        Ok(model)
    }
}

impl DenoisingModel for UNet {
    fn forward(&self, inputs: &ModelInputs) -> candle_core::Result<Tensor> {
        UNet::forward(
            self,
            inputs.sample,
            inputs.noise_level,
            inputs.condition,
            inputs.train,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Smallest config exercising every block kind
    pub(crate) fn tiny_config() -> UNetConfig {
        UNetConfig {
            channels: 3,
            noise_level_channels: 16,
            noise_level_scale: 0.02,
            n_heads: 2,
            top_blocks_channels: vec![8],
            top_blocks_n_blocks_per_resolution: vec![1],
            top_blocks_has_resampling: vec![true],
            top_blocks_dropout: vec![0.0],
            mid_blocks_channels: vec![16],
            mid_blocks_n_blocks_per_resolution: vec![1],
            mid_blocks_has_resampling: vec![false],
            mid_blocks_dropout: vec![0.0],
        }
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let model = UNet::new(tiny_config(), &device)?;
        let x = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &device)?;
        let cond = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &device)?;
        let sigma = Tensor::new(&[0.1f32, 40.0], &device)?;
        let out = model.forward(&x, &sigma, &cond, false)?;
        assert_eq!(out.dims(), &[2, 3, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_default_config_topology() -> Result<()> {
        let config = UNetConfig::default();
        let (top, mid) = config.levels()?;
        assert_eq!(top.len(), 2);
        assert_eq!((top[1].in_channels, top[1].out_channels), (128, 256));
        assert_eq!((mid[1].in_channels, mid[1].out_channels), (512, 512));
        assert_eq!(config.downsampling_factor(), 8);
        Ok(())
    }

    #[test]
    fn test_skip_bookkeeping_is_balanced() -> Result<()> {
        let model = UNet::new(tiny_config(), &Device::Cpu)?;
        let count = |blocks: &[StageBlock]| blocks.iter().filter(|b| b.is_residual()).count();
        assert_eq!(count(&model.top_encoder_blocks), count(&model.top_decoder_blocks));
        assert_eq!(count(&model.mid_encoder_blocks), count(&model.mid_decoder_blocks));
        Ok(())
    }

    #[test]
    fn test_frozen_embedding_not_trainable() -> Result<()> {
        let model = UNet::new(tiny_config(), &Device::Cpu)?;
        let all = model.named_vars()?;
        let trainable = model.trainable_vars()?;
        assert_eq!(all.len(), trainable.len() + 1);
        assert!(all.iter().any(|(n, _)| n == "noise_level_embedding.W"));
        Ok(())
    }

    #[test]
    fn test_save_load_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let model = UNet::new(tiny_config(), &device)?;
        model.save_pretrained(dir.path())?;
        let loaded = UNet::from_pretrained(dir.path(), &device)?;
        assert_eq!(loaded.config(), model.config());

        let original = model.state_dict()?;
        for (name, tensor) in loaded.state_dict()? {
            let a: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
            let b: Vec<f32> = original[&name].flatten_all()?.to_vec1()?;
            assert_eq!(a, b, "parameter {name} differs");
        }

        let x = Tensor::randn(0f32, 1f32, (1, 3, 8, 8), &device)?;
        let cond = Tensor::randn(0f32, 1f32, (1, 3, 8, 8), &device)?;
        let sigma = Tensor::new(&[2.5f32], &device)?;
        let a: Vec<f32> = model.forward(&x, &sigma, &cond, false)?.flatten_all()?.to_vec1()?;
        let b: Vec<f32> = loaded.forward(&x, &sigma, &cond, false)?.flatten_all()?.to_vec1()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_state_dict_is_detached_from_updates() -> Result<()> {
        let model = UNet::new(tiny_config(), &Device::Cpu)?;
        let snapshot = model.state_dict()?["output_projection.weight"].clone();
        let before: Vec<f32> = snapshot.flatten_all()?.to_vec1()?;

        let (_, var) = model
            .named_vars()?
            .into_iter()
            .find(|(name, _)| name == "output_projection.weight")
            .unwrap();
        var.set(&var.as_tensor().zeros_like()?)?;

        let after: Vec<f32> = snapshot.flatten_all()?.to_vec1()?;
        assert_eq!(before, after);
        assert!(before.iter().any(|&v| v != 0.0));
        Ok(())
    }

    #[test]
    fn test_load_rejects_mismatched_shapes() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        UNet::new(tiny_config(), &device)?.save_pretrained(dir.path())?;

        // same config file, weights from a wider network
        let mut wider = tiny_config();
        wider.top_blocks_channels = vec![12];
        let other = UNet::new(wider, &device)?;
        candle_core::safetensors::save(&other.state_dict()?, dir.path().join(WEIGHTS_FILE))?;

        match UNet::from_pretrained(dir.path(), &device) {
            Err(ConsistencyError::ShapeMismatch { .. }) => Ok(()),
            Err(e) => panic!("expected ShapeMismatch, got {e}"),
            Ok(_) => panic!("expected ShapeMismatch, load succeeded"),
        }
    }
}
