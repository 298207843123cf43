//! Building blocks of the conditioned U-Net
//!
//! Residual blocks conditioned on a noise-level embedding, multi-head
//! self-attention, and the pixel-unshuffle / nearest-neighbour resamplers.

use candle_core::{DType, IndexOp, Module, Result, Tensor};
use candle_nn::{
    conv2d, conv2d_no_bias, group_norm, linear, linear_no_bias, Conv2d, Conv2dConfig, GroupNorm,
    Init, Linear, VarBuilder,
};

const GROUP_NORM_EPS: f64 = 1e-5;

fn same_padding(kernel_size: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding: kernel_size / 2,
        ..Default::default()
    }
}

/// GroupNorm with `min(32, channels / 4)` groups
pub fn group_norm_for(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    let groups = (channels / 4).clamp(1, 32);
    group_norm(groups, channels, GROUP_NORM_EPS, vb)
}

/// Zeroes whole channels with probability `p` during training
pub fn channel_dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 {
        return Ok(x.clone());
    }
    let (b, c) = (x.dim(0)?, x.dim(1)?);
    let mut mask_shape = vec![b, c];
    mask_shape.extend(std::iter::repeat(1).take(x.rank() - 2));
    let keep = Tensor::rand(0f32, 1f32, mask_shape, x.device())?
        .ge(p)?
        .to_dtype(x.dtype())?;
    let keep = (keep / (1.0 - p as f64))?;
    x.broadcast_mul(&keep)
}

/// Random Fourier features of the noise level followed by an MLP
pub struct NoiseLevelEmbedding {
    w: Tensor,
    fc1: Linear,
    fc2: Linear,
}

impl NoiseLevelEmbedding {
    pub fn new(channels: usize, scale: f64, vb: VarBuilder) -> Result<Self> {
        let w = vb.get_with_hints(
            channels / 2,
            "W",
            Init::Randn {
                mean: 0.0,
                stdev: scale,
            },
        )?;
        Ok(Self {
            w,
            fc1: linear(channels, 4 * channels, vb.pp("projection.0"))?,
            fc2: linear(4 * channels, channels, vb.pp("projection.2"))?,
        })
    }

    /// `[B]` noise levels to `[B, C, 1, 1]` embeddings
    pub fn forward(&self, noise_level: &Tensor) -> Result<Tensor> {
        // W is a fixed random projection, never trained
        let w = self.w.detach();
        let h = noise_level
            .unsqueeze(1)?
            .broadcast_mul(&w.unsqueeze(0)?)?
            .affine(2.0 * std::f64::consts::PI, 0.0)?;
        let h = Tensor::cat(&[h.sin()?, h.cos()?], 1)?;
        let h = candle_nn::ops::silu(&self.fc1.forward(&h)?)?;
        let h = self.fc2.forward(&h)?;
        h.unsqueeze(2)?.unsqueeze(3)
    }
}

/// Multi-head self-attention over the spatial positions of a feature map
pub struct SelfAttention {
    norm_in: GroupNorm,
    qkv: Conv2d,
    proj: Linear,
    norm_out: GroupNorm,
    residual: Conv2d,
    n_heads: usize,
    dropout: f32,
}

impl SelfAttention {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        n_heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_channels % n_heads != 0 {
            candle_core::bail!("{in_channels} channels do not split into {n_heads} heads");
        }
        Ok(Self {
            norm_in: group_norm_for(in_channels, vb.pp("qkv_projection.0"))?,
            qkv: conv2d_no_bias(
                in_channels,
                3 * in_channels,
                1,
                Default::default(),
                vb.pp("qkv_projection.1"),
            )?,
            proj: linear_no_bias(in_channels, out_channels, vb.pp("output_projection.1"))?,
            norm_out: group_norm_for(out_channels, vb.pp("output_projection.3"))?,
            residual: conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("residual_projection"),
            )?,
            n_heads,
            dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let head_dim = c / self.n_heads;
        let len = h * w;

        // [B, 3C, H, W] -> [3, B, heads, HW, head_dim]
        let qkv = self.qkv.forward(&self.norm_in.forward(x)?)?;
        let qkv = qkv
            .reshape((b, 3, self.n_heads, head_dim, len))?
            .permute((1, 0, 2, 4, 3))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? / (head_dim as f64).sqrt())?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let attn = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&attn, self.dropout)?
        } else {
            attn
        };
        let out = attn.matmul(&v)?;

        // [B, heads, HW, head_dim] -> [B, HW, C] -> [B, C_out, H, W]
        let out = out.transpose(1, 2)?.reshape((b, len, c))?;
        let out = self.proj.forward(&out)?;
        let c_out = out.dim(2)?;
        let out = out.transpose(1, 2)?.reshape((b, c_out, h, w))?;
        let out = self.norm_out.forward(&out)?;
        let out = channel_dropout(&out, self.dropout, train)?;

        out + self.residual.forward(x)?
    }
}

/// Residual block conditioned on the noise-level embedding, optionally
/// followed by self-attention
pub struct ResidualBlock {
    norm_in: GroupNorm,
    conv_in: Conv2d,
    noise_proj: Conv2d,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    residual: Conv2d,
    attention: Option<SelfAttention>,
    dropout: f32,
}

impl ResidualBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        noise_level_channels: usize,
        dropout: f32,
        attention_heads: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        // attention blocks nest the residual part one level down
        let unet_vb = match attention_heads {
            Some(_) => vb.pp("unet_block"),
            None => vb.clone(),
        };
        let attention = match attention_heads {
            Some(n_heads) => Some(SelfAttention::new(
                out_channels,
                out_channels,
                n_heads,
                dropout,
                vb.pp("self_attention"),
            )?),
            None => None,
        };

        Ok(Self {
            norm_in: group_norm_for(in_channels, unet_vb.pp("input_projection.0"))?,
            conv_in: conv2d(
                in_channels,
                out_channels,
                3,
                same_padding(3),
                unet_vb.pp("input_projection.2"),
            )?,
            noise_proj: conv2d(
                noise_level_channels,
                out_channels,
                1,
                Default::default(),
                unet_vb.pp("noise_level_projection.1"),
            )?,
            norm_out: group_norm_for(out_channels, unet_vb.pp("output_projection.0"))?,
            conv_out: conv2d(
                out_channels,
                out_channels,
                3,
                same_padding(3),
                unet_vb.pp("output_projection.2"),
            )?,
            residual: conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                unet_vb.pp("residual_projection"),
            )?,
            attention,
            dropout,
        })
    }

    pub fn has_attention(&self) -> bool {
        self.attention.is_some()
    }

    pub fn forward(&self, x: &Tensor, noise_emb: &Tensor, train: bool) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm_in.forward(x)?)?;
        let h = channel_dropout(&self.conv_in.forward(&h)?, self.dropout, train)?;
        let emb = self.noise_proj.forward(&candle_nn::ops::silu(noise_emb)?)?;
        let h = h.broadcast_add(&emb)?;

        let h = candle_nn::ops::silu(&self.norm_out.forward(&h)?)?;
        let h = channel_dropout(&self.conv_out.forward(&h)?, self.dropout, train)?;
        let h = (h + self.residual.forward(x)?)?;

        match &self.attention {
            Some(attention) => attention.forward(&h, train),
            None => Ok(h),
        }
    }
}

/// Pixel-unshuffle by 2 followed by a 1x1 projection back to `channels`
pub struct Downsample {
    projection: Conv2d,
}

impl Downsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: conv2d(4 * channels, channels, 1, Default::default(), vb.pp("projection.1"))?,
        })
    }
}

/// `b c (h 2) (w 2) -> b (c 2 2) h w`
fn pixel_unshuffle(x: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if h % 2 != 0 || w % 2 != 0 {
        candle_core::bail!("cannot downsample odd spatial size {h}x{w}");
    }
    x.reshape((b, c, h / 2, 2, w / 2, 2))?
        .permute((0, 1, 3, 5, 2, 4))?
        .reshape((b, c * 4, h / 2, w / 2))
}

impl Module for Downsample {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.projection.forward(&pixel_unshuffle(x)?)
    }
}

/// Nearest-neighbour upsample by 2 followed by a 3x3 convolution
pub struct Upsample {
    projection: Conv2d,
}

impl Upsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: conv2d(channels, channels, 3, same_padding(3), vb.pp("projection.1"))?,
        })
    }
}

impl Module for Upsample {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        self.projection.forward(&x.upsample_nearest2d(h * 2, w * 2)?)
    }
}

/// Cast helper used by the network's float-only entry points
pub(crate) fn ensure_f32(x: &Tensor) -> Result<Tensor> {
    if x.dtype() == DType::F32 {
        Ok(x.clone())
    } else {
        x.to_dtype(DType::F32)
    }
}
