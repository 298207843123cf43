//! Model implementations
//!
//! The conditioned denoising U-Net and its building blocks

pub mod unet;
pub mod unet_blocks;

// Re-export key types
pub use unet::{StageBlock, UNet, UNetConfig};
pub use unet_blocks::{Downsample, NoiseLevelEmbedding, ResidualBlock, SelfAttention, Upsample};
