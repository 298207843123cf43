pub mod error;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::{ConsistencyError, Result};
pub use models::{UNet, UNetConfig};
pub use trainers::{load_config, TrainingConfig};

/// Model-facing types shared by the objective, the sampler and the networks
pub mod icm_core {
    pub use candle_core::{DType, Device, Tensor};

    /// Inputs to one denoiser evaluation
    pub struct ModelInputs<'a> {
        /// Noisy image `[B, C, H, W]`
        pub sample: &'a Tensor,
        /// Per-sample noise standard deviation `[B]`
        pub noise_level: &'a Tensor,
        /// Conditioning image, same shape as `sample`
        pub condition: &'a Tensor,
        pub train: bool,
    }

    /// A network predicting a denoised estimate from a noisy, conditioned input
    pub trait DenoisingModel {
        fn forward(&self, inputs: &ModelInputs) -> candle_core::Result<Tensor>;
    }
}

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger, `info` unless `RUST_LOG` says otherwise
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
