//! Multi-step consistency sampling and editing
//!
//! Sampling starts from pure noise at the first (largest) sigma and refines
//! the estimate at each following sigma, re-noising between steps. Editing
//! starts from an existing image instead, optionally keeping a masked region
//! fixed.

use candle_core::Tensor;
use log::debug;

use crate::icm_core::DenoisingModel;
use crate::error::{ConsistencyError, Result};
use crate::trainers::consistency_training::boundary_forward;
use crate::trainers::noise_schedule::NoiseSchedule;

pub struct ConsistencySampler {
    schedule: NoiseSchedule,
}

impl ConsistencySampler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self { schedule }
    }

    /// Sigmas must be non-empty, strictly decreasing and no lower than sigma_min
    pub fn validate_sigmas(&self, sigmas: &[f64]) -> Result<()> {
        if sigmas.is_empty() {
            return Err(ConsistencyError::InvalidSigmaSequence(
                "sigma sequence is empty".to_string(),
            ));
        }
        if let Some(&s) = sigmas.iter().find(|&&s| s < self.schedule.sigma_min()) {
            return Err(ConsistencyError::InvalidSigmaSequence(format!(
                "sigma {s} is below sigma_min {}",
                self.schedule.sigma_min()
            )));
        }
        if sigmas.windows(2).any(|w| w[1] >= w[0]) {
            return Err(ConsistencyError::InvalidSigmaSequence(format!(
                "sigmas must be strictly decreasing, got {sigmas:?}"
            )));
        }
        Ok(())
    }

    /// Draws an image from unit `initial_noise` with `sigmas.len()` network evaluations
    pub fn sample<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        initial_noise: &Tensor,
        sigmas: &[f64],
        condition: &Tensor,
        clip_output: bool,
    ) -> Result<Tensor> {
        self.validate_sigmas(sigmas)?;
        let x = (initial_noise * sigmas[0])?;
        self.refine(model, x, sigmas, condition, None, clip_output)
    }

    /// Re-noises `image` to `sigmas[0]` and refines it
    ///
    /// With a mask, pixels where the mask is 0 are restored from `image`
    /// after every step; pixels where it is 1 are generated.
    pub fn edit<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        image: &Tensor,
        sigmas: &[f64],
        condition: &Tensor,
        mask: Option<&Tensor>,
        clip_output: bool,
    ) -> Result<Tensor> {
        self.validate_sigmas(sigmas)?;
        let x = (image + (image.randn_like(0.0, 1.0)? * sigmas[0])?)?;
        let keep = match mask {
            Some(mask) => Some((mask.broadcast_as(image.shape())?.to_dtype(image.dtype())?, image)),
            None => None,
        };
        self.refine(model, x, sigmas, condition, keep, clip_output)
    }

    fn refine<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        mut x: Tensor,
        sigmas: &[f64],
        condition: &Tensor,
        keep: Option<(Tensor, &Tensor)>,
        clip_output: bool,
    ) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let sigma_min = self.schedule.sigma_min();

        for (i, &sigma) in sigmas.iter().enumerate() {
            if i > 0 {
                let scale = (sigma * sigma - sigma_min * sigma_min).sqrt();
                x = (&x + (x.randn_like(0.0, 1.0)? * scale)?)?;
            }
            x = boundary_forward(model, &self.schedule, &x, &vec![sigma; batch], condition, false)?;
            if clip_output {
                x = x.clamp(-1f32, 1f32)?;
            }
            if let Some((mask, original)) = &keep {
                // mask * generated + (1 - mask) * original
                let original: &Tensor = original;
                x = (original + mask.mul(&(&x - original)?)?)?;
            }
            debug!("consistency sampling step {}/{} at sigma {sigma}", i + 1, sigmas.len());
        }

        Ok(x)
    }
}
