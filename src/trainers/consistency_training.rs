//! Improved consistency training objective
//!
//! One call builds two noisy versions of the target image at adjacent sigmas
//! of the current schedule, evaluates the boundary-conditioned model at both
//! and returns the un-reduced prediction/target pair with its loss weights.

use candle_core::{Device, Tensor};
use log::debug;
use rand::Rng;

use crate::icm_core::{DenoisingModel, ModelInputs};
use crate::error::{ConsistencyError, Result};
use crate::trainers::noise_schedule::NoiseSchedule;

/// Transient result of one training step
pub struct ConsistencyOutput {
    /// Differentiable output `[B, C, H, W]`
    pub predicted: Tensor,
    /// Detached target output `[B, C, H, W]`
    pub target: Tensor,
    /// Per-sample weights `[B, 1, 1, 1]`
    pub loss_weights: Tensor,
    pub num_timesteps: usize,
    pub sigmas: Vec<f64>,
    /// Interval index drawn for each sample
    pub timesteps: Vec<usize>,
}

/// Per-sample column `[B, 1, 1, 1]` on `device`
pub(crate) fn per_sample(values: &[f64], device: &Device) -> candle_core::Result<Tensor> {
    let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    let n = values.len();
    Tensor::from_vec(values, (n, 1, 1, 1), device)
}

/// `c_skip(sigma) * x + c_out(sigma) * F(x, sigma, condition)`
///
/// Collapses to `x` at sigma_min regardless of the network.
pub fn boundary_forward<M: DenoisingModel + ?Sized>(
    model: &M,
    schedule: &NoiseSchedule,
    x: &Tensor,
    sigmas: &[f64],
    condition: &Tensor,
    train: bool,
) -> Result<Tensor> {
    let device = x.device();
    let batch = x.dim(0)?;
    if sigmas.len() != batch {
        return Err(candle_core::Error::Msg(format!(
            "{} sigmas for a batch of {}",
            sigmas.len(),
            batch
        ))
        .into());
    }

    let noise_level = Tensor::from_vec(
        sigmas.iter().map(|&s| s as f32).collect::<Vec<_>>(),
        batch,
        device,
    )?;
    let c_skip: Vec<f64> = sigmas.iter().map(|&s| schedule.c_skip(s)).collect();
    let c_out: Vec<f64> = sigmas.iter().map(|&s| schedule.c_out(s)).collect();

    let prediction = model.forward(&ModelInputs {
        sample: x,
        noise_level: &noise_level,
        condition,
        train,
    })?;

    let skip = x.broadcast_mul(&per_sample(&c_skip, device)?)?;
    let out = prediction.broadcast_mul(&per_sample(&c_out, device)?)?;
    Ok((skip + out)?)
}

/// Smooth L1/L2 interpolation, `c = 0.00054 * sqrt(C * H * W)`, un-reduced
pub fn pseudo_huber_loss(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let dims = input.dims();
    let per_sample: usize = dims.iter().skip(1).product();
    let c = 0.00054 * (per_sample as f64).sqrt();
    let diff = (input - target)?;
    Ok(((diff.sqr()? + c * c)?.sqrt()? - c)?)
}

/// Improved consistency training
pub struct ConsistencyTraining {
    schedule: NoiseSchedule,
}

impl ConsistencyTraining {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Builds prediction and target for one batch
    ///
    /// `condition` is the infrared image, `target` the visible image the
    /// model learns to produce.
    pub fn step<M: DenoisingModel + ?Sized, R: Rng + ?Sized>(
        &self,
        model: &M,
        condition: &Tensor,
        target: &Tensor,
        global_step: usize,
        max_steps: usize,
        rng: &mut R,
    ) -> Result<ConsistencyOutput> {
        let num_timesteps = self.schedule.discretization_steps(global_step, max_steps);
        if num_timesteps < 2 {
            return Err(ConsistencyError::InvalidScheduleConfig(format!(
                "{num_timesteps} discretisation steps at step {global_step}, need at least 2"
            )));
        }
        let sigmas = self.schedule.sigmas_for(num_timesteps);

        let batch = target.dim(0)?;
        let timesteps = self.schedule.sample_timesteps(&sigmas, batch, rng)?;
        let current: Vec<f64> = timesteps.iter().map(|&k| sigmas[k]).collect();
        let next: Vec<f64> = timesteps.iter().map(|&k| sigmas[k + 1]).collect();

        let device = target.device();
        let noise = target.randn_like(0.0, 1.0)?;
        let current_x = (target + noise.broadcast_mul(&per_sample(&current, device)?)?)?;
        let next_x = (target + noise.broadcast_mul(&per_sample(&next, device)?)?)?;

        // gradient through the noisier point only; the target sits nearer the boundary
        let predicted = boundary_forward(model, &self.schedule, &next_x, &next, condition, true)?;
        let target_out =
            boundary_forward(model, &self.schedule, &current_x, &current, condition, true)?
                .detach();

        let weights = NoiseSchedule::loss_weights(&sigmas);
        let sample_weights: Vec<f64> = timesteps.iter().map(|&k| weights[k]).collect();
        let loss_weights = per_sample(&sample_weights, device)?;

        debug!(
            "consistency step {global_step}/{max_steps}: {num_timesteps} timesteps, k = {:?}",
            timesteps
        );

        Ok(ConsistencyOutput {
            predicted,
            target: target_out,
            loss_weights,
            num_timesteps,
            sigmas,
            timesteps,
        })
    }
}

impl ConsistencyOutput {
    /// `mean(pseudo_huber(predicted, target) * loss_weights)`
    pub fn weighted_loss(&self) -> Result<Tensor> {
        let loss = pseudo_huber_loss(&self.predicted, &self.target)?;
        Ok(loss.broadcast_mul(&self.loss_weights)?.mean_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::unet::tests::tiny_config;
    use crate::models::UNet;
    use crate::trainers::noise_schedule::NoiseScheduleConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn schedule() -> NoiseSchedule {
        NoiseSchedule::new(NoiseScheduleConfig {
            initial_timesteps: 2,
            final_timesteps: 11,
            ..Default::default()
        })
        .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_boundary_condition_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let model = UNet::new(tiny_config(), &device)?;
        let s = schedule();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &device)?;
        let cond = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &device)?;
        let out = boundary_forward(&model, &s, &x, &[0.002, 0.002], &cond, false)?;
        assert!(max_abs_diff(&out, &x) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_step_outputs() -> Result<()> {
        let device = Device::Cpu;
        let model = UNet::new(tiny_config(), &device)?;
        let training = ConsistencyTraining::new(schedule());
        let mut rng = StdRng::seed_from_u64(7);

        let visible = Tensor::rand(-1f32, 1f32, (3, 3, 8, 8), &device)?;
        let infrared = Tensor::rand(-1f32, 1f32, (3, 3, 8, 8), &device)?;
        let out = training.step(&model, &infrared, &visible, 0, 100, &mut rng)?;

        assert_eq!(out.num_timesteps, 2);
        assert_eq!(out.sigmas, vec![0.002, 80.0]);
        assert_eq!(out.predicted.dims(), &[3, 3, 8, 8]);
        assert_eq!(out.target.dims(), &[3, 3, 8, 8]);
        assert_eq!(out.loss_weights.dims(), &[3, 1, 1, 1]);

        // only one interval exists, so every weight is 1 / (80 - 0.002)
        let w: Vec<f32> = out.loss_weights.flatten_all()?.to_vec1()?;
        assert!(w.iter().all(|&v| (v - 1.0 / 79.998).abs() < 1e-7));

        let loss = out.weighted_loss()?.to_scalar::<f32>()?;
        assert!(loss.is_finite() && loss >= 0.0);
        Ok(())
    }

    #[test]
    fn test_gradient_flows_through_prediction_only() -> Result<()> {
        let device = Device::Cpu;
        let model = UNet::new(tiny_config(), &device)?;
        let training = ConsistencyTraining::new(schedule());
        let mut rng = StdRng::seed_from_u64(3);

        let visible = Tensor::rand(-1f32, 1f32, (2, 3, 8, 8), &device)?;
        let infrared = Tensor::rand(-1f32, 1f32, (2, 3, 8, 8), &device)?;
        let out = training.step(&model, &infrared, &visible, 50, 100, &mut rng)?;

        let grads = out.weighted_loss()?.backward()?;

        // same values as the target, but a leaf with no graph behind it
        let constant = Tensor::from_vec(
            out.target.flatten_all()?.to_vec1::<f32>()?,
            out.target.shape(),
            &device,
        )?;
        let reference = ConsistencyOutput {
            predicted: out.predicted.clone(),
            target: constant,
            loss_weights: out.loss_weights.clone(),
            num_timesteps: out.num_timesteps,
            sigmas: out.sigmas.clone(),
            timesteps: out.timesteps.clone(),
        };
        let reference_grads = reference.weighted_loss()?.backward()?;

        let mut compared = 0;
        for (name, var) in model.trainable_vars()? {
            match (grads.get(var.as_tensor()), reference_grads.get(var.as_tensor())) {
                (Some(a), Some(b)) => {
                    assert!(max_abs_diff(a, b) < 1e-7, "gradient of {name} differs");
                    compared += 1;
                }
                (None, None) => {}
                _ => panic!("gradient of {name} present in only one pass"),
            }
        }
        assert!(compared > 0);
        Ok(())
    }

    #[test]
    fn test_pseudo_huber_zero_at_equality() -> Result<()> {
        let x = Tensor::randn(0f32, 1f32, (2, 3, 4, 4), &Device::Cpu)?;
        let loss = pseudo_huber_loss(&x, &x)?;
        assert!(loss.abs()?.max_all()?.to_scalar::<f32>()? < 1e-6);

        let y = (&x + 1.0)?;
        let loss = pseudo_huber_loss(&x, &y)?.mean_all()?.to_scalar::<f32>()?;
        let c = 0.00054 * (48f32).sqrt();
        assert!((loss - ((1.0 + c * c).sqrt() - c)).abs() < 1e-5);
        Ok(())
    }
}
