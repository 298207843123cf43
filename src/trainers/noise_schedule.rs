//! Karras noise schedule with a step-count curriculum
//!
//! Provides the discretised sigma sequence used by improved consistency
//! training, the per-interval loss weights and the log-normal importance
//! distribution over adjacent sigma pairs.

use candle_core::{Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConsistencyError, Result};

/// How the number of discretisation steps grows over training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Curriculum {
    /// sqrt of a linear interpolation between the squared endpoints
    Quadratic,
    /// exponential doubling from the initial count, capped at the final count
    Doubling,
}

impl Default for Curriculum {
    fn default() -> Self {
        Curriculum::Quadratic
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseScheduleConfig {
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub rho: f64,
    pub sigma_data: f64,
    pub initial_timesteps: usize,
    pub final_timesteps: usize,
    pub lognormal_mean: f64,
    pub lognormal_std: f64,
    pub curriculum: Curriculum,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            sigma_min: 0.002,
            sigma_max: 80.0,
            rho: 7.0,
            sigma_data: 0.5,
            initial_timesteps: 10,
            final_timesteps: 1280,
            lognormal_mean: -1.1,
            lognormal_std: 2.0,
            curriculum: Curriculum::Quadratic,
        }
    }
}

/// Computes sigma sequences and their sampling weights
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    config: NoiseScheduleConfig,
}

impl NoiseSchedule {
    /// Validates the config up front so a bad schedule never reaches training
    pub fn new(config: NoiseScheduleConfig) -> Result<Self> {
        let schedule = Self { config };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn config(&self) -> &NoiseScheduleConfig {
        &self.config
    }

    pub fn sigma_min(&self) -> f64 {
        self.config.sigma_min
    }

    pub fn sigma_max(&self) -> f64 {
        self.config.sigma_max
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.config;
        if !(c.sigma_min > 0.0) {
            return Err(ConsistencyError::InvalidScheduleConfig(format!(
                "sigma_min must be positive, got {}",
                c.sigma_min
            )));
        }
        if c.sigma_min >= c.sigma_max {
            return Err(ConsistencyError::InvalidScheduleConfig(format!(
                "sigma_min ({}) must be below sigma_max ({})",
                c.sigma_min, c.sigma_max
            )));
        }
        if !(c.rho > 0.0) || !(c.sigma_data > 0.0) || !(c.lognormal_std > 0.0) {
            return Err(ConsistencyError::InvalidScheduleConfig(
                "rho, sigma_data and lognormal_std must be positive".to_string(),
            ));
        }
        if c.initial_timesteps < 2 {
            return Err(ConsistencyError::InvalidScheduleConfig(format!(
                "initial_timesteps must be at least 2, got {}",
                c.initial_timesteps
            )));
        }
        if c.final_timesteps < c.initial_timesteps {
            return Err(ConsistencyError::InvalidScheduleConfig(format!(
                "final_timesteps ({}) is below initial_timesteps ({})",
                c.final_timesteps, c.initial_timesteps
            )));
        }
        Ok(())
    }

    /// Number of discretisation steps at `step` out of `max_steps`
    pub fn discretization_steps(&self, step: usize, max_steps: usize) -> usize {
        let s0 = self.config.initial_timesteps;
        let s1 = self.config.final_timesteps;
        if max_steps == 0 || step >= max_steps {
            return s1;
        }

        let n = match self.config.curriculum {
            Curriculum::Quadratic => {
                let t = step as f64 / max_steps as f64;
                let (a, b) = (s0 as f64, s1 as f64);
                (a * a + t * (b * b - a * a)).sqrt().round() as usize
            }
            Curriculum::Doubling => {
                let doublings = ((s1 / s0) as f64).log2() + 1.0;
                let stage_len = ((max_steps as f64 / doublings).floor() as usize).max(1);
                let exponent = (step / stage_len).min(usize::BITS as usize - 1) as u32;
                s0.saturating_mul(1usize << exponent)
            }
        };

        n.clamp(s0, s1)
    }

    /// Increasing Karras sigmas; the endpoints are exactly sigma_min and sigma_max
    pub fn sigmas_for(&self, num_steps: usize) -> Vec<f64> {
        let c = &self.config;
        match num_steps {
            0 => Vec::new(),
            1 => vec![c.sigma_max],
            n => {
                let rho_inv = 1.0 / c.rho;
                let lo = c.sigma_min.powf(rho_inv);
                let hi = c.sigma_max.powf(rho_inv);
                (0..n)
                    .map(|i| {
                        if i == 0 {
                            c.sigma_min
                        } else if i == n - 1 {
                            c.sigma_max
                        } else {
                            let frac = i as f64 / (n - 1) as f64;
                            (lo + frac * (hi - lo)).powf(c.rho)
                        }
                    })
                    .collect()
            }
        }
    }

    /// `1 / (sigma[k+1] - sigma[k])` for every adjacent pair
    pub fn loss_weights(sigmas: &[f64]) -> Vec<f64> {
        sigmas.windows(2).map(|w| 1.0 / (w[1] - w[0])).collect()
    }

    /// Log-normal mass of each interval `[sigma[k], sigma[k+1]]`, normalised
    pub fn timestep_distribution(&self, sigmas: &[f64]) -> Result<Vec<f64>> {
        if sigmas.len() < 2 {
            return Err(ConsistencyError::InvalidScheduleConfig(format!(
                "need at least 2 sigmas to sample an interval, got {}",
                sigmas.len()
            )));
        }

        let scale = 1.0 / (self.config.lognormal_std * std::f64::consts::SQRT_2);
        let shift = -self.config.lognormal_mean * scale;
        let cdf = Tensor::from_slice(sigmas, sigmas.len(), &Device::Cpu)?
            .log()?
            .affine(scale, shift)?
            .erf()?
            .to_vec1::<f64>()?;

        let mass: Vec<f64> = cdf.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect();
        let total: f64 = mass.iter().sum();
        if !(total > 0.0) {
            return Err(ConsistencyError::InvalidScheduleConfig(
                "log-normal timestep distribution has no mass over the schedule".to_string(),
            ));
        }

        Ok(mass.into_iter().map(|m| m / total).collect())
    }

    /// Draws `num_samples` interval indices `k` in `[0, sigmas.len() - 2]`
    pub fn sample_timesteps<R: Rng + ?Sized>(
        &self,
        sigmas: &[f64],
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let pdf = self.timestep_distribution(sigmas)?;
        let dist = WeightedIndex::new(&pdf)
            .map_err(|e| ConsistencyError::InvalidScheduleConfig(e.to_string()))?;
        Ok((0..num_samples).map(|_| dist.sample(rng)).collect())
    }

    /// Boundary-condition skip scaling, exactly 1 at sigma_min
    pub fn c_skip(&self, sigma: f64) -> f64 {
        let sd2 = self.config.sigma_data * self.config.sigma_data;
        let d = sigma - self.config.sigma_min;
        sd2 / (d * d + sd2)
    }

    /// Boundary-condition output scaling, exactly 0 at sigma_min
    pub fn c_out(&self, sigma: f64) -> f64 {
        let sd = self.config.sigma_data;
        sd * (sigma - self.config.sigma_min) / (sd * sd + sigma * sigma).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn schedule(initial: usize, final_: usize) -> NoiseSchedule {
        NoiseSchedule::new(NoiseScheduleConfig {
            initial_timesteps: initial,
            final_timesteps: final_,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_two_sigmas_are_the_endpoints() {
        let s = schedule(2, 11);
        assert_eq!(s.sigmas_for(2), vec![0.002, 80.0]);
        assert_eq!(s.sigmas_for(1), vec![80.0]);
    }

    #[test]
    fn test_sigmas_strictly_increasing_within_bounds() {
        let s = schedule(2, 11);
        for n in 2..40 {
            let sigmas = s.sigmas_for(n);
            assert_eq!(sigmas.len(), n);
            assert!(sigmas.windows(2).all(|w| w[0] < w[1]));
            assert!(sigmas.iter().all(|&v| (0.002..=80.0).contains(&v)));
        }
    }

    #[test]
    fn test_curriculum_endpoints() {
        let s = schedule(2, 11);
        assert_eq!(s.discretization_steps(0, 100), 2);
        assert_eq!(s.discretization_steps(100, 100), 11);

        let mut prev = 0;
        for step in 0..=100 {
            let n = s.discretization_steps(step, 100);
            assert!(n >= prev && (2..=11).contains(&n));
            prev = n;
        }
    }

    #[test]
    fn test_doubling_curriculum_endpoints() {
        let s = NoiseSchedule::new(NoiseScheduleConfig {
            initial_timesteps: 10,
            final_timesteps: 1280,
            curriculum: Curriculum::Doubling,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.discretization_steps(0, 8000), 10);
        assert_eq!(s.discretization_steps(1000, 8000), 20);
        assert_eq!(s.discretization_steps(8000, 8000), 1280);
    }

    #[test]
    fn test_invalid_configs_fail_fast() {
        let bad_sigmas = NoiseScheduleConfig {
            sigma_min: 80.0,
            sigma_max: 0.002,
            ..Default::default()
        };
        assert!(matches!(
            NoiseSchedule::new(bad_sigmas),
            Err(ConsistencyError::InvalidScheduleConfig(_))
        ));

        let one_step = NoiseScheduleConfig {
            initial_timesteps: 1,
            ..Default::default()
        };
        assert!(matches!(
            NoiseSchedule::new(one_step),
            Err(ConsistencyError::InvalidScheduleConfig(_))
        ));
    }

    #[test]
    fn test_boundary_scalings() {
        let s = schedule(2, 11);
        assert_eq!(s.c_skip(0.002), 1.0);
        assert_eq!(s.c_out(0.002), 0.0);
        assert!(s.c_skip(80.0) < 1e-4);
        assert!(s.c_out(80.0) > 0.49);
    }

    #[test]
    fn test_timestep_distribution_normalised() {
        let s = schedule(10, 1280);
        let sigmas = s.sigmas_for(11);
        let pdf = s.timestep_distribution(&sigmas).unwrap();
        assert_eq!(pdf.len(), 10);
        assert!((pdf.iter().sum::<f64>() - 1.0).abs() < 1e-9);

        let mut rng = StdRng::seed_from_u64(0);
        let ks = s.sample_timesteps(&sigmas, 256, &mut rng).unwrap();
        assert!(ks.iter().all(|&k| k <= 9));
    }

    #[test]
    fn test_timestep_distribution_matches_lognormal_erf() {
        // mean -1.1, std 2: ln(sigma) = -1.1 + 2 * sqrt(2) * a puts the erf argument at a
        let s = schedule(10, 1280);
        let args = [0.0, 0.5, 1.0, 1.5];
        let sigmas: Vec<f64> = args
            .iter()
            .map(|a| (-1.1 + 2.0 * std::f64::consts::SQRT_2 * a).exp())
            .collect();
        let pdf = s.timestep_distribution(&sigmas).unwrap();

        let erf = [0.0, 0.520_499_877_813_046_5, 0.842_700_792_949_714_9, 0.966_105_146_475_310_8];
        let mass: Vec<f64> = erf.windows(2).map(|w| w[1] - w[0]).collect();
        let total: f64 = mass.iter().sum();
        for (got, m) in pdf.iter().zip(&mass) {
            assert!((got - m / total).abs() < 1e-5, "{pdf:?}");
        }

        // mass concentrates on the interval next to the log-normal mode
        assert!(pdf[0] > 0.5 && pdf[2] < 0.13, "{pdf:?}");
        let mut rng = StdRng::seed_from_u64(1);
        let ks = s.sample_timesteps(&sigmas, 4000, &mut rng).unwrap();
        let first = ks.iter().filter(|&&k| k == 0).count();
        let last = ks.iter().filter(|&&k| k == 2).count();
        assert!(first > 3 * last, "{first} vs {last}");
    }

    #[test]
    fn test_loss_weights() {
        let w = NoiseSchedule::loss_weights(&[1.0, 1.5, 3.5]);
        assert_eq!(w, vec![2.0, 0.5]);
    }
}
