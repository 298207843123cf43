//! Learning rate schedules evaluated per optimizer step

use serde::{Deserialize, Serialize};

pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    Constant,
    /// Linear ramp of the multiplier from `start_factor` to 1 over `total_iters`
    LinearWarmup { start_factor: f64, total_iters: usize },
    /// Linear warmup then cosine decay to zero at `total_steps`
    Cosine { warmup_steps: usize, total_steps: usize },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::LinearWarmup {
            start_factor: 1e-5,
            total_iters: 1000,
        }
    }
}

pub fn create_scheduler(config: &SchedulerConfig, base_lr: f64) -> Box<dyn LRScheduler> {
    match *config {
        SchedulerConfig::Constant => Box::new(ConstantScheduler { lr: base_lr }),
        SchedulerConfig::LinearWarmup {
            start_factor,
            total_iters,
        } => Box::new(LinearWarmupScheduler {
            base_lr,
            start_factor,
            total_iters,
        }),
        SchedulerConfig::Cosine {
            warmup_steps,
            total_steps,
        } => Box::new(CosineScheduler {
            base_lr,
            warmup_steps,
            total_steps,
        }),
    }
}

struct ConstantScheduler {
    lr: f64,
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, _step: usize) -> f64 {
        self.lr
    }
}

struct LinearWarmupScheduler {
    base_lr: f64,
    start_factor: f64,
    total_iters: usize,
}

impl LRScheduler for LinearWarmupScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if self.total_iters == 0 || step >= self.total_iters {
            return self.base_lr;
        }
        let progress = step as f64 / self.total_iters as f64;
        self.base_lr * (self.start_factor + (1.0 - self.start_factor) * progress)
    }
}

struct CosineScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step as f64 / self.warmup_steps as f64);
        }
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / span as f64).min(1.0);
        self.base_lr * ((progress * std::f64::consts::PI).cos() + 1.0) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_warmup_endpoints() {
        let s = create_scheduler(&SchedulerConfig::default(), 1e-4);
        assert!((s.get_lr(0) - 1e-9).abs() < 1e-15);
        assert!((s.get_lr(500) - 1e-4 * (1e-5 + (1.0 - 1e-5) * 0.5)).abs() < 1e-15);
        assert_eq!(s.get_lr(1000), 1e-4);
        assert_eq!(s.get_lr(50_000), 1e-4);
    }

    #[test]
    fn test_cosine_decays_to_zero() {
        let s = create_scheduler(
            &SchedulerConfig::Cosine {
                warmup_steps: 10,
                total_steps: 110,
            },
            1.0,
        );
        assert_eq!(s.get_lr(0), 0.0);
        assert!((s.get_lr(10) - 1.0).abs() < 1e-12);
        assert!((s.get_lr(60) - 0.5).abs() < 1e-12);
        assert!(s.get_lr(110).abs() < 1e-12);
        assert!(s.get_lr(500).abs() < 1e-12);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: SchedulerConfig =
            serde_yaml::from_str("type: linear_warmup\nstart_factor: 0.001\ntotal_iters: 20\n").unwrap();
        assert_eq!(
            config,
            SchedulerConfig::LinearWarmup {
                start_factor: 0.001,
                total_iters: 20
            }
        );
        assert_eq!(create_scheduler(&SchedulerConfig::Constant, 0.3).get_lr(7), 0.3);
    }
}
