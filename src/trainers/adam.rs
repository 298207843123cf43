//! Adam optimizer with named, persistable moment estimates
//! States are keyed by parameter name so they survive a checkpoint round trip

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{ConsistencyError, Result};

const STEP_METADATA_KEY: &str = "step";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.995,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

pub struct Adam {
    params: AdamParams,
    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,
    step: usize,
}

impl Adam {
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.learning_rate
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.params.learning_rate = lr;
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    /// One optimisation step over every parameter that received a gradient
    pub fn step(&mut self, vars: &[(String, Var)], grads: &GradStore) -> Result<()> {
        self.step += 1;
        let mut updated = 0;
        for (name, var) in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                self.update(name, var, grad)?;
                updated += 1;
            }
        }
        log::trace!("adam step {}: {updated}/{} parameters updated", self.step, vars.len());
        Ok(())
    }

    fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let AdamParams {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;

        let grad = grad.to_dtype(DType::F32)?;
        let grad = if weight_decay > 0.0 {
            (grad + (param.as_tensor().to_dtype(DType::F32)? * weight_decay)?)?
        } else {
            grad
        };

        let m = match self.m.get(name) {
            Some(m) => m.clone(),
            None => grad.zeros_like()?,
        };
        let v = match self.v.get(name) {
            Some(v) => v.clone(),
            None => grad.zeros_like()?,
        };

        let m = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
        let v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        let t = self.step.max(1) as i32;
        let m_hat = (&m / (1.0 - beta1.powi(t)))?;
        let v_hat = (&v / (1.0 - beta2.powi(t)))?;
        let update = (m_hat / (v_hat.sqrt()? + eps)?)?;

        let new_value =
            (param.as_tensor() - (update * learning_rate)?.to_dtype(param.dtype())?)?;
        param.set(&new_value)?;

        self.m.insert(name.to_string(), m);
        self.v.insert(name.to_string(), v);
        Ok(())
    }

    /// Moments keyed `m.<name>` / `v.<name>`
    pub fn get_state_tensors(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        for (name, m) in &self.m {
            state.insert(format!("m.{name}"), m.clone());
        }
        for (name, v) in &self.v {
            state.insert(format!("v.{name}"), v.clone());
        }
        state
    }

    pub fn load_state_tensors(&mut self, state: HashMap<String, Tensor>, device: &Device) -> Result<()> {
        self.m.clear();
        self.v.clear();
        for (key, tensor) in state {
            if let Some(name) = key.strip_prefix("m.") {
                self.m.insert(name.to_string(), tensor.to_device(device)?);
            } else if let Some(name) = key.strip_prefix("v.") {
                self.v.insert(name.to_string(), tensor.to_device(device)?);
            } else {
                return Err(ConsistencyError::MissingParameter(format!(
                    "unexpected optimizer state entry {key}"
                )));
            }
        }
        Ok(())
    }

    /// Moments as tensors, the step counter in the file metadata
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.get_state_tensors();
        let metadata = HashMap::from([(STEP_METADATA_KEY.to_string(), self.step.to_string())]);
        safetensors::serialize_to_file(&state, &Some(metadata), path)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path, device: &Device) -> Result<()> {
        let buffer = fs::read(path)?;
        let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
        let step = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(STEP_METADATA_KEY))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                ConsistencyError::MissingParameter(format!(
                    "{STEP_METADATA_KEY} metadata in {}",
                    path.display()
                ))
            })?;

        let state = candle_core::safetensors::load_buffer(&buffer, &Device::Cpu)?;
        self.load_state_tensors(state, device)?;
        self.step = step;
        Ok(())
    }
}
