//! EMA (Exponential Moving Average) shadow parameters
//!
//! The shadow network is a separately constructed `UNet` whose parameter table
//! shares names with the online network. Updates go name by name, never by
//! object identity.

use log::debug;

use crate::error::{ConsistencyError, Result};
use crate::models::UNet;

pub struct EmaUpdater {
    decay: f64,
}

impl EmaUpdater {
    pub fn new(decay: f64) -> Self {
        Self { decay }
    }

    /// Shadow network starting from the online network's current state
    pub fn init_shadow(online: &UNet) -> Result<UNet> {
        online.try_clone()
    }

    pub fn update(&self, online: &UNet, shadow: &UNet) -> Result<()> {
        update_ema(online, shadow, self.decay)
    }
}

/// `shadow <- decay * shadow + (1 - decay) * online` for every named parameter
///
/// Call once per optimizer step, after the optimizer has applied its update.
pub fn update_ema(online: &UNet, shadow: &UNet, decay: f64) -> Result<()> {
    let online_vars = online.named_vars()?;
    let shadow_vars = shadow.named_vars()?;
    if online_vars.len() != shadow_vars.len() {
        return Err(ConsistencyError::TopologyMismatch(format!(
            "{} online parameters vs {} shadow parameters",
            online_vars.len(),
            shadow_vars.len()
        )));
    }

    // both lists are sorted by name, so they pair up positionally
    for ((name, param), (shadow_name, shadow_param)) in online_vars.iter().zip(&shadow_vars) {
        if name != shadow_name {
            return Err(ConsistencyError::TopologyMismatch(name.clone()));
        }
        if param.dims() != shadow_param.dims() {
            return Err(ConsistencyError::ShapeMismatch {
                name: name.clone(),
                expected: shadow_param.dims().to_vec(),
                found: param.dims().to_vec(),
            });
        }
        let online_value = param.as_tensor().detach();
        let shadow_value = shadow_param.as_tensor().detach();
        let updated = ((shadow_value * decay)? + (online_value * (1.0 - decay))?)?;
        shadow_param.set(&updated)?;
    }

    debug!("EMA update over {} parameters (decay {decay})", online_vars.len());
    Ok(())
}
