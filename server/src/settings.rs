use comms::msg::SettingsPatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ServerErr};

/// The runtime-tunable settings registry.
///
/// Clients update it through key/value patches validated against this
/// struct's field set; a patch with any unknown key or ill-typed value
/// is rejected as a whole, so a half-applied batch can never be
/// observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // model parameters
    pub sh_degree: i64,
    pub dataset_path: String,
    pub save_path: String,
    pub resolution_scale: f64,
    pub white_background: bool,
    pub device: String,
    pub data_device: String,

    // optimization parameters
    pub iterations: u64,
    pub position_lr_init: f64,
    pub position_lr_final: f64,
    pub position_lr_delay_mult: f64,
    pub position_lr_max_steps: u64,
    pub feature_lr: f64,
    pub opacity_lr: f64,
    pub scaling_lr: f64,
    pub rotation_lr: f64,
    pub percent_dense: f64,
    pub lambda_dssim: f64,
    pub densification_interval: u64,
    pub opacity_reset_interval: u64,
    pub densify_from_iter: u64,
    pub densify_until_iter: u64,
    pub densify_grad_threshold: f64,
    pub spatial_lr_scale: f64,
    pub random_background: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sh_degree: 3,
            dataset_path: String::new(),
            save_path: String::new(),
            resolution_scale: -1.0,
            white_background: false,
            device: "cpu".to_string(),
            data_device: "cpu".to_string(),
            iterations: 30_000,
            position_lr_init: 0.00016,
            position_lr_final: 0.0000016,
            position_lr_delay_mult: 0.01,
            position_lr_max_steps: 30_000,
            feature_lr: 0.0025,
            opacity_lr: 0.05,
            scaling_lr: 0.005,
            rotation_lr: 0.001,
            percent_dense: 0.01,
            lambda_dssim: 0.2,
            densification_interval: 100,
            opacity_reset_interval: 3000,
            densify_from_iter: 500,
            densify_until_iter: 15_000,
            densify_grad_threshold: 0.0002,
            spatial_lr_scale: 1.0,
            random_background: false,
        }
    }
}

impl Settings {
    /// Applies `patch` atomically: either every key is known and
    /// well-typed and all of them are committed, or `self` is left
    /// untouched.
    ///
    /// # Arguments
    /// * `patch` - Key/value pairs from the client.
    ///
    /// # Returns
    /// `UnknownSettingKey` for the first key outside the whitelist, or
    /// `InvalidSettingValue` if the patched registry no longer parses.
    pub fn apply_patch(&mut self, patch: &SettingsPatch) -> Result<()> {
        // SAFETY: Settings serializes to a JSON object by construction.
        let Value::Object(mut map) = serde_json::to_value(&*self).unwrap() else {
            unreachable!()
        };

        for (key, value) in patch {
            if !map.contains_key(key) {
                return Err(ServerErr::UnknownSettingKey { key: key.clone() });
            }
            map.insert(key.clone(), value.clone());
        }

        *self = serde_json::from_value(Value::Object(map)).map_err(|e| {
            ServerErr::InvalidSettingValue {
                detail: e.to_string(),
            }
        })?;

        Ok(())
    }

    /// Serializes the full registry into the wire patch shape used by
    /// state snapshots.
    pub fn to_patch(&self) -> SettingsPatch {
        // SAFETY: same as in `apply_patch`.
        let Value::Object(map) = serde_json::to_value(self).unwrap() else {
            unreachable!()
        };

        map.into_iter().collect()
    }
}
