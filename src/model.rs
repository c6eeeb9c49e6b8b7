//! Persisted data model: dryer hardware bindings, presets, preset<->dryer
//! links, and telemetry log rows. Mirrors the shapes the HTTP layer would
//! validate and the store would persist; this crate only needs the plain
//! structs, not a schema-validation layer.

use serde::{Deserialize, Serialize};
use strum::Display;

pub type DryerId = i64;
pub type PresetId = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoConfig {
    pub device_name: String,
    pub close_angle: u16,
    pub open_angle: u16,
    pub soft_step: u16,
    pub soft_sleep_s: f64,
    pub min_interval_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub device_name: String,
    pub fan_device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureSensorConfig {
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedConfig {
    pub device_name: String,
    pub brightness: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumidityConfig {
    pub open_threshold: f64,
    pub close_threshold: f64,
    pub plateau_duration: usize,
    pub plateau_window_size: usize,
    pub timer_drying_range: f64,
}

impl HumidityConfig {
    /// §9 open question: plateau window size must not exceed the ring it
    /// slides over. Enforced here rather than silently truncating at use.
    pub fn validate(&self) -> Result<(), crate::error::DryerError> {
        if self.plateau_window_size > self.plateau_duration {
            return Err(crate::error::DryerError::InvalidState(format!(
                "plateau_window_size ({}) must be <= plateau_duration ({})",
                self.plateau_window_size, self.plateau_duration
            )));
        }
        Ok(())
    }
}

/// Immutable hardware binding for one dryer. Identity + config only; runtime
/// state lives in [`crate::control::dryer::DryerController`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dryer {
    pub id: DryerId,
    pub name: String,
    pub servo: ServoConfig,
    pub heater: HeaterConfig,
    pub temperature_sensor: TemperatureSensorConfig,
    pub led: LedConfig,
    pub humidity: HumidityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PresetStorageType {
    None,
    Temperature,
    Humidity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    pub id: PresetId,
    pub name: String,
    pub temperature: i32,
    pub max_temperature_delta: i32,
    pub humidity: i32,
    pub dry_time: i64,
    pub storage_temperature: i32,
    pub humidity_storage_dry_time: i64,
    pub humidity_storage_range: i32,
    pub storage_type: PresetStorageType,
}

/// Authorization record: a preset can only be activated for a dryer while
/// this link exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresetDryerLink {
    pub dryer_id: DryerId,
    pub preset_id: PresetId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DryerStatus {
    Pending,
    Drying,
    TimerDrying,
    HumidityStorage,
    TemperatureStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryLog {
    pub dryer_id: DryerId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub status: DryerStatus,
    pub current_preset_id: Option<PresetId>,
    pub heater_temperature: f64,
    pub heater_is_on: bool,
    pub heater_fan_is_run: bool,
    pub temperature: f64,
    pub servo_is_open: bool,
    pub absolute_humidity: f64,
    pub relative_humidity: f64,
    pub time_left_drying_s: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plateau_window_larger_than_duration_is_rejected() {
        let cfg = HumidityConfig {
            open_threshold: 0.5,
            close_threshold: 0.3,
            plateau_duration: 10,
            plateau_window_size: 11,
            timer_drying_range: 2.0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn plateau_window_equal_to_duration_is_accepted() {
        let cfg = HumidityConfig {
            open_threshold: 0.5,
            close_threshold: 0.3,
            plateau_duration: 10,
            plateau_window_size: 10,
            timer_drying_range: 2.0,
        };
        assert!(cfg.validate().is_ok());
    }
}
