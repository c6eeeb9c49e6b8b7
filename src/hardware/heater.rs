//! Heater driver: setpoint pushes plus temperature/power/fan readback.

use crate::error::Result;
use crate::model::HeaterConfig;
use crate::moonraker::{MoonrakerClient, strip_scope_prefix};
use serde_json::Value;
use std::rc::Rc;

#[derive(Debug, Default, Clone, Copy)]
pub struct FanStatus {
    pub speed: f64,
    pub is_run: bool,
}

pub struct HeaterDriver {
    moonraker: Rc<MoonrakerClient>,
    config: HeaterConfig,
    max_temperature: Option<f64>,
    pub temperature: f64,
    pub target: f64,
    pub power: f64,
    pub is_on: bool,
    pub fan: FanStatus,
}

impl HeaterDriver {
    pub fn new(moonraker: Rc<MoonrakerClient>, config: HeaterConfig) -> Self {
        Self {
            moonraker,
            config,
            max_temperature: None,
            temperature: 0.0,
            target: 0.0,
            power: 0.0,
            is_on: false,
            fan: FanStatus::default(),
        }
    }

    pub fn max_temperature(&self) -> f64 {
        self.max_temperature.unwrap_or(0.0)
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    pub fn fan_device_name(&self) -> &str {
        &self.config.fan_device_name
    }

    pub async fn update_status(&mut self, batched: Option<&Value>) -> Result<()> {
        self.ensure_initialized().await?;

        let heater_status = self.read_status(batched).await?;
        self.temperature = round2(heater_status.get("temperature").and_then(Value::as_f64).unwrap_or(self.temperature));
        self.target = heater_status.get("target").and_then(Value::as_f64).unwrap_or(self.target);
        self.power = round2(heater_status.get("power").and_then(Value::as_f64).unwrap_or(self.power));
        self.is_on = self.power > 0.0;

        let fan_status = self.read_fan_status(batched).await?;
        let speed = fan_status.get("speed").and_then(Value::as_f64).unwrap_or(0.0);
        self.fan = FanStatus {
            speed,
            is_run: speed > 0.0,
        };
        Ok(())
    }

    /// Only emits `SET_HEATER_TEMPERATURE` when the target actually changes
    /// and stays within the heater's configured max temperature.
    pub async fn set(&mut self, target: f64) -> Result<()> {
        self.ensure_initialized().await?;
        if target > self.max_temperature() || self.target == target {
            return Ok(());
        }
        let name = strip_scope_prefix(&self.config.device_name);
        let gcode = format!("SET_HEATER_TEMPERATURE HEATER={name} TARGET={target}");
        self.moonraker.gcode(&gcode).await?;
        self.target = target;
        Ok(())
    }

    async fn ensure_initialized(&mut self) -> Result<()> {
        if self.max_temperature.is_none() {
            self.max_temperature = Some(self.moonraker.max_temp(&self.config.device_name).await?);
        }
        Ok(())
    }

    async fn read_status(&self, batched: Option<&Value>) -> Result<Value> {
        if let Some(batched) = batched {
            return Ok(batched.get(&self.config.device_name).cloned().unwrap_or(Value::Null));
        }
        Ok(self
            .moonraker
            .query(&[&self.config.device_name])
            .await?
            .get(&self.config.device_name)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn read_fan_status(&self, batched: Option<&Value>) -> Result<Value> {
        if let Some(batched) = batched {
            return Ok(batched.get(&self.config.fan_device_name).cloned().unwrap_or(Value::Null));
        }
        Ok(self
            .moonraker
            .query(&[&self.config.fan_device_name])
            .await?
            .get(&self.config.fan_device_name)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_matches_two_decimal_rounding() {
        assert_eq!(round2(49.996), 50.0);
        assert_eq!(round2(12.344), 12.34);
    }
}
