//! Servo vent driver: owns desired/physical open state and performs
//! stepped ("soft") motion as a cancellable background task so the tick
//! loop is never blocked on a motor move.

use crate::error::Result;
use crate::model::ServoConfig;
use crate::moonraker::{MoonrakerClient, strip_scope_prefix};
use serde_json::Value;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct ServoDriver {
    moonraker: Rc<MoonrakerClient>,
    config: ServoConfig,
    close_pulse_width: Option<f64>,
    open_pulse_width: Option<f64>,
    current_pulse_width: Option<f64>,
    pub desired_is_open: Option<bool>,
    pub physical_is_open: Option<bool>,
    last_commanded_angle: Option<u16>,
    soft_task: Option<JoinHandle<()>>,
}

impl ServoDriver {
    pub fn new(moonraker: Rc<MoonrakerClient>, config: ServoConfig) -> Self {
        Self {
            moonraker,
            config,
            close_pulse_width: None,
            open_pulse_width: None,
            current_pulse_width: None,
            desired_is_open: None,
            physical_is_open: None,
            last_commanded_angle: None,
            soft_task: None,
        }
    }

    pub fn min_interval_s(&self) -> u64 {
        self.config.min_interval_s
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    async fn ensure_initialized(&mut self) -> Result<()> {
        if self.close_pulse_width.is_none() || self.open_pulse_width.is_none() || self.current_pulse_width.is_none() {
            self.calibrate_endpoints().await?;
            self.close(true).await?;
        }
        Ok(())
    }

    async fn calibrate_endpoints(&mut self) -> Result<()> {
        self.set_angle(self.config.open_angle).await?;
        self.open_pulse_width = self.read_pulse_width(None).await?;
        self.set_angle(self.config.close_angle).await?;
        self.close_pulse_width = self.read_pulse_width(None).await?;
        self.current_pulse_width = self.close_pulse_width;
        Ok(())
    }

    pub async fn close(&mut self, fast: bool) -> Result<()> {
        self.ensure_initialized().await?;
        if self.desired_is_open == Some(false) && self.physical_is_open == Some(false) {
            return Ok(());
        }
        self.desired_is_open = Some(false);
        if fast {
            self.set_angle(self.config.close_angle).await?;
        } else {
            self.soft_set_angle(self.config.close_angle);
        }
        Ok(())
    }

    pub async fn open(&mut self, fast: bool) -> Result<()> {
        self.ensure_initialized().await?;
        if self.desired_is_open == Some(true) && self.physical_is_open == Some(true) {
            return Ok(());
        }
        self.desired_is_open = Some(true);
        if fast {
            self.set_angle(self.config.open_angle).await?;
        } else {
            self.soft_set_angle(self.config.open_angle);
        }
        Ok(())
    }

    pub async fn update_status(&mut self, batched: Option<&Value>) -> Result<()> {
        self.ensure_initialized().await?;
        self.current_pulse_width = self.read_pulse_width(batched).await?;
        Ok(())
    }

    async fn read_pulse_width(&self, batched: Option<&Value>) -> Result<Option<f64>> {
        let value = if let Some(batched) = batched {
            batched
                .get(&self.config.device_name)
                .and_then(|v| v.get("value"))
                .cloned()
        } else {
            self.moonraker
                .query(&[&self.config.device_name])
                .await?
                .get(&self.config.device_name)
                .and_then(|v| v.get("value"))
                .cloned()
        };
        Ok(value.and_then(|v| v.as_f64()))
    }

    async fn set_angle(&mut self, angle: u16) -> Result<()> {
        let name = strip_scope_prefix(&self.config.device_name);
        let gcode = format!("SET_SERVO SERVO={name} ANGLE={angle}");
        self.moonraker.gcode(&gcode).await?;
        self.current_pulse_width = self.read_pulse_width(None).await?;
        self.physical_is_open = match self.current_pulse_width {
            Some(pw) if Some(pw) == self.open_pulse_width => Some(true),
            Some(pw) if Some(pw) == self.close_pulse_width => Some(false),
            _ => None,
        };
        self.last_commanded_angle = Some(angle);
        Ok(())
    }

    /// Fire-and-forget stepped move to `target_angle`. Cancels any prior
    /// in-flight soft move; `desired_is_open` is left as already set by
    /// `open()`/`close()`.
    fn soft_set_angle(&mut self, target_angle: u16) {
        if let Some(task) = self.soft_task.take() {
            task.abort();
        }

        let start_angle = match self.current_pulse_width {
            Some(pw) if Some(pw) == self.open_pulse_width => self.config.open_angle,
            Some(pw) if Some(pw) == self.close_pulse_width => self.config.close_angle,
            _ => match self.last_commanded_angle {
                Some(angle) => angle,
                None => {
                    let to_open = (target_angle as i32 - self.config.open_angle as i32).abs();
                    let to_close = (target_angle as i32 - self.config.close_angle as i32).abs();
                    if to_open < to_close {
                        self.config.open_angle
                    } else {
                        self.config.close_angle
                    }
                }
            },
        };

        let moonraker = self.moonraker.clone();
        let device_name = self.config.device_name.clone();
        let step = self.config.soft_step;
        let sleep = Duration::from_secs_f64(self.config.soft_sleep_s.max(0.0));

        // The task only talks to Moonraker directly (it cannot reach back
        // into `self` across an await point on a single-threaded runtime
        // without re-borrowing), so it recomputes pulse width endpoints
        // fresh rather than updating `self` mid-flight; the final
        // `set_angle` call on the next `update_status()`/actuator tick
        // reconciles `current_pulse_width`/`physical_is_open`.
        let handle = tokio::task::spawn_local(async move {
            let name = strip_scope_prefix(&device_name);
            let mut angle = start_angle;
            loop {
                if target_angle > angle {
                    angle = (angle + step).min(target_angle);
                } else if target_angle < angle {
                    angle = angle.saturating_sub(step).max(target_angle);
                } else {
                    break;
                }
                let gcode = format!("SET_SERVO SERVO={name} ANGLE={angle}");
                if moonraker.gcode(&gcode).await.is_err() {
                    log::error!("servo soft move failed device={device_name} angle={angle}");
                    return;
                }
                if angle == target_angle {
                    break;
                }
                tokio::time::sleep(sleep).await;
            }
            let gcode = format!("SET_SERVO SERVO={name} ANGLE={target_angle}");
            let _ = moonraker.gcode(&gcode).await;
        });
        self.soft_task = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServoConfig {
        ServoConfig {
            device_name: "servo vent".into(),
            close_angle: 10,
            open_angle: 170,
            soft_step: 5,
            soft_sleep_s: 0.0,
            min_interval_s: 5,
        }
    }

    #[test]
    fn min_interval_s_reads_through_to_config() {
        let moonraker = Rc::new(MoonrakerClient::new("http://unused".into(), None));
        let driver = ServoDriver::new(moonraker, config());
        assert_eq!(driver.min_interval_s(), 5);
    }

    #[test]
    fn fresh_driver_reports_unknown_open_state() {
        let moonraker = Rc::new(MoonrakerClient::new("http://unused".into(), None));
        let driver = ServoDriver::new(moonraker, config());
        assert_eq!(driver.desired_is_open, None);
        assert_eq!(driver.physical_is_open, None);
    }
}
