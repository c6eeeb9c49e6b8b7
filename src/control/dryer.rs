//! Per-dryer state machine: composes the hardware drivers and PID loops
//! into one tick of read -> decide -> actuate -> log.
//!
//! The phase is a tagged enum carrying only the data that phase actually
//! needs (the preset snapshot, plus a start/arm instant where relevant) -
//! this replaces the source's single object with a shifting bag of
//! attributes and makes unreachable field combinations unrepresentable.
//! PID instances are *not* part of the phase payload: they are cleared on
//! entry to `Pending`/`Drying` and otherwise carried across phase changes
//! exactly as the original orchestrator does (e.g. `Drying -> TimerDrying`
//! keeps the heater PID already in flight).

use crate::control::pid::{HeaterPid, HumidityPid};
use crate::control::plateau::{self, PlateauCooldown, ServoAction};
use crate::error::Result;
use crate::hardware::heater::HeaterDriver;
use crate::hardware::led::{self, LedDriver};
use crate::hardware::sensor::SensorReader;
use crate::hardware::servo::ServoDriver;
use crate::model::{Dryer, DryerId, DryerStatus, HumidityConfig, Preset, PresetId, PresetStorageType};
use crate::moonraker::MoonrakerClient;
use crate::store::{Store, not_found};
use std::rc::Rc;
use std::time::Instant;

enum Phase {
    Pending,
    Drying { preset: Preset },
    TimerDrying { preset: Preset, started_at: Instant },
    HumidityStorage { preset: Preset, armed_at: Option<Instant> },
    TemperatureStorage { preset: Preset },
}

pub struct DryerController {
    dryer_id: DryerId,
    store: Rc<dyn Store>,
    moonraker: Rc<MoonrakerClient>,
    servo: ServoDriver,
    led: LedDriver,
    heater: HeaterDriver,
    sensor: SensorReader,
    humidity: HumidityConfig,
    heater_pid: Option<HeaterPid>,
    humidity_pid: Option<HumidityPid>,
    cooldown: PlateauCooldown,
    phase: Phase,
    time_left_s: Option<i64>,
}

impl DryerController {
    pub fn new(dryer: Dryer, store: Rc<dyn Store>, moonraker: Rc<MoonrakerClient>) -> Result<Self> {
        dryer.humidity.validate()?;
        let humidity = dryer.humidity.clone();
        Ok(Self {
            dryer_id: dryer.id,
            store,
            servo: ServoDriver::new(moonraker.clone(), dryer.servo),
            led: LedDriver::new(moonraker.clone(), dryer.led),
            heater: HeaterDriver::new(moonraker.clone(), dryer.heater),
            sensor: SensorReader::new(moonraker.clone(), dryer.temperature_sensor, humidity.plateau_duration),
            moonraker,
            humidity,
            heater_pid: None,
            humidity_pid: None,
            cooldown: PlateauCooldown::new(),
            phase: Phase::Pending,
            time_left_s: None,
        })
    }

    pub fn dryer_id(&self) -> DryerId {
        self.dryer_id
    }

    /// Best-effort heater cutoff used by the Supervisor's safety shutoff
    /// sweep; swallows nothing itself, the caller decides whether to log.
    pub async fn force_heater_off(&mut self) -> Result<()> {
        self.heater.set(0.0).await
    }

    pub fn status(&self) -> DryerStatus {
        match self.phase {
            Phase::Pending => DryerStatus::Pending,
            Phase::Drying { .. } => DryerStatus::Drying,
            Phase::TimerDrying { .. } => DryerStatus::TimerDrying,
            Phase::HumidityStorage { .. } => DryerStatus::HumidityStorage,
            Phase::TemperatureStorage { .. } => DryerStatus::TemperatureStorage,
        }
    }

    fn current_preset(&self) -> Option<&Preset> {
        match &self.phase {
            Phase::Pending => None,
            Phase::Drying { preset }
            | Phase::TimerDrying { preset, .. }
            | Phase::HumidityStorage { preset, .. }
            | Phase::TemperatureStorage { preset } => Some(preset),
        }
    }

    pub fn current_preset_id(&self) -> Option<PresetId> {
        self.current_preset().map(|preset| preset.id)
    }

    /// Public entry point for the HTTP control surface: `Some(id)` enters
    /// `Drying` with that preset (the link must exist), `None` forces
    /// `Pending`.
    pub async fn set_preset(&mut self, preset_id: Option<PresetId>) -> Result<()> {
        match preset_id {
            None => self.set_status(Phase::Pending).await,
            Some(id) => {
                let preset = self
                    .store
                    .get_preset(id)
                    .await?
                    .ok_or_else(|| not_found(format!("preset {id}")))?;
                if !self.store.link_exists(self.dryer_id, id).await? {
                    return Err(not_found(format!("preset {id} not linked to dryer {}", self.dryer_id)));
                }
                self.set_status(Phase::Drying { preset }).await
            }
        }
    }

    async fn set_status(&mut self, new_phase: Phase) -> Result<()> {
        match &new_phase {
            Phase::Pending => {
                self.heater_pid = None;
                self.humidity_pid = None;
                self.time_left_s = None;
                self.heater.set(0.0).await?;
                self.servo.close(false).await?;
            }
            Phase::Drying { .. } => {
                self.heater_pid = None;
                self.humidity_pid = None;
                self.time_left_s = None;
                self.servo.close(false).await?;
            }
            Phase::TimerDrying { .. } => {
                self.servo.close(false).await?;
            }
            Phase::HumidityStorage { .. } => {
                self.servo.close(false).await?;
            }
            Phase::TemperatureStorage { .. } => {
                self.servo.close(false).await?;
            }
        }
        self.phase = new_phase;
        Ok(())
    }

    fn max_temperature_for(&self, preset: &Preset) -> f64 {
        let requested = (preset.temperature + preset.max_temperature_delta) as f64;
        requested.min(self.heater.max_temperature())
    }

    async fn servo_control(&mut self) -> Result<()> {
        let Some(metrics) = plateau::analyze(self.sensor.relative_humidity_ring(), &self.humidity) else {
            return Ok(());
        };
        if self.cooldown.in_cooldown(self.servo.min_interval_s()) {
            return Ok(());
        }
        match plateau::decide(&metrics, self.servo.desired_is_open) {
            Some(ServoAction::Open) => {
                self.servo.open(false).await?;
                self.cooldown.record_action();
            }
            Some(ServoAction::Close) => {
                self.servo.close(false).await?;
                self.cooldown.record_action();
            }
            None => {}
        }
        Ok(())
    }

    /// Every tick: if the current preset's record or link disappeared,
    /// force `Pending`. If it mutated, react to a storage-type downgrade or
    /// a lowered humidity target while `TimerDrying`, then replace the
    /// in-memory snapshot either way.
    async fn reconcile_preset(&mut self) -> Result<()> {
        let Some(preset_id) = self.current_preset_id() else {
            return Ok(());
        };
        let fresh = self.store.get_preset(preset_id).await?;
        let linked = self.store.link_exists(self.dryer_id, preset_id).await?;
        let Some(fresh) = fresh else {
            return self.set_status(Phase::Pending).await;
        };
        if !linked {
            return self.set_status(Phase::Pending).await;
        }

        let current = self.current_preset().cloned();
        let Some(current) = current else { return Ok(()) };
        if current == fresh {
            return Ok(());
        }

        let in_storage_phase = matches!(self.phase, Phase::HumidityStorage { .. } | Phase::TemperatureStorage { .. });
        let dropped_to_none = matches!(current.storage_type, PresetStorageType::Humidity | PresetStorageType::Temperature)
            && fresh.storage_type == PresetStorageType::None;
        if in_storage_phase && dropped_to_none {
            return self.set_status(Phase::Pending).await;
        }

        if matches!(self.phase, Phase::TimerDrying { .. }) && (fresh.humidity as f64) < self.sensor.median_relative_humidity {
            return self.set_status(Phase::Drying { preset: fresh }).await;
        }

        self.replace_preset_snapshot(fresh);
        Ok(())
    }

    fn replace_preset_snapshot(&mut self, fresh: Preset) {
        match &mut self.phase {
            Phase::Pending => {}
            Phase::Drying { preset }
            | Phase::TimerDrying { preset, .. }
            | Phase::HumidityStorage { preset, .. }
            | Phase::TemperatureStorage { preset } => *preset = fresh,
        }
    }

    async fn apply_actuator_targets(&mut self) -> Result<()> {
        let phase = std::mem::replace(&mut self.phase, Phase::Pending);
        match phase {
            Phase::Pending => self.apply_pending().await,
            Phase::Drying { preset } => self.apply_drying(preset).await,
            Phase::TimerDrying { preset, started_at } => self.apply_timer_drying(preset, started_at).await,
            Phase::HumidityStorage { preset, armed_at } => self.apply_humidity_storage(preset, armed_at).await,
            Phase::TemperatureStorage { preset } => self.apply_temperature_storage(preset).await,
        }
    }

    async fn apply_pending(&mut self) -> Result<()> {
        if self.heater.is_on {
            self.heater.set(0.0).await?;
        }
        Ok(())
    }

    async fn apply_drying(&mut self, preset: Preset) -> Result<()> {
        let max_t = self.max_temperature_for(&preset);
        let pid = self.heater_pid.get_or_insert_with(|| HeaterPid::new(max_t));
        pid.update(preset.temperature as f64, None, Some(max_t));
        let power = pid.get(self.sensor.temperature);
        self.heater.set(power).await?;
        self.servo_control().await?;

        if (preset.humidity as f64) >= self.sensor.median_relative_humidity {
            self.set_status(Phase::TimerDrying {
                preset,
                started_at: Instant::now(),
            })
            .await
        } else {
            self.phase = Phase::Drying { preset };
            Ok(())
        }
    }

    async fn apply_timer_drying(&mut self, preset: Preset, started_at: Instant) -> Result<()> {
        let range = self.humidity.timer_drying_range;
        let band_high = preset.humidity as f64 + range;
        let band_low = preset.humidity as f64 - range;
        let median_rh = self.sensor.median_relative_humidity;
        let max_t = self.max_temperature_for(&preset);

        if median_rh > band_high {
            let pid = self.heater_pid.get_or_insert_with(|| HeaterPid::new(max_t));
            pid.update(preset.temperature as f64, None, Some(max_t));
            let power = pid.get(self.sensor.temperature);
            self.heater.set(power).await?;
            self.servo_control().await?;
        } else {
            self.drive_humidity_pid(&preset, median_rh, max_t).await?;
            if median_rh < band_low {
                self.servo.open(false).await?;
            } else {
                self.servo.close(false).await?;
            }
        }

        let elapsed = started_at.elapsed().as_secs_f64();
        let dry_time_limit = preset.dry_time as f64 * 60.0;
        if elapsed >= dry_time_limit {
            let next = match preset.storage_type {
                PresetStorageType::Humidity => Phase::HumidityStorage { preset, armed_at: None },
                PresetStorageType::Temperature => Phase::TemperatureStorage { preset },
                PresetStorageType::None => Phase::Pending,
            };
            return self.set_status(next).await;
        }

        self.time_left_s = Some((dry_time_limit - elapsed).round() as i64);
        self.phase = Phase::TimerDrying { preset, started_at };
        Ok(())
    }

    async fn apply_humidity_storage(&mut self, preset: Preset, armed_at: Option<Instant>) -> Result<()> {
        let range = self.humidity.timer_drying_range;
        let band_high = preset.humidity as f64 + range;
        let band_low = preset.humidity as f64 - range;
        let median_rh = self.sensor.median_relative_humidity;

        if armed_at.is_none() && median_rh < band_high {
            self.phase = Phase::HumidityStorage { preset, armed_at };
            return Ok(());
        }

        let max_t = self.max_temperature_for(&preset);
        let armed_at = if median_rh > band_high + 0.1 {
            let pid = self.heater_pid.get_or_insert_with(|| HeaterPid::new(max_t));
            pid.update(preset.temperature as f64, None, Some(max_t));
            let power = pid.get(self.sensor.temperature);
            self.heater.set(power).await?;
            self.servo_control().await?;
            Some(Instant::now())
        } else {
            self.drive_humidity_pid(&preset, median_rh, max_t).await?;
            if median_rh < band_low {
                self.servo.open(false).await?;
            } else {
                self.servo.close(false).await?;
            }
            armed_at
        };

        // `armed_at` is always `Some` past the early-idle return above.
        let Some(started) = armed_at else {
            self.phase = Phase::HumidityStorage { preset, armed_at };
            return Ok(());
        };
        let elapsed = started.elapsed().as_secs_f64();
        // Display countdown uses `dry_time`; the exit condition below uses
        // `humidity_storage_dry_time` - a mismatch carried over unchanged
        // from the original controller (see design notes).
        self.time_left_s = Some((preset.dry_time as f64 * 60.0 - elapsed).round() as i64);

        if elapsed >= preset.humidity_storage_dry_time as f64 * 60.0 {
            self.heater.set(0.0).await?;
            self.phase = Phase::HumidityStorage { preset, armed_at: None };
            return Ok(());
        }

        self.phase = Phase::HumidityStorage { preset, armed_at: Some(started) };
        Ok(())
    }

    async fn apply_temperature_storage(&mut self, preset: Preset) -> Result<()> {
        let max_t = self.max_temperature_for(&preset);
        let pid = self.heater_pid.get_or_insert_with(|| HeaterPid::new(max_t));
        pid.update(preset.temperature as f64, Some(preset.storage_temperature as f64), Some(max_t));
        let power = pid.get(self.sensor.temperature);
        self.heater.set(power).await?;

        let median_rh = self.sensor.median_relative_humidity;
        let target = preset.humidity as f64;
        if median_rh > target {
            self.servo_control().await?;
        } else if median_rh < target {
            self.servo.open(false).await?;
        } else {
            self.servo.close(false).await?;
        }
        self.phase = Phase::TemperatureStorage { preset };
        Ok(())
    }

    /// Shared by `TimerDrying` and `HumidityStorage`: lazy-inits the
    /// humidity PID, and if its (already inverted) output saturates at the
    /// configured minimum, escapes to the heater PID with setpoint `1`
    /// rather than commanding the degenerate target directly.
    async fn drive_humidity_pid(&mut self, preset: &Preset, median_rh: f64, max_t: f64) -> Result<()> {
        if self.humidity_pid.is_none() {
            self.humidity_pid = Some(HumidityPid::new(preset.humidity as f64, 1.0, max_t));
        }
        let hum_pid = self.humidity_pid.as_mut().expect("just inserted");
        let min = hum_pid.min();
        let result = hum_pid.get(median_rh);

        if result == min {
            let pid = self.heater_pid.get_or_insert_with(|| HeaterPid::new(max_t));
            pid.update(1.0, Some(1.0), Some(max_t));
            let power = pid.get(self.sensor.temperature);
            self.heater.set(power).await?;
        } else {
            self.heater.set(result).await?;
        }
        Ok(())
    }

    async fn update_led_indicators(&mut self) -> Result<()> {
        let blink_off = chrono::Utc::now().timestamp() % 2 == 0;

        if self.heater.is_on {
            self.led.set_pixel_color(0, self.heater.power, 0.0, 0.0).await?;
        } else {
            let (r, g, b) = led::DEFAULT_COLOR;
            self.led.set_pixel_color(0, r, g, b).await?;
        }

        if self.heater.fan.is_run {
            if matches!(self.phase, Phase::HumidityStorage { .. }) && blink_off {
                let (r, g, b) = led::OFF_COLOR;
                self.led.set_pixel_color(1, r, g, b).await?;
            } else {
                self.led.set_pixel_color(1, 0.0, self.heater.fan.speed, 0.0).await?;
            }
        } else {
            let (r, g, b) = led::DEFAULT_COLOR;
            self.led.set_pixel_color(1, r, g, b).await?;
        }

        if let Some(preset) = self.current_preset().cloned() {
            let blinking_phase = matches!(
                self.phase,
                Phase::TimerDrying { .. } | Phase::HumidityStorage { .. } | Phase::TemperatureStorage { .. }
            );
            if blinking_phase && blink_off {
                let (r, g, b) = led::OFF_COLOR;
                self.led.set_pixel_color(2, r, g, b).await?;
            } else if self.sensor.median_relative_humidity < preset.humidity as f64 {
                let (r, g, b) = led::DEFAULT_COLOR;
                self.led.set_pixel_color(2, r, g, b).await?;
            } else {
                self.led.set_pixel_color(2, 0.0, 0.0, self.sensor.median_relative_humidity / 100.0).await?;
            }
        } else {
            let (r, g, b) = led::DEFAULT_COLOR;
            self.led.set_pixel_color(2, r, g, b).await?;
        }

        if matches!(self.phase, Phase::TemperatureStorage { .. }) && blink_off {
            let (r, g, b) = led::OFF_COLOR;
            self.led.set_pixel_color(3, r, g, b).await?;
        } else if self.sensor.temperature <= 50.0 {
            let (r, g, b) = led::DEFAULT_COLOR;
            self.led.set_pixel_color(3, r, g, b).await?;
        } else {
            let max_temp = self.heater.max_temperature();
            let scaled = if max_temp > 0.0 {
                (self.heater.temperature / (max_temp / 100.0)) / 100.0
            } else {
                0.0
            };
            self.led.set_pixel_color(3, scaled, 0.0, 0.0).await?;
        }
        Ok(())
    }

    /// One full tick: batched status fetch, subsystem refresh, LED update,
    /// preset reconciliation, actuator decisions, then a telemetry row
    /// appended to the store and returned to the caller (the Supervisor).
    pub async fn tick(&mut self) -> Result<crate::model::TelemetryLog> {
        let names = [
            self.servo.device_name().to_string(),
            self.led.device_name().to_string(),
            self.heater.device_name().to_string(),
            self.heater.fan_device_name().to_string(),
            self.sensor.device_name().to_string(),
        ];
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let batched = self.moonraker.query(&name_refs).await?;

        self.servo.update_status(Some(&batched)).await?;
        self.led.update_status(Some(&batched)).await?;
        self.heater.update_status(Some(&batched)).await?;
        self.sensor.update_status(Some(&batched)).await?;

        self.update_led_indicators().await?;
        self.reconcile_preset().await?;
        self.apply_actuator_targets().await?;

        let log = crate::model::TelemetryLog {
            dryer_id: self.dryer_id,
            timestamp: chrono::Utc::now(),
            status: self.status(),
            current_preset_id: self.current_preset_id(),
            heater_temperature: self.heater.temperature,
            heater_is_on: self.heater.is_on,
            heater_fan_is_run: self.heater.fan.is_run,
            temperature: self.sensor.temperature,
            servo_is_open: self.servo.desired_is_open.unwrap_or(false),
            absolute_humidity: self.sensor.absolute_humidity,
            relative_humidity: self.sensor.relative_humidity,
            time_left_drying_s: self.time_left_s,
        };
        self.store.append_log(log.clone()).await?;
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HeaterConfig, LedConfig, ServoConfig, TemperatureSensorConfig};
    use crate::store::InMemoryStore;

    fn sample_dryer() -> Dryer {
        Dryer {
            id: 1,
            name: "test".into(),
            servo: ServoConfig {
                device_name: "servo vent".into(),
                close_angle: 0,
                open_angle: 90,
                soft_step: 5,
                soft_sleep_s: 0.0,
                min_interval_s: 5,
            },
            heater: HeaterConfig {
                device_name: "heater_generic chamber".into(),
                fan_device_name: "fan_generic chamber_fan".into(),
            },
            temperature_sensor: TemperatureSensorConfig {
                device_name: "temperature_sensor chamber".into(),
            },
            led: LedConfig {
                device_name: "neopixel strip".into(),
                brightness: 50,
            },
            humidity: HumidityConfig {
                open_threshold: 0.5,
                close_threshold: 0.3,
                plateau_duration: 30,
                plateau_window_size: 5,
                timer_drying_range: 2.0,
            },
        }
    }

    fn sample_preset(storage_type: PresetStorageType) -> Preset {
        Preset {
            id: 1,
            name: "PLA".into(),
            temperature: 50,
            max_temperature_delta: 20,
            humidity: 10,
            dry_time: 1,
            storage_temperature: 40,
            humidity_storage_dry_time: 60,
            humidity_storage_range: 5,
            storage_type,
        }
    }

    fn controller() -> DryerController {
        let store: Rc<dyn Store> = Rc::new(InMemoryStore::new());
        let moonraker = Rc::new(MoonrakerClient::new("http://127.0.0.1:1".into(), None));
        DryerController::new(sample_dryer(), store, moonraker).expect("valid humidity config")
    }

    #[test]
    fn fresh_controller_starts_pending_with_no_preset() {
        let c = controller();
        assert_eq!(c.status(), DryerStatus::Pending);
        assert_eq!(c.current_preset_id(), None);
    }

    #[test]
    fn construction_rejects_invalid_humidity_config() {
        let mut dryer = sample_dryer();
        dryer.humidity.plateau_window_size = dryer.humidity.plateau_duration + 1;
        let store: Rc<dyn Store> = Rc::new(InMemoryStore::new());
        let moonraker = Rc::new(MoonrakerClient::new("http://127.0.0.1:1".into(), None));
        assert!(DryerController::new(dryer, store, moonraker).is_err());
    }

    #[test]
    fn max_temperature_for_clamps_to_heater_ceiling() {
        let c = controller();
        let preset = sample_preset(PresetStorageType::None);
        // heater.max_temperature() is 0.0 before any status has been read.
        assert_eq!(c.max_temperature_for(&preset), 0.0);
    }

    #[tokio::test]
    async fn set_preset_with_unknown_id_returns_not_found_without_touching_hardware() {
        let mut c = controller();
        let err = c.set_preset(Some(999)).await.unwrap_err();
        assert!(matches!(err, crate::error::DryerError::NotFound(_)));
    }

    #[tokio::test]
    async fn set_preset_requires_an_existing_dryer_preset_link() {
        let store = Rc::new(InMemoryStore::new());
        store.upsert_preset(sample_preset(PresetStorageType::None)).await.unwrap();
        let moonraker = Rc::new(MoonrakerClient::new("http://127.0.0.1:1".into(), None));
        let mut c = DryerController::new(sample_dryer(), store, moonraker).unwrap();
        // Preset exists but is not linked to this dryer.
        let err = c.set_preset(Some(1)).await.unwrap_err();
        assert!(matches!(err, crate::error::DryerError::NotFound(_)));
    }
}
