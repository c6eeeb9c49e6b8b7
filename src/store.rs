//! Persistence boundary: an `async_trait` repository over dryers, presets,
//! preset<->dryer links, and telemetry logs, plus a single in-memory
//! implementation. A real relational store is out of scope for this crate;
//! the Supervisor and HTTP control surface depend only on this trait, the
//! way the teacher's `Repository` trait decouples engine code from any one
//! hardware backend.
//!
//! Single-threaded: state lives behind `RefCell`, not `RwLock`, matching
//! the rest of this crate's `Rc`/`RefCell` discipline.

use crate::error::{DryerError, Result};
use crate::model::{Dryer, DryerId, DryerStatus, Preset, PresetDryerLink, PresetId, TelemetryLog};
use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashMap;

#[async_trait(?Send)]
pub trait Store {
    async fn list_dryers(&self) -> Result<Vec<Dryer>>;
    async fn get_dryer(&self, id: DryerId) -> Result<Option<Dryer>>;
    async fn upsert_dryer(&self, dryer: Dryer) -> Result<()>;
    async fn delete_dryer(&self, id: DryerId) -> Result<()>;

    async fn list_presets(&self) -> Result<Vec<Preset>>;
    async fn get_preset(&self, id: PresetId) -> Result<Option<Preset>>;
    async fn upsert_preset(&self, preset: Preset) -> Result<()>;
    async fn delete_preset(&self, id: PresetId) -> Result<()>;

    async fn link_exists(&self, dryer_id: DryerId, preset_id: PresetId) -> Result<bool>;
    async fn create_link(&self, link: PresetDryerLink) -> Result<()>;
    async fn delete_link(&self, dryer_id: DryerId, preset_id: PresetId) -> Result<()>;
    async fn links_for_dryer(&self, dryer_id: DryerId) -> Result<Vec<PresetId>>;

    async fn append_log(&self, log: TelemetryLog) -> Result<()>;
    async fn logs_for_dryer(&self, dryer_id: DryerId, limit: usize) -> Result<Vec<TelemetryLog>>;
}

#[derive(Default)]
struct State {
    dryers: HashMap<DryerId, Dryer>,
    presets: HashMap<PresetId, Preset>,
    links: Vec<PresetDryerLink>,
    logs: HashMap<DryerId, Vec<TelemetryLog>>,
}

/// The in-memory `Store` implementation used by this crate. Good enough for
/// the scope here; a real deployment would swap this for a SQL-backed one
/// behind the same trait.
#[derive(Default)]
pub struct InMemoryStore {
    state: RefCell<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait(?Send)]
impl Store for InMemoryStore {
    async fn list_dryers(&self) -> Result<Vec<Dryer>> {
        Ok(self.state.borrow().dryers.values().cloned().collect())
    }

    async fn get_dryer(&self, id: DryerId) -> Result<Option<Dryer>> {
        Ok(self.state.borrow().dryers.get(&id).cloned())
    }

    async fn upsert_dryer(&self, dryer: Dryer) -> Result<()> {
        self.state.borrow_mut().dryers.insert(dryer.id, dryer);
        Ok(())
    }

    async fn delete_dryer(&self, id: DryerId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.dryers.remove(&id);
        state.logs.remove(&id);
        state.links.retain(|link| link.dryer_id != id);
        Ok(())
    }

    async fn list_presets(&self) -> Result<Vec<Preset>> {
        Ok(self.state.borrow().presets.values().cloned().collect())
    }

    async fn get_preset(&self, id: PresetId) -> Result<Option<Preset>> {
        Ok(self.state.borrow().presets.get(&id).cloned())
    }

    async fn upsert_preset(&self, preset: Preset) -> Result<()> {
        self.state.borrow_mut().presets.insert(preset.id, preset);
        Ok(())
    }

    async fn delete_preset(&self, id: PresetId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.presets.remove(&id);
        state.links.retain(|link| link.preset_id != id);
        Ok(())
    }

    async fn link_exists(&self, dryer_id: DryerId, preset_id: PresetId) -> Result<bool> {
        Ok(self
            .state
            .borrow()
            .links
            .iter()
            .any(|link| link.dryer_id == dryer_id && link.preset_id == preset_id))
    }

    async fn create_link(&self, link: PresetDryerLink) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.links.contains(&link) {
            state.links.push(link);
        }
        Ok(())
    }

    async fn delete_link(&self, dryer_id: DryerId, preset_id: PresetId) -> Result<()> {
        self.state
            .borrow_mut()
            .links
            .retain(|link| !(link.dryer_id == dryer_id && link.preset_id == preset_id));
        Ok(())
    }

    async fn links_for_dryer(&self, dryer_id: DryerId) -> Result<Vec<PresetId>> {
        Ok(self
            .state
            .borrow()
            .links
            .iter()
            .filter(|link| link.dryer_id == dryer_id)
            .map(|link| link.preset_id)
            .collect())
    }

    async fn append_log(&self, log: TelemetryLog) -> Result<()> {
        self.state
            .borrow_mut()
            .logs
            .entry(log.dryer_id)
            .or_default()
            .push(log);
        Ok(())
    }

    async fn logs_for_dryer(&self, dryer_id: DryerId, limit: usize) -> Result<Vec<TelemetryLog>> {
        let state = self.state.borrow();
        let Some(logs) = state.logs.get(&dryer_id) else {
            return Ok(Vec::new());
        };
        let start = logs.len().saturating_sub(limit);
        Ok(logs[start..].to_vec())
    }
}

/// Maps a missing preset/link lookup to the dryer's forced `Pending`
/// transition rather than propagating an error to the caller; see §7.
pub fn not_found(what: impl Into<String>) -> DryerError {
    DryerError::NotFound(what.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        HeaterConfig, HumidityConfig, LedConfig, ServoConfig, TemperatureSensorConfig,
    };

    fn sample_dryer(id: DryerId) -> Dryer {
        Dryer {
            id,
            name: "test".into(),
            servo: ServoConfig {
                device_name: "servo vent".into(),
                close_angle: 0,
                open_angle: 90,
                soft_step: 5,
                soft_sleep_s: 0.1,
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

    fn sample_preset(id: PresetId) -> Preset {
        Preset {
            id,
            name: "PLA".into(),
            temperature: 50,
            max_temperature_delta: 20,
            humidity: 10,
            dry_time: 240,
            storage_temperature: 40,
            humidity_storage_dry_time: 60,
            humidity_storage_range: 5,
            storage_type: crate::model::PresetStorageType::None,
        }
    }

    #[tokio::test]
    async fn deleting_a_dryer_removes_its_links() {
        let store = InMemoryStore::new();
        store.upsert_dryer(sample_dryer(1)).await.unwrap();
        store.upsert_preset(sample_preset(1)).await.unwrap();
        store
            .create_link(PresetDryerLink {
                dryer_id: 1,
                preset_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(store.links_for_dryer(1).await.unwrap(), vec![1]);

        store.delete_dryer(1).await.unwrap();
        assert!(store.links_for_dryer(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_exists_reflects_creation_and_deletion() {
        let store = InMemoryStore::new();
        assert!(!store.link_exists(1, 1).await.unwrap());
        store
            .create_link(PresetDryerLink {
                dryer_id: 1,
                preset_id: 1,
            })
            .await
            .unwrap();
        assert!(store.link_exists(1, 1).await.unwrap());
        store.delete_link(1, 1).await.unwrap();
        assert!(!store.link_exists(1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn logs_for_dryer_respects_limit() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .append_log(TelemetryLog {
                    dryer_id: 1,
                    timestamp: chrono::Utc::now(),
                    status: DryerStatus::Pending,
                    current_preset_id: None,
                    heater_temperature: 0.0,
                    heater_is_on: false,
                    heater_fan_is_run: false,
                    temperature: 0.0,
                    servo_is_open: false,
                    absolute_humidity: 0.0,
                    relative_humidity: i as f64,
                    time_left_drying_s: None,
                })
                .await
                .unwrap();
        }
        let logs = store.logs_for_dryer(1, 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].relative_humidity, 3.0);
        assert_eq!(logs[1].relative_humidity, 4.0);
    }
}
