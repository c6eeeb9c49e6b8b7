//! Supervisor: reconciles the runtime set of [`DryerController`]s against
//! the persisted dryer list and ticks all of them at ~1 Hz, matching the
//! source's status-worker loop one-for-one but as a structured async loop
//! instead of a `while self.running` flag.

use crate::control::dryer::DryerController;
use crate::error::{DryerError, Result};
use crate::logger::{DRYERS_STATS, LogBufHandle, dryer_logs_channel};
use crate::model::{DryerId, PresetId};
use crate::moonraker::MoonrakerClient;
use crate::store::Store;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A request the HTTP control surface hands to the supervisor task rather
/// than reaching into its controller map directly - this crate's `Rc`/
/// `RefCell` discipline has no safe way to share a `&mut DryerController`
/// across two concurrently-polled tasks, so requests queue and are drained
/// between ticks instead, the same shape as the teacher's `api/actor/*`
/// handles around its engine controllers.
pub enum SupervisorCommand {
    SetPreset {
        dryer_id: DryerId,
        preset_id: Option<PresetId>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap, cloneable handle for sending commands into a running
/// [`Supervisor`]. Used as `axum` state by the HTTP control surface.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Requests a preset change and awaits the supervisor's answer. Errors
    /// if the supervisor task has already shut down.
    pub async fn set_preset(&self, dryer_id: DryerId, preset_id: Option<PresetId>) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(SupervisorCommand::SetPreset {
                dryer_id,
                preset_id,
                reply,
            })
            .map_err(|_| DryerError::Fatal("supervisor task is not running".into()))?;
        receiver
            .await
            .map_err(|_| DryerError::Fatal("supervisor dropped the reply channel".into()))?
    }
}

pub struct Supervisor {
    store: Rc<dyn Store>,
    moonraker: Rc<MoonrakerClient>,
    logs: LogBufHandle,
    controllers: HashMap<DryerId, DryerController>,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    command_sender: mpsc::UnboundedSender<SupervisorCommand>,
}

impl Supervisor {
    pub fn new(store: Rc<dyn Store>, moonraker: Rc<MoonrakerClient>, logs: LogBufHandle) -> Self {
        let (command_sender, commands) = mpsc::unbounded_channel();
        Self {
            store,
            moonraker,
            logs,
            controllers: HashMap::new(),
            commands,
            command_sender,
        }
    }

    /// A cloneable handle other tasks (the HTTP control surface) use to
    /// send this supervisor commands without touching its controller map.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            commands: self.command_sender.clone(),
        }
    }

    /// Runs until `cancel` fires. The first iteration retries every 3 s
    /// (the initial Moonraker connection is the likeliest startup failure);
    /// once a tick has succeeded once, failures fall back to the 1 s
    /// steady-state backoff instead.
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            match self.run_once().await {
                Ok(()) => break,
                Err(e) => {
                    log::error!("supervisor startup failed, retrying in {STARTUP_RETRY_INTERVAL:?}: {e}");
                    self.safety_shutoff().await;
                    if Self::sleep_or_cancel(STARTUP_RETRY_INTERVAL, &cancel).await {
                        return;
                    }
                }
            }
        }

        loop {
            let started = Instant::now();
            if let Err(e) = self.run_once().await {
                log::error!("supervisor tick failed, applying safety shutoff: {e}");
                self.safety_shutoff().await;
                if Self::sleep_or_cancel(ERROR_BACKOFF, &cancel).await {
                    return;
                }
                continue;
            }
            let remaining = TICK_INTERVAL.saturating_sub(started.elapsed());
            if Self::sleep_or_cancel(remaining, &cancel).await {
                return;
            }
        }
    }

    /// Sleeps for `duration`, returning early (and reporting `true`) if
    /// cancellation fires first.
    async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = cancel.cancelled() => true,
        }
    }

    async fn run_once(&mut self) -> Result<()> {
        self.drain_commands().await;
        self.reconcile_controllers().await?;

        let mut logs = Vec::with_capacity(self.controllers.len());
        for (&id, controller) in self.controllers.iter_mut() {
            let log = controller.tick().await?;
            if let Ok(line) = serde_json::to_string(&log) {
                self.logs.publish(&dryer_logs_channel(id), line);
            }
            logs.push(log);
        }

        let payload = serde_json::to_string(&logs).unwrap_or_else(|_| "[]".to_string());
        self.logs.publish(DRYERS_STATS, payload);
        Ok(())
    }

    /// Drains every command queued since the last tick. Queued rather than
    /// applied the instant the HTTP handler receives them, same as every
    /// other store-driven change: this tick's reconcile pass is the only
    /// place a controller's state is allowed to change.
    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SupervisorCommand::SetPreset {
                    dryer_id,
                    preset_id,
                    reply,
                } => {
                    let result = self.set_preset(dryer_id, preset_id).await;
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// Looks up the runtime controller for `dryer_id` and applies the
    /// preset change, or `NotFound` if it has no live twin (unknown id, or
    /// a persisted dryer the reconcile pass hasn't picked up yet).
    pub async fn set_preset(&mut self, dryer_id: DryerId, preset_id: Option<PresetId>) -> Result<()> {
        let controller = self
            .controllers
            .get_mut(&dryer_id)
            .ok_or_else(|| DryerError::NotFound(format!("dryer {dryer_id}")))?;
        controller.set_preset(preset_id).await
    }

    /// Discards the runtime twin for `id`, if any, without touching the
    /// store. Called by the config endpoint when it replaces a dryer's
    /// hardware binding: the old controller (and whatever mid-flight servo
    /// soft motion it owns) is dropped, and the next tick's reconcile pass
    /// rebuilds a fresh one from the updated persisted config.
    pub fn evict(&mut self, id: DryerId) {
        self.controllers.remove(&id);
    }

    async fn reconcile_controllers(&mut self) -> Result<()> {
        let dryers = self.store.list_dryers().await?;
        let mut seen = HashSet::with_capacity(dryers.len());
        for dryer in dryers {
            let id = dryer.id;
            seen.insert(id);
            if self.controllers.contains_key(&id) {
                continue;
            }
            match DryerController::new(dryer, self.store.clone(), self.moonraker.clone()) {
                Ok(controller) => {
                    self.controllers.insert(id, controller);
                }
                Err(e) => log::error!("skipping dryer {id}: invalid config: {e}"),
            }
        }
        self.controllers.retain(|id, _| seen.contains(id));
        Ok(())
    }

    /// Best-effort heater cutoff across every live controller; errors are
    /// logged, never propagated, so one stuck heater can't stop the others
    /// from being turned off.
    async fn safety_shutoff(&mut self) {
        for controller in self.controllers.values_mut() {
            if let Err(e) = controller.force_heater_off().await {
                log::error!("dryer {} safety shutoff failed: {e}", controller.dryer_id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dryer, HeaterConfig, HumidityConfig, LedConfig, ServoConfig, TemperatureSensorConfig};
    use crate::store::InMemoryStore;

    fn sample_dryer(id: DryerId) -> Dryer {
        Dryer {
            id,
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

    fn supervisor() -> Supervisor {
        let store: Rc<dyn Store> = Rc::new(InMemoryStore::new());
        let moonraker = Rc::new(MoonrakerClient::new("http://127.0.0.1:1".into(), None));
        let (logs, _actor) = LogBufHandle::new();
        Supervisor::new(store, moonraker, logs)
    }

    #[tokio::test]
    async fn reconcile_creates_one_controller_per_persisted_dryer() {
        let mut sup = supervisor();
        sup.store.upsert_dryer(sample_dryer(1)).await.unwrap();
        sup.store.upsert_dryer(sample_dryer(2)).await.unwrap();
        sup.reconcile_controllers().await.unwrap();
        assert_eq!(sup.controllers.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_drops_controllers_whose_dryer_was_deleted() {
        let mut sup = supervisor();
        sup.store.upsert_dryer(sample_dryer(1)).await.unwrap();
        sup.reconcile_controllers().await.unwrap();
        assert_eq!(sup.controllers.len(), 1);

        sup.store.delete_dryer(1).await.unwrap();
        sup.reconcile_controllers().await.unwrap();
        assert!(sup.controllers.is_empty());
    }

    #[tokio::test]
    async fn reconcile_skips_a_dryer_with_invalid_humidity_config() {
        let mut sup = supervisor();
        let mut bad = sample_dryer(1);
        bad.humidity.plateau_window_size = bad.humidity.plateau_duration + 1;
        sup.store.upsert_dryer(bad).await.unwrap();
        sup.reconcile_controllers().await.unwrap();
        assert!(sup.controllers.is_empty());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_for_an_unchanged_dryer_set() {
        let mut sup = supervisor();
        sup.store.upsert_dryer(sample_dryer(1)).await.unwrap();
        sup.reconcile_controllers().await.unwrap();
        sup.reconcile_controllers().await.unwrap();
        assert_eq!(sup.controllers.len(), 1);
    }

    #[tokio::test]
    async fn set_preset_on_unknown_dryer_returns_not_found() {
        let mut sup = supervisor();
        let err = sup.set_preset(999, None).await.unwrap_err();
        assert!(matches!(err, DryerError::NotFound(_)));
    }

    #[tokio::test]
    async fn handle_set_preset_is_answered_once_drained() {
        let mut sup = supervisor();
        sup.store.upsert_dryer(sample_dryer(1)).await.unwrap();
        sup.reconcile_controllers().await.unwrap();

        let handle = sup.handle();
        let request = tokio::spawn(async move { handle.set_preset(1, None).await });
        tokio::task::yield_now().await;
        sup.drain_commands().await;
        assert!(request.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn evict_drops_the_runtime_twin_so_the_next_reconcile_rebuilds_it() {
        let mut sup = supervisor();
        sup.store.upsert_dryer(sample_dryer(1)).await.unwrap();
        sup.reconcile_controllers().await.unwrap();
        assert_eq!(sup.controllers.len(), 1);

        sup.evict(1);
        assert!(sup.controllers.is_empty());

        sup.reconcile_controllers().await.unwrap();
        assert_eq!(sup.controllers.len(), 1);
    }
}
