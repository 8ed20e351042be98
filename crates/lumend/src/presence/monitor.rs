use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::Local;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::PresenceConfig;
use super::PresenceError;
use super::PresenceStatus;
use super::PresenceUpdate;
use crate::dispatch::Dispatcher;
use crate::fixture::Command;
use crate::probe::PresenceProbe;
use crate::routine::RoutineError;
use crate::routine::RoutineScheduler;
use crate::store;
use crate::store::DocumentStore;
use crate::store::StoreError;

/// Polls the presence probe and fires the arrival trigger on rising edges.
pub struct PresenceMonitor {
    store: Arc<dyn DocumentStore>,
    probe: Arc<dyn PresenceProbe>,
    probe_timeout: Duration,
    scheduler: RoutineScheduler,
    dispatcher: Arc<Dispatcher>,
    config: RwLock<PresenceConfig>,
    status: Mutex<PresenceStatus>,
}

/// Running monitor loop
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Presence monitor task failed: {}", e);
        }
    }
}

impl PresenceMonitor {
    pub async fn load(
        store: Arc<dyn DocumentStore>,
        probe: Arc<dyn PresenceProbe>,
        probe_timeout: Duration,
        scheduler: RoutineScheduler,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, StoreError> {
        let config = store::load_or_default(store.as_ref(), store::PRESENCE_KEY).await?;
        Ok(Self {
            store,
            probe,
            probe_timeout,
            scheduler,
            dispatcher,
            config: RwLock::new(config),
            status: Mutex::new(PresenceStatus::default()),
        })
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a partial update and persist the result
    pub async fn update_config(&self, update: PresenceUpdate) -> Result<PresenceConfig, StoreError> {
        let config = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            update.apply_to(&mut config);
            config.clone()
        };
        store::save(self.store.as_ref(), store::PRESENCE_KEY, &config).await?;
        info!("Presence config updated: {:?}", config);
        Ok(config)
    }

    pub fn status(&self) -> PresenceStatus {
        self.status_mut().clone()
    }

    fn status_mut(&self) -> MutexGuard<'_, PresenceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_absent(&self, error: Option<PresenceError>) {
        let mut status = self.status_mut();
        status.present = false;
        status.last_error = error.map(|e| e.to_string());
    }

    /// Run the loop until the returned handle is stopped
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            info!("Presence monitor started");
            loop {
                self.poll_once(Local::now()).await;

                let interval = Duration::from_secs(self.config().poll_interval_sec.max(1));
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Presence monitor stopped");
        });

        MonitorHandle { cancel, task }
    }

    /// One poll cycle as of `now`
    pub async fn poll_once(&self, now: DateTime<Local>) {
        let config = self.config();
        if !config.enabled {
            self.mark_absent(None);
            return;
        }

        let window = match config.window() {
            Ok(window) => window,
            Err(e) => {
                warn!("Presence disabled until fixed: {}", e);
                self.mark_absent(Some(e));
                return;
            }
        };
        if !window.contains_time(now.time()) {
            self.mark_absent(None);
            return;
        }

        let Some(device) = config.device() else {
            self.mark_absent(Some(PresenceError::MissingDeviceName));
            return;
        };

        let present = match tokio::time::timeout(self.probe_timeout, self.probe.is_reachable(device)).await {
            Ok(present) => present,
            Err(_) => {
                debug!("Presence probe of {} timed out", device);
                false
            }
        };

        let (arrived, last_trigger) = {
            let mut status = self.status_mut();
            let arrived = present && !status.present;
            status.present = present;
            status.last_error = None;
            if present {
                status.last_seen = Some(now);
            }
            (arrived, status.last_trigger)
        };
        if !arrived {
            return;
        }

        info!("{} arrived", device);
        if let Some(last) = last_trigger {
            let elapsed = (now - last).num_seconds();
            if elapsed >= 0 && elapsed.unsigned_abs() < config.cooldown_sec {
                info!("Last trigger was {}s ago, within cooldown", elapsed);
                return;
            }
        }

        match self.trigger(&config).await {
            Ok(()) => self.status_mut().last_trigger = Some(now),
            Err(e) => {
                warn!("Presence trigger failed: {}", e);
                self.status_mut().last_error = Some(e.to_string());
            }
        }
    }

    async fn trigger(&self, config: &PresenceConfig) -> Result<(), PresenceError> {
        let routine = config
            .routine
            .as_deref()
            .filter(|name| self.scheduler.definition(name).is_some());

        if let Some(routine) = routine {
            match self.scheduler.start(routine, Some(&config.target)) {
                Ok(_) => return Ok(()),
                Err(RoutineError::Busy { running }) if running == routine => {
                    debug!("Routine {} already running", routine);
                    return Ok(());
                }
                Err(e) => warn!("Not starting {} ({}), switching lights on instead", routine, e),
            }
        }

        self.dispatcher
            .apply(&config.target, &Command::SetPower(true))
            .await
            .map(|_| ())
            .map_err(|e| PresenceError::Trigger(e.to_string()))
    }
}
