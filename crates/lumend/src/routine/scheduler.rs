use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::Local;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Frame;
use super::RoutineBook;
use super::RoutineDefinition;
use super::RoutineError;
use super::RoutineOverride;
use super::TransitionPlan;
use crate::dispatch::Dispatcher;
use crate::fixture::Command;
use crate::state::ColorMode;
use crate::state::Power;
use crate::state::StatePatch;
use crate::store;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Pause between two steps of a run
    pub step_interval: Duration,

    /// How long a power-off waits for a cancelled run to wind down
    pub stop_wait: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            step_interval: Duration::from_secs(1),
            stop_wait: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutineStatus {
    pub running: BTreeMap<String, bool>,
    pub last_run: BTreeMap<String, DateTime<Local>>,
    pub running_targets: BTreeMap<String, Vec<String>>,
}

struct ActiveRun {
    id: u64,
    name: String,
    targets: Vec<String>,
    cancel: CancellationToken,
    /// Cancelled by the run itself once it has cleaned up
    finished: CancellationToken,
}

#[derive(Default)]
struct Runs {
    active: Option<ActiveRun>,
    last_run: BTreeMap<String, DateTime<Local>>,
    next_id: u64,
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn DocumentStore>,
    settings: SchedulerSettings,
    book: RwLock<RoutineBook>,
    runs: Mutex<Runs>,
}

/// Runs at most one routine at a time, system wide.
#[derive(Clone)]
pub struct RoutineScheduler {
    inner: Arc<Inner>,
}

impl RoutineScheduler {
    pub async fn load(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn DocumentStore>,
        settings: SchedulerSettings,
    ) -> Result<Self, RoutineError> {
        let overrides = store::load_or_default(store.as_ref(), store::ROUTINES_KEY).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                dispatcher,
                store,
                settings,
                book: RwLock::new(RoutineBook::new(overrides)),
                runs: Mutex::new(Runs::default()),
            }),
        })
    }

    pub fn definition(&self, name: &str) -> Option<RoutineDefinition> {
        self.inner.book().get(name)
    }

    pub fn definitions(&self) -> BTreeMap<String, RoutineDefinition> {
        self.inner.book().all()
    }

    /// Merge `patch` into a routine's overrides and persist them
    pub async fn configure(
        &self,
        name: &str,
        patch: RoutineOverride,
    ) -> Result<RoutineDefinition, RoutineError> {
        let (definition, overrides) = {
            let mut book = self
                .inner
                .book
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let definition = book.configure(name, patch)?;
            (definition, book.overrides().clone())
        };

        store::save(self.inner.store.as_ref(), store::ROUTINES_KEY, &overrides).await?;
        info!("Routine {} reconfigured: {:?}", name, definition);
        Ok(definition)
    }

    /// Start `name` in the background, optionally on a different target.
    ///
    /// Returns the resolved devices. Fails if any routine is already running.
    pub fn start(&self, name: &str, target: Option<&str>) -> Result<Vec<String>, RoutineError> {
        let definition = self
            .definition(name)
            .ok_or_else(|| RoutineError::UnknownRoutine(name.to_string()))?;
        let target = target.unwrap_or(&definition.target);

        // Check-and-spawn happens under one lock so two starts cannot both
        // see an idle scheduler.
        let mut runs = self.inner.runs();
        if let Some(active) = &runs.active {
            return Err(RoutineError::Busy {
                running: active.name.clone(),
            });
        }
        let targets = self.inner.dispatcher.resolve(target)?;

        runs.next_id += 1;
        let run = ActiveRun {
            id: runs.next_id,
            name: name.to_string(),
            targets: targets.clone(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        let plan = TransitionPlan::new(&definition);
        info!(
            "Starting routine {} on {} ({} device(s), {} steps)",
            name,
            target,
            targets.len(),
            plan.steps()
        );

        tokio::spawn(self.inner.clone().run(
            run.id,
            name.to_string(),
            targets.clone(),
            plan,
            run.cancel.clone(),
        ));
        runs.active = Some(run);

        Ok(targets)
    }

    /// Ask `name` to stop. True if it was the running routine.
    pub fn stop(&self, name: &str) -> bool {
        let runs = self.inner.runs();
        match &runs.active {
            Some(active) if active.name == name => {
                info!("Stopping routine {}", name);
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel the running routine if it drives any of `devices`, then wait
    /// (bounded) for its last command to land. True if a routine was cancelled.
    pub async fn cancel_driving(&self, devices: &[String]) -> bool {
        let finished = {
            let runs = self.inner.runs();
            match &runs.active {
                Some(active) if active.targets.iter().any(|t| devices.contains(t)) => {
                    info!("Cancelling routine {} before power off", active.name);
                    active.cancel.cancel();
                    active.finished.clone()
                }
                _ => return false,
            }
        };

        let wait = self.inner.settings.stop_wait;
        if tokio::time::timeout(wait, finished.cancelled()).await.is_err() {
            warn!("Routine still winding down after {:?}", wait);
        }
        true
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner
            .runs()
            .active
            .as_ref()
            .is_some_and(|active| active.name == name)
    }

    pub fn status(&self) -> RoutineStatus {
        let names = self.inner.book().all().into_keys();
        let runs = self.inner.runs();
        let active = runs.active.as_ref();

        RoutineStatus {
            running: names
                .map(|name| {
                    let running = active.is_some_and(|a| a.name == name);
                    (name, running)
                })
                .collect(),
            last_run: runs.last_run.clone(),
            running_targets: active
                .map(|a| (a.name.clone(), a.targets.clone()))
                .into_iter()
                .collect(),
        }
    }
}

impl Inner {
    fn runs(&self) -> MutexGuard<'_, Runs> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn book(&self) -> std::sync::RwLockReadGuard<'_, RoutineBook> {
        self.book.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(
        self: Arc<Self>,
        id: u64,
        name: String,
        targets: Vec<String>,
        plan: TransitionPlan,
        cancel: CancellationToken,
    ) {
        let steps = plan.steps();
        for step in 0..steps {
            if cancel.is_cancelled() {
                break;
            }
            let frame = plan.frame(step);
            debug!("Routine {} step {}/{}: {:?}", name, step + 1, steps, frame);

            for device in &targets {
                if cancel.is_cancelled() {
                    break;
                }
                self.apply_frame(device, frame).await;
            }

            if step + 1 < steps {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.step_interval) => {}
                }
            }
        }

        let mut runs = self.runs();
        runs.last_run.insert(name.clone(), Local::now());
        if runs.active.as_ref().is_some_and(|active| active.id == id) {
            if let Some(active) = runs.active.take() {
                active.finished.cancel();
            }
        }

        if cancel.is_cancelled() {
            info!("Routine {} cancelled", name);
        } else {
            info!("Routine {} completed", name);
        }
    }

    async fn apply_frame(&self, device: &str, frame: Frame) {
        let fixtures = self.dispatcher.fixtures();
        let commands = [
            Command::SetPower(true),
            Command::SetBrightness(frame.bright),
            Command::SetColorTemp(frame.ct),
        ];
        for command in &commands {
            if let Err(e) = fixtures.execute(device, command).await {
                warn!("Routine step {} failed on {}: {}", command.name(), device, e);
                return;
            }
        }

        let patch = StatePatch {
            power: Some(Power::On),
            bright: Some(frame.bright),
            ct: Some(frame.ct),
            color_mode: Some(ColorMode::Temperature),
            ..Default::default()
        };
        self.dispatcher.states().update(device, &patch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::mock::MockConnector;
    use crate::fixture::mock::test_directory;
    use crate::fixture::mock::test_dispatcher;
    use crate::store::MemoryStore;

    async fn scheduler(connector: &MockConnector, step_interval: Duration) -> RoutineScheduler {
        let directory = test_directory(&[("desk", "10.0.0.1"), ("porch", "10.0.0.2")]);
        RoutineScheduler::load(
            test_dispatcher(connector, directory).await,
            Arc::new(MemoryStore::new()),
            SchedulerSettings {
                step_interval,
                stop_wait: Duration::from_secs(2),
            },
        )
        .await
        .unwrap()
    }

    async fn wait_until_idle(scheduler: &RoutineScheduler) {
        for _ in 0..500 {
            if !scheduler.status().running.values().any(|r| *r) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("routine did not finish");
    }

    #[tokio::test]
    async fn test_unknown_routine_rejected() {
        let connector = MockConnector::new();
        let scheduler = scheduler(&connector, Duration::from_millis(1)).await;

        let err = scheduler.start("disco", None).unwrap_err();
        assert!(matches!(err, RoutineError::UnknownRoutine(_)));
    }

    #[tokio::test]
    async fn test_unknown_target_rejected() {
        let connector = MockConnector::new();
        let scheduler = scheduler(&connector, Duration::from_millis(1)).await;

        let err = scheduler.start("welcome", Some("garage")).unwrap_err();
        assert!(matches!(err, RoutineError::UnknownTarget(_)));
        assert!(!scheduler.is_running("welcome"));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let connector = MockConnector::new();
        let scheduler = scheduler(&connector, Duration::from_millis(50)).await;

        scheduler.start("sunrise", None).unwrap();
        let err = scheduler.start("sunset", None).unwrap_err();
        assert!(matches!(err, RoutineError::Busy { ref running } if running == "sunrise"));

        assert!(!scheduler.stop("sunset"));
        assert!(scheduler.stop("sunrise"));
        wait_until_idle(&scheduler).await;

        scheduler.start("sunset", None).unwrap();
        assert!(scheduler.is_running("sunset"));
        assert!(scheduler.status().last_run.contains_key("sunrise"));
    }

    #[tokio::test]
    async fn test_run_reaches_end_state() {
        let connector = MockConnector::new();
        let scheduler = scheduler(&connector, Duration::from_millis(1)).await;

        let targets = scheduler.start("welcome", Some("desk")).unwrap();
        assert_eq!(targets, vec!["desk"]);
        assert_eq!(
            scheduler.status().running_targets.get("welcome"),
            Some(&vec!["desk".to_string()])
        );
        wait_until_idle(&scheduler).await;

        let calls = connector.calls();
        assert_eq!(calls.len(), 60 * 3);
        assert_eq!(calls[1], "10.0.0.1 set_brightness 20");
        assert_eq!(calls[calls.len() - 1], "10.0.0.1 set_color_temp 4000");

        let state = scheduler.inner.dispatcher.states().get("desk").await.unwrap();
        assert_eq!(state.power, Power::On);
        assert_eq!(state.bright, Some(100));
        assert_eq!(state.ct, Some(4000));
        assert_eq!(state.color_mode, Some(ColorMode::Temperature));

        let status = scheduler.status();
        assert!(status.last_run.contains_key("welcome"));
        assert!(status.running_targets.is_empty());
    }

    #[tokio::test]
    async fn test_failing_device_does_not_abort_step() {
        let connector = MockConnector::new();
        connector.set_failing("10.0.0.1", true);
        let scheduler = scheduler(&connector, Duration::from_millis(1)).await;

        scheduler.start("welcome", None).unwrap();
        wait_until_idle(&scheduler).await;

        let states = scheduler.inner.dispatcher.states();
        assert!(states.get("desk").await.is_none());
        assert_eq!(states.get("porch").await.unwrap().bright, Some(100));
    }

    #[tokio::test]
    async fn test_cancel_driving_waits_for_stop() {
        let connector = MockConnector::new();
        let scheduler = scheduler(&connector, Duration::from_secs(5)).await;

        scheduler.start("sunrise", Some("porch")).unwrap();
        assert!(!scheduler.cancel_driving(&["desk".to_string()]).await);
        assert!(scheduler.is_running("sunrise"));

        assert!(scheduler.cancel_driving(&["porch".to_string()]).await);
        assert!(!scheduler.is_running("sunrise"));
        assert!(scheduler.status().last_run.contains_key("sunrise"));
    }

    #[tokio::test]
    async fn test_configure_persists_overrides() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryStore::new());
        let directory = test_directory(&[("desk", "10.0.0.1")]);
        let scheduler = RoutineScheduler::load(
            test_dispatcher(&connector, directory).await,
            store.clone(),
            SchedulerSettings::default(),
        )
        .await
        .unwrap();

        scheduler
            .configure(
                "welcome",
                RoutineOverride {
                    end_bright: Some(60),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let saved = store.get(store::ROUTINES_KEY).await.unwrap();
        assert_eq!(saved, Some(serde_json::json!({"welcome": {"end_bright": 60}})));
        assert_eq!(scheduler.definition("welcome").unwrap().end_bright, 60);
    }
}
