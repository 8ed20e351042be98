use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use super::scene::parse_scenes;
use super::EngineError;
use super::SceneStep;
use super::Scenes;
use crate::discovery::Discovery;
use crate::dispatch::Dispatcher;
use crate::fixture::Command;
use crate::fixture::FixtureConnector;
use crate::fixture::FixturePool;
use crate::presence::PresenceConfig;
use crate::presence::PresenceMonitor;
use crate::presence::PresenceStatus;
use crate::presence::PresenceUpdate;
use crate::probe::PresenceProbe;
use crate::registry;
use crate::registry::Directory;
use crate::registry::Groups;
use crate::registry::Registry;
use crate::routine::RoutineDefinition;
use crate::routine::RoutineError;
use crate::routine::RoutineOverride;
use crate::routine::RoutineScheduler;
use crate::routine::RoutineStatus;
use crate::routine::SchedulerSettings;
use crate::state::DeviceState;
use crate::state::Power;
use crate::store;
use crate::store::DocumentStore;

/// The outside world, as seen by the engine
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub connector: Arc<dyn FixtureConnector>,
    pub discovery: Arc<dyn Discovery>,
    pub probe: Arc<dyn PresenceProbe>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub command_timeout: Duration,
    pub probe_timeout: Duration,
    pub routines: SchedulerSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(1500),
            routines: SchedulerSettings::default(),
        }
    }
}

/// Aggregate power of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPower {
    On,
    Off,
    Mixed,
}

impl GroupPower {
    /// `on` if every member is known on, `off` if every member is known off
    fn of<'a>(members: impl IntoIterator<Item = Option<&'a DeviceState>>) -> Self {
        let mut any_on = false;
        let mut all_on = true;
        let mut any_unknown = false;

        for member in members {
            match member.map(|state| state.power).unwrap_or_default() {
                Power::On => any_on = true,
                Power::Off => all_on = false,
                Power::Unknown => {
                    all_on = false;
                    any_unknown = true;
                }
            }
        }

        if any_on && all_on {
            GroupPower::On
        } else if !any_on && !any_unknown {
            GroupPower::Off
        } else {
            GroupPower::Mixed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateReport {
    Device(DeviceState),
    Group {
        power: GroupPower,
        members: BTreeMap<String, Option<DeviceState>>,
    },
}

/// lumend engine
///
/// Owns the registry and every long-lived component, and exposes the
/// operations the HTTP layer is built on.
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    discovery: Arc<dyn Discovery>,
    directory: Directory,
    dispatcher: Arc<Dispatcher>,
    scheduler: RoutineScheduler,
    presence: Arc<PresenceMonitor>,
    scenes: Scenes,

    /// Serializes rescans; readers never wait on it
    reconcile_lock: Mutex<()>,
}

impl Engine {
    /// Load every persisted document and wire up the components
    pub async fn load(parts: Collaborators, settings: EngineSettings) -> Result<Self, EngineError> {
        let Collaborators {
            store,
            connector,
            discovery,
            probe,
        } = parts;

        let registry: Registry = store::load_or_default(store.as_ref(), store::REGISTRY_KEY).await?;
        let groups: Groups = store::load_or_default(store.as_ref(), store::GROUPS_KEY).await?;
        let scenes = match store::load_or_default(store.as_ref(), store::SCENES_KEY).await {
            Ok(document) => parse_scenes(document),
            Err(e) => {
                warn!("Ignoring unreadable scenes: {}", e);
                Scenes::new()
            }
        };
        info!(
            "Loaded {} device(s), {} group(s), {} scene(s)",
            registry.len(),
            groups.len(),
            scenes.len()
        );

        let directory = Directory::new(Arc::new(ArcSwap::from_pointee(registry)), groups);
        let fixtures = Arc::new(FixturePool::new(
            connector,
            directory.clone(),
            settings.command_timeout,
        ));
        let states = Arc::new(crate::state::StateStore::load(store.clone()).await?);
        let dispatcher = Arc::new(Dispatcher::new(directory.clone(), fixtures, states));

        let scheduler =
            RoutineScheduler::load(dispatcher.clone(), store.clone(), settings.routines).await?;
        let presence = Arc::new(
            PresenceMonitor::load(
                store.clone(),
                probe,
                settings.probe_timeout,
                scheduler.clone(),
                dispatcher.clone(),
            )
            .await?,
        );

        Ok(Self {
            store,
            discovery,
            directory,
            dispatcher,
            scheduler,
            presence,
            scenes,
            reconcile_lock: Mutex::new(()),
        })
    }

    /// Merge the seed list and a fresh discovery into the registry.
    ///
    /// The new registry is built on a private copy, persisted, then swapped
    /// in whole.
    pub async fn reconcile_now(&self) -> Result<Arc<Registry>, EngineError> {
        let _guard = self.reconcile_lock.lock().await;

        let seed: Registry = store::load_or_default(self.store.as_ref(), store::SEED_KEY).await?;
        let current = self.directory.registry();
        let discovered = self.discovery.discover().await;
        info!(
            "Reconciling {} known, {} seeded, {} discovered device(s)",
            current.len(),
            seed.len(),
            discovered.len()
        );

        let reconciled = Arc::new(registry::reconcile(&seed, &current, &discovered));
        store::save(self.store.as_ref(), store::REGISTRY_KEY, reconciled.as_ref()).await?;
        self.directory.shared_registry().store(reconciled.clone());

        info!("Registry now holds {} device(s)", reconciled.len());
        Ok(reconciled)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.directory.registry()
    }

    pub fn groups(&self) -> &Groups {
        self.directory.groups()
    }

    pub fn scenes(&self) -> &Scenes {
        &self.scenes
    }

    /// Live state of a device, or of every member of a group
    pub async fn get_state(&self, target: &str) -> Result<StateReport, EngineError> {
        let states = self.dispatcher.states();
        let fixtures = self.dispatcher.fixtures();

        if self.directory.is_device(target) {
            let state = states.read_live_or_fallback(target, fixtures).await;
            return Ok(StateReport::Device(state.unwrap_or_default()));
        }

        let names = self.dispatcher.resolve(target)?;
        let mut members = BTreeMap::new();
        for name in names {
            let state = states.read_live_or_fallback(&name, fixtures).await;
            members.insert(name, state);
        }

        Ok(StateReport::Group {
            power: GroupPower::of(members.values().map(Option::as_ref)),
            members,
        })
    }

    /// Live state of every registered device.
    ///
    /// Unreachable devices report their persisted state; a device that was
    /// never reached is left out.
    pub async fn all_states(&self) -> BTreeMap<String, DeviceState> {
        let states = self.dispatcher.states();
        let fixtures = self.dispatcher.fixtures();

        let mut out = BTreeMap::new();
        for name in self.registry().keys() {
            if let Some(state) = states.read_live_or_fallback(name, fixtures).await {
                out.insert(name.clone(), state);
            }
        }
        out
    }

    /// Send `command` to every device `target` names, best effort.
    ///
    /// Powering off first stops any routine driving one of the devices, so
    /// no routine step lands after the off.
    pub async fn apply_command(
        &self,
        target: &str,
        command: Command,
    ) -> Result<Vec<String>, EngineError> {
        let names = self.dispatcher.resolve(target)?;
        let command = command.clamped();

        if command.is_power_off() {
            self.scheduler.cancel_driving(&names).await;
        }

        info!("{} -> {}", command.name(), target);
        self.dispatcher.send_all(&names, &command).await;
        Ok(names)
    }

    pub async fn run_scene(&self, name: &str) -> Result<(), EngineError> {
        let steps = self
            .scenes
            .get(name)
            .ok_or_else(|| EngineError::UnknownScene(name.to_string()))?;
        info!("Running scene {} ({} steps)", name, steps.len());
        self.run_steps(steps).await;
        Ok(())
    }

    /// Run steps in order; steps with an unknown target are skipped
    pub async fn run_steps(&self, steps: &[SceneStep]) {
        for step in steps {
            if let Err(e) = self.apply_command(&step.target, step.command.clone()).await {
                warn!("Skipping scene step: {}", e);
            }
            if step.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(step.sleep_ms)).await;
            }
        }
    }

    pub fn presence(&self) -> &Arc<PresenceMonitor> {
        &self.presence
    }

    pub fn presence_config(&self) -> PresenceConfig {
        self.presence.config()
    }

    pub async fn update_presence(&self, update: PresenceUpdate) -> Result<PresenceConfig, EngineError> {
        Ok(self.presence.update_config(update).await?)
    }

    pub fn presence_status(&self) -> PresenceStatus {
        self.presence.status()
    }

    pub fn routines(&self) -> BTreeMap<String, RoutineDefinition> {
        self.scheduler.definitions()
    }

    /// Apply overrides for several routines. Nothing changes if any name
    /// is unknown.
    pub async fn configure_routines(
        &self,
        overrides: BTreeMap<String, RoutineOverride>,
    ) -> Result<BTreeMap<String, RoutineDefinition>, EngineError> {
        if let Some(unknown) = overrides
            .keys()
            .find(|name| self.scheduler.definition(name).is_none())
        {
            return Err(RoutineError::UnknownRoutine(unknown.clone()).into());
        }

        for (name, patch) in overrides {
            self.scheduler.configure(&name, patch).await?;
        }
        Ok(self.routines())
    }

    pub fn start_routine(&self, name: &str, target: Option<&str>) -> Result<Vec<String>, EngineError> {
        Ok(self.scheduler.start(name, target)?)
    }

    pub fn stop_routine(&self, name: &str) -> bool {
        self.scheduler.stop(name)
    }

    pub fn routine_status(&self) -> RoutineStatus {
        self.scheduler.status()
    }
}
