//! Best-effort command fan-out to devices.

use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::fixture::Command;
use crate::fixture::FixtureError;
use crate::fixture::FixturePool;
use crate::registry::Directory;
use crate::state::StateStore;

/// A target resolved to neither a device, a group nor `all`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown target {0}")]
pub struct UnknownTarget(pub String);

/// Sends commands to devices and records what succeeded.
///
/// Failures are isolated per device: they are logged and the remaining
/// devices still receive the command.
pub struct Dispatcher {
    directory: Directory,
    fixtures: Arc<FixturePool>,
    states: Arc<StateStore>,
}

impl Dispatcher {
    pub fn new(directory: Directory, fixtures: Arc<FixturePool>, states: Arc<StateStore>) -> Self {
        Self {
            directory,
            fixtures,
            states,
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn fixtures(&self) -> &FixturePool {
        &self.fixtures
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub fn resolve(&self, target: &str) -> Result<Vec<String>, UnknownTarget> {
        self.directory
            .resolve(target)
            .ok_or_else(|| UnknownTarget(target.to_string()))
    }

    /// Send a command to one device, recording the resulting state on success
    pub async fn send(&self, name: &str, command: &Command) -> Result<(), FixtureError> {
        self.fixtures.execute(name, command).await?;

        let previous = match command {
            Command::Toggle => self.states.get(name).await,
            _ => None,
        };
        let patch = command.state_patch(previous.as_ref());
        if !patch.is_empty() {
            self.states.update(name, &patch).await;
        }
        Ok(())
    }

    /// Send a command to every named device. Returns how many failed.
    pub async fn send_all(&self, names: &[String], command: &Command) -> usize {
        let mut failed = 0;
        for name in names {
            if let Err(e) = self.send(name, command).await {
                warn!("{} failed on {}: {}", command.name(), name, e);
                failed += 1;
            }
        }
        debug!(
            "{} sent to {} device(s), {} failed",
            command.name(),
            names.len(),
            failed
        );
        failed
    }

    /// Resolve `target` and send `command` to every device it names.
    ///
    /// Succeeds once every device has been tried, whether or not each one
    /// accepted the command. Returns the device names.
    pub async fn apply(&self, target: &str, command: &Command) -> Result<Vec<String>, UnknownTarget> {
        let names = self.resolve(target)?;
        self.send_all(&names, command).await;
        Ok(names)
    }
}
