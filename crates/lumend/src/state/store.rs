use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use super::DeviceState;
use super::StatePatch;
use super::LIVE_PROPERTIES;
use crate::fixture::FixturePool;
use crate::store;
use crate::store::DocumentStore;
use crate::store::StoreError;

/// Best-known state of every device, persisted as one document.
///
/// Patches are applied and persisted under a single lock, so a reader always
/// sees a device either before or after a whole patch.
pub struct StateStore {
    store: Arc<dyn DocumentStore>,
    states: Mutex<BTreeMap<String, DeviceState>>,
}

impl StateStore {
    /// Load the persisted snapshot
    pub async fn load(store: Arc<dyn DocumentStore>) -> Result<Self, StoreError> {
        let states = store::load_or_default(store.as_ref(), store::STATE_KEY).await?;
        Ok(Self {
            store,
            states: Mutex::new(states),
        })
    }

    /// Persisted state of one device
    pub async fn get(&self, name: &str) -> Option<DeviceState> {
        self.states.lock().await.get(name).cloned()
    }

    pub async fn all(&self) -> BTreeMap<String, DeviceState> {
        self.states.lock().await.clone()
    }

    /// Merge the set fields of `patch` into a device's state.
    ///
    /// Writes to the document store only when a value actually changed.
    /// Returns the resulting state.
    pub async fn update(&self, name: &str, patch: &StatePatch) -> DeviceState {
        let mut states = self.states.lock().await;
        let state = states.entry(name.to_string()).or_default();
        let changed = state.apply(patch);
        let result = state.clone();

        if changed {
            debug!("State of {} is now {:?}", name, result);
            if let Err(e) = store::save(self.store.as_ref(), store::STATE_KEY, &*states).await {
                warn!("Failed to persist device state: {}", e);
            }
        }

        result
    }

    /// Read a device live, falling back to the persisted state.
    ///
    /// A successful read is written through [`StateStore::update`] and the
    /// merged result returned; any field the fixture did not report keeps its
    /// persisted value. When the fixture cannot be read the persisted state
    /// is returned untouched.
    pub async fn read_live_or_fallback(
        &self,
        name: &str,
        fixtures: &FixturePool,
    ) -> Option<DeviceState> {
        match fixtures.properties(name, LIVE_PROPERTIES).await {
            Ok(props) => {
                let patch = StatePatch::from_properties(&props);
                Some(self.update(name, &patch).await)
            }
            Err(e) => {
                warn!("Live read of {} failed, using last known state: {}", name, e);
                self.get(name).await
            }
        }
    }
}
