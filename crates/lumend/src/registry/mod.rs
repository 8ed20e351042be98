//! Device registry: the durable mapping from friendly names to network identity.

mod directory;
mod index;
mod reconcile;

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use serde::Serialize;

pub use directory::Directory;
pub use directory::ALL_TARGET;
pub use directory::Groups;
pub use index::IdentityIndex;
pub use reconcile::auto_name;
pub use reconcile::reconcile;

/// Network identity of one fixture.
///
/// Either field may be missing: the seed list often only knows the hardware
/// id, and discovery can report an address before the id is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl DeviceRecord {
    pub fn new(ip: Option<&str>, id: Option<&str>) -> Self {
        Self {
            ip: ip.map(str::to_string),
            id: id.map(str::to_string),
        }
    }

    /// The address, if set and non-empty
    pub fn ip(&self) -> Option<&str> {
        non_empty(&self.ip)
    }

    /// The hardware id, if set and non-empty
    pub fn id(&self) -> Option<&str> {
        non_empty(&self.id)
    }
}

/// Name -> identity. Ordered so every pass over it is deterministic.
pub type Registry = BTreeMap<String, DeviceRecord>;

/// Registry snapshot shared between readers and the reconciler.
///
/// Reconciliation builds a private copy and stores it in one swap, so readers
/// never observe a partially merged registry.
pub type SharedRegistry = Arc<ArcSwap<Registry>>;

/// One reply from network discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub ip: Option<String>,
    pub id: Option<String>,
}

impl DiscoveredDevice {
    pub fn new(ip: Option<&str>, id: Option<&str>) -> Self {
        Self {
            ip: ip.map(str::to_string),
            id: id.map(str::to_string),
        }
    }
}

pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
