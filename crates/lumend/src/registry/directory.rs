use std::collections::BTreeMap;
use std::sync::Arc;

use super::Registry;
use super::SharedRegistry;

/// Group name -> ordered member device names
pub type Groups = BTreeMap<String, Vec<String>>;

/// Target name that expands to every registry entry
pub const ALL_TARGET: &str = "all";

/// Resolves command targets (a device, a group or `all`) to device names.
#[derive(Clone)]
pub struct Directory {
    registry: SharedRegistry,
    groups: Arc<Groups>,
}

impl Directory {
    pub fn new(registry: SharedRegistry, groups: Groups) -> Self {
        Self {
            registry,
            groups: Arc::new(groups),
        }
    }

    /// Current registry snapshot
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.load_full()
    }

    pub fn shared_registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &Groups {
        &self.groups
    }

    pub fn is_device(&self, name: &str) -> bool {
        self.registry.load().contains_key(name)
    }

    pub fn is_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Last known address of a device
    pub fn address(&self, name: &str) -> Option<String> {
        self.registry
            .load()
            .get(name)
            .and_then(|record| record.ip())
            .map(str::to_string)
    }

    /// Expand a target into device names.
    ///
    /// A registry name wins over a group of the same name. Returns `None` when
    /// the target names nothing, including an empty group.
    pub fn resolve(&self, target: &str) -> Option<Vec<String>> {
        let registry = self.registry.load();
        let names = if registry.contains_key(target) {
            vec![target.to_string()]
        } else if let Some(members) = self.groups.get(target) {
            members.clone()
        } else if target == ALL_TARGET {
            registry.keys().cloned().collect()
        } else {
            return None;
        };

        if names.is_empty() { None } else { Some(names) }
    }
}

#[cfg(test)]
mod tests {
    use arc_swap::ArcSwap;

    use super::*;
    use crate::registry::DeviceRecord;

    fn directory() -> Directory {
        let mut registry = Registry::new();
        registry.insert("k1".to_string(), DeviceRecord::new(Some("10.0.0.1"), None));
        registry.insert("k2".to_string(), DeviceRecord::new(None, Some("0x02")));
        registry.insert("tv".to_string(), DeviceRecord::new(Some("10.0.0.3"), None));

        let mut groups = Groups::new();
        groups.insert("kitchen".to_string(), vec!["k1".to_string(), "k2".to_string()]);
        groups.insert("empty".to_string(), Vec::new());

        Directory::new(Arc::new(ArcSwap::from_pointee(registry)), groups)
    }

    #[test]
    fn test_resolve_targets() {
        let directory = directory();

        assert_eq!(directory.resolve("tv"), Some(vec!["tv".to_string()]));
        assert_eq!(
            directory.resolve("kitchen"),
            Some(vec!["k1".to_string(), "k2".to_string()])
        );
        assert_eq!(directory.resolve("all").map(|names| names.len()), Some(3));
        assert_eq!(directory.resolve("garage"), None);
        assert_eq!(directory.resolve("empty"), None);
    }

    #[test]
    fn test_address_requires_ip() {
        let directory = directory();

        assert_eq!(directory.address("k1").as_deref(), Some("10.0.0.1"));
        assert_eq!(directory.address("k2"), None);
        assert_eq!(directory.address("missing"), None);
    }
}
