use std::collections::HashMap;

use super::Registry;

/// Reverse lookups over a registry snapshot: hardware id -> name and
/// address -> name.
///
/// Cheap to build (one pass), so the reconciler rebuilds it after every
/// mutation instead of patching it incrementally.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    by_id: HashMap<String, String>,
    by_ip: HashMap<String, String>,
}

impl IdentityIndex {
    pub fn build(registry: &Registry) -> Self {
        let mut index = Self::default();
        for (name, record) in registry {
            if let Some(id) = record.id() {
                index.by_id.insert(id.to_string(), name.clone());
            }
            if let Some(ip) = record.ip() {
                index.by_ip.insert(ip.to_string(), name.clone());
            }
        }
        index
    }

    pub fn name_for_id(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    pub fn name_for_ip(&self, ip: &str) -> Option<&str> {
        self.by_ip.get(ip).map(String::as_str)
    }
}
