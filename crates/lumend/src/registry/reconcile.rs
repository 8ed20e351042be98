use std::collections::BTreeSet;
use std::collections::HashSet;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::non_empty;
use super::DeviceRecord;
use super::DiscoveredDevice;
use super::IdentityIndex;
use super::Registry;

/// Name given to a device that reported neither id nor address
const UNKNOWN_NAME: &str = "bulb_unknown";

/// Merge the seed list, the current registry and a fresh discovery snapshot
/// into a registry where every known device appears under exactly one name.
///
/// Rules, in order:
/// 1. Seed names always exist; non-empty seed fields win over stored ones but
///    an empty seed field never erases stored data.
/// 2. Each discovered device is matched by hardware id first, then address.
///    When id and address point at two different names the device is known
///    under two aliases: the id-matched name is kept, missing fields are
///    copied over from the other one, and the other one is removed.
/// 3. A matched name is patched with the discovered id/address so stale
///    addresses heal. Unmatched devices get a deterministic `bulb_*` name.
/// 4. A final pass removes any name still sharing an id or address with an
///    earlier one. Seed names are visited first, then the rest in name order.
///
/// Entries reporting neither id nor address are skipped.
pub fn reconcile(seed: &Registry, current: &Registry, discovered: &[DiscoveredDevice]) -> Registry {
    let mut merged = current.clone();

    for (name, entry) in seed {
        let record = merged.entry(name.clone()).or_default();
        if let Some(id) = entry.id() {
            record.id = Some(id.to_string());
        }
        if let Some(ip) = entry.ip() {
            record.ip = Some(ip.to_string());
        }
    }

    let mut index = IdentityIndex::build(&merged);

    for device in discovered {
        let ip = non_empty(&device.ip);
        let id = non_empty(&device.id);
        if ip.is_none() && id.is_none() {
            debug!("Skipping discovery entry without id or address");
            continue;
        }

        let name_for_id = id.and_then(|id| index.name_for_id(id)).map(str::to_string);
        let name_for_ip = ip.and_then(|ip| index.name_for_ip(ip)).map(str::to_string);

        if let (Some(keep), Some(drop)) = (&name_for_id, &name_for_ip) {
            if keep != drop {
                consolidate(&mut merged, keep, drop);
                index = IdentityIndex::build(&merged);
            }
        }

        let existing = id
            .and_then(|id| index.name_for_id(id))
            .or_else(|| ip.and_then(|ip| index.name_for_ip(ip)))
            .map(str::to_string);

        match existing {
            Some(name) => {
                if let Some(record) = merged.get_mut(&name) {
                    if let Some(id) = id {
                        record.id = Some(id.to_string());
                    }
                    if let Some(ip) = ip {
                        if record.ip() != Some(ip) {
                            debug!("Device {} moved to {}", name, ip);
                        }
                        record.ip = Some(ip.to_string());
                    }
                }
            }
            None => {
                let name = unique_name(&merged, auto_name(ip, id));
                info!(
                    "New device {} (ip={}, id={})",
                    name,
                    ip.unwrap_or("-"),
                    id.unwrap_or("-")
                );
                merged.insert(name, DeviceRecord::new(ip, id));
            }
        }

        index = IdentityIndex::build(&merged);
    }

    drop_duplicates(&mut merged, seed);
    merged
}

/// Deterministic name for a device that is not in the registry yet.
///
/// Prefers the last six characters of the hardware id, then the address with
/// separators turned into underscores.
pub fn auto_name(ip: Option<&str>, id: Option<&str>) -> String {
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        let start = id.char_indices().rev().nth(5).map(|(i, _)| i).unwrap_or(0);
        return format!("bulb_{}", &id[start..]);
    }
    if let Some(ip) = ip.filter(|ip| !ip.is_empty()) {
        return format!("bulb_{}", ip.replace(['.', ':'], "_"));
    }
    UNKNOWN_NAME.to_string()
}

fn unique_name(registry: &Registry, base: String) -> String {
    if !registry.contains_key(&base) {
        return base;
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{}_{}", base, suffix);
        if !registry.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Fold `drop` into `keep`, filling only the fields `keep` is missing.
fn consolidate(registry: &mut Registry, keep: &str, drop: &str) {
    let Some(dropped) = registry.remove(drop) else {
        return;
    };
    info!("Consolidating {} into {}", drop, keep);

    let kept = registry.entry(keep.to_string()).or_default();
    if kept.ip().is_none() {
        if let Some(ip) = dropped.ip() {
            kept.ip = Some(ip.to_string());
        }
    }
    if kept.id().is_none() {
        if let Some(id) = dropped.id() {
            kept.id = Some(id.to_string());
        }
    }
}

fn drop_duplicates(registry: &mut Registry, seed: &Registry) {
    let order: Vec<String> = registry
        .keys()
        .filter(|name| seed.contains_key(*name))
        .chain(registry.keys().filter(|name| !seed.contains_key(*name)))
        .cloned()
        .collect();

    let mut seen_ids = HashSet::new();
    let mut seen_ips = HashSet::new();
    let mut duplicates = BTreeSet::new();

    for name in order {
        let Some(record) = registry.get(&name) else {
            continue;
        };
        let id_taken = record.id().is_some_and(|id| seen_ids.contains(id));
        let ip_taken = record.ip().is_some_and(|ip| seen_ips.contains(ip));
        if id_taken || ip_taken {
            duplicates.insert(name);
            continue;
        }
        if let Some(id) = record.id() {
            seen_ids.insert(id.to_string());
        }
        if let Some(ip) = record.ip() {
            seen_ips.insert(ip.to_string());
        }
    }

    for name in duplicates {
        warn!("Removing duplicate registry entry {}", name);
        registry.remove(&name);
    }
}
