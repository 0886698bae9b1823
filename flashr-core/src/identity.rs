//! Stable identities for physical devices.
//!
//! Device nodes are reassigned on every reconnect (`disk4` today may be
//! `disk6` tomorrow), so the inventory is keyed by a [`DeviceIdentity`]
//! derived from the device's own attributes instead.
//!
//! The OS-provided persistent media identifier is always preferred. Without
//! one, the identity falls back to `vendor_revision_sizeprefix`, which can
//! collide for two distinct devices of the same make, model and capacity
//! class. Such devices share one inventory record.

use crate::device::DeviceDescriptor;
use crate::inventory::{InventoryRecord, InventoryStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

const UNKNOWN: &str = "Unknown";
const SIZE_PREFIX_DIGITS: usize = 4;

/// A best-effort identifier of a physical device, stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the identity of the device behind `descriptor`.
///
/// Pure: identical attributes always produce the identical identity.
pub fn resolve(descriptor: &DeviceDescriptor) -> DeviceIdentity {
    if let Some(id) = descriptor.persistent_id.as_deref() {
        if !id.is_empty() {
            return DeviceIdentity(id.to_string());
        }
    }

    let vendor = sanitize(descriptor.vendor.as_deref());
    let revision = sanitize(descriptor.revision.as_deref());
    let size = descriptor.size.to_string();
    let size_prefix: String = size.chars().take(SIZE_PREFIX_DIGITS).collect();

    DeviceIdentity(format!("{vendor}_{revision}_{size_prefix}"))
}

fn sanitize(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.replace(' ', "_"),
        _ => UNKNOWN.to_string(),
    }
}

/// Correlates observed devices with the persisted inventory.
pub struct DeviceIdentityResolver<S> {
    store: S,
}

impl<S: InventoryStore> DeviceIdentityResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// See [`resolve`].
    pub fn resolve(&self, descriptor: &DeviceDescriptor) -> DeviceIdentity {
        resolve(descriptor)
    }

    /// Finds or creates the inventory record for `identity` and marks it as
    /// seen now.
    ///
    /// An existing record only has its `last_seen` refreshed: user edits and
    /// the originally recorded name are kept. This never fails; if the store
    /// cannot be written the up-to-date record is still returned.
    pub fn merge(&self, identity: &DeviceIdentity, descriptor: &DeviceDescriptor) -> InventoryRecord {
        let now = Utc::now();
        let record = match self.store.get(identity) {
            Some(mut existing) => {
                debug!(%identity, "device seen again");
                existing.last_seen = now;
                existing
            }
            None => {
                info!(%identity, path = %descriptor.path.display(), "new device added to inventory");
                InventoryRecord {
                    identity: identity.clone(),
                    size: descriptor.size,
                    name: descriptor.display_name(),
                    custom_name: None,
                    device_type: None,
                    vendor: descriptor.vendor.clone(),
                    revision: descriptor.revision.clone(),
                    first_seen: now,
                    last_seen: now,
                }
            }
        };

        if let Err(e) = self.store.put(record.clone()) {
            warn!(%identity, "failed to persist inventory record: {e:#}");
        }
        record
    }

    /// Resolves and merges in one step. Called for every observed descriptor.
    pub fn observe(&self, descriptor: &DeviceDescriptor) -> InventoryRecord {
        let identity = self.resolve(descriptor);
        self.merge(&identity, descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{DeviceType, JsonInventoryStore};
    use tempfile::tempdir;

    fn sandisk() -> DeviceDescriptor {
        let mut d = DeviceDescriptor::new("/dev/disk4", 15_931_539_456);
        d.vendor = Some("SanDisk ".to_string());
        d.revision = Some("1.00".to_string());
        d.media_name = Some("Cruzer Blade".to_string());
        d
    }

    #[test]
    fn persistent_id_wins() {
        let mut d = sandisk();
        d.persistent_id = Some("8F2A0C1E-0000-4000-8000-1234567890AB".to_string());
        assert_eq!(resolve(&d).as_str(), "8F2A0C1E-0000-4000-8000-1234567890AB");
    }

    #[test]
    fn empty_persistent_id_falls_back() {
        let mut d = sandisk();
        d.persistent_id = Some(String::new());
        assert_eq!(resolve(&d).as_str(), "SanDisk_1.00_1593");
    }

    #[test]
    fn fallback_sanitizes_and_defaults() {
        let mut d = DeviceDescriptor::new("/dev/disk5", 512);
        d.vendor = Some("Generic Mass Storage".to_string());
        assert_eq!(resolve(&d).as_str(), "Generic_Mass_Storage_Unknown_512");

        d.vendor = None;
        assert_eq!(resolve(&d).as_str(), "Unknown_Unknown_512");
    }

    #[test]
    fn resolve_is_deterministic_and_ignores_the_node_path() {
        let a = sandisk();
        let mut b = sandisk();
        b.path = "/dev/disk7".into();
        assert_eq!(resolve(&a), resolve(&a));
        assert_eq!(resolve(&a), resolve(&b));
    }

    #[test]
    fn merge_creates_then_refreshes() {
        let dir = tempdir().unwrap();
        let store = JsonInventoryStore::open(dir.path().join("inventory.json")).unwrap();
        let resolver = DeviceIdentityResolver::new(store);

        let first = resolver.observe(&sandisk());
        assert_eq!(first.first_seen, first.last_seen);
        assert_eq!(first.name, "Cruzer Blade");
        assert_eq!(first.size, 15_931_539_456);

        resolver
            .store()
            .set_custom_name(&first.identity, Some("Installer".to_string()))
            .unwrap();
        resolver
            .store()
            .set_device_type(&first.identity, Some(DeviceType::UsbStick))
            .unwrap();

        // Replugged under a different node.
        let mut again = sandisk();
        again.path = "/dev/disk6".into();
        let second = resolver.observe(&again);

        assert_eq!(second.identity, first.identity);
        assert_eq!(second.first_seen, first.first_seen);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(second.custom_name.as_deref(), Some("Installer"));
        assert_eq!(second.device_type, Some(DeviceType::UsbStick));
        assert_eq!(resolver.store().records().len(), 1);
    }

    #[test]
    fn merge_persists_every_sighting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        let record = {
            let resolver = DeviceIdentityResolver::new(JsonInventoryStore::open(&path).unwrap());
            resolver.observe(&sandisk())
        };

        let reopened = JsonInventoryStore::open(&path).unwrap();
        assert_eq!(reopened.get(&record.identity), Some(record));
    }
}
