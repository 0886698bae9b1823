//! The durable device inventory.
//!
//! Every physical device the application has ever seen gets one
//! [`InventoryRecord`], keyed by its [`DeviceIdentity`]. Records are created
//! and refreshed by [`crate::identity::DeviceIdentityResolver`] and edited by
//! the user (custom name, device type). They are never removed automatically.

use crate::identity::DeviceIdentity;
use crate::persist;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A user-assigned classification of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    UsbStick,
    SdCard,
    ExternalDrive,
    Other,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::UsbStick,
        DeviceType::SdCard,
        DeviceType::ExternalDrive,
        DeviceType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::UsbStick => "usb-stick",
            DeviceType::SdCard => "sd-card",
            DeviceType::ExternalDrive => "external-drive",
            DeviceType::Other => "other",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                anyhow!(
                    "unknown device type '{s}' (expected one of: usb-stick, sd-card, external-drive, other)"
                )
            })
    }
}

/// What the application remembers about one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub identity: DeviceIdentity,
    pub size: u64,
    /// The name reported by the device when it was first seen.
    pub name: String,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl InventoryRecord {
    /// The custom name if the user set one, the canonical name otherwise.
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }
}

/// Durable storage for [`InventoryRecord`]s, unique by identity.
pub trait InventoryStore: Send + Sync {
    fn get(&self, identity: &DeviceIdentity) -> Option<InventoryRecord>;

    /// Inserts or replaces the record with the same identity.
    fn put(&self, record: InventoryRecord) -> Result<()>;

    fn remove(&self, identity: &DeviceIdentity) -> Result<Option<InventoryRecord>>;

    /// All records, ordered by identity.
    fn records(&self) -> Vec<InventoryRecord>;

    /// Sets (or with `None`, clears) the user's name for a device.
    fn set_custom_name(
        &self,
        identity: &DeviceIdentity,
        name: Option<String>,
    ) -> Result<InventoryRecord> {
        let mut record = self
            .get(identity)
            .ok_or_else(|| anyhow!("no inventory record for '{identity}'"))?;
        record.custom_name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self.put(record.clone())?;
        Ok(record)
    }

    fn set_device_type(
        &self,
        identity: &DeviceIdentity,
        device_type: Option<DeviceType>,
    ) -> Result<InventoryRecord> {
        let mut record = self
            .get(identity)
            .ok_or_else(|| anyhow!("no inventory record for '{identity}'"))?;
        record.device_type = device_type;
        self.put(record.clone())?;
        Ok(record)
    }
}

/// An [`InventoryStore`] persisted as a JSON array on disk.
///
/// The whole file is loaded on open and rewritten atomically after every
/// change.
pub struct JsonInventoryStore {
    path: PathBuf,
    records: Mutex<BTreeMap<DeviceIdentity, InventoryRecord>>,
}

impl JsonInventoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let list: Vec<InventoryRecord> = persist::read_json_or_default(&path)?;
        debug!(path = %path.display(), records = list.len(), "loaded device inventory");
        let records = list
            .into_iter()
            .map(|r| (r.identity.clone(), r))
            .collect();
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceIdentity, InventoryRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, records: &BTreeMap<DeviceIdentity, InventoryRecord>) -> Result<()> {
        let list: Vec<&InventoryRecord> = records.values().collect();
        persist::write_json_atomic(&self.path, &list)
    }
}

impl InventoryStore for JsonInventoryStore {
    fn get(&self, identity: &DeviceIdentity) -> Option<InventoryRecord> {
        self.lock().get(identity).cloned()
    }

    fn put(&self, record: InventoryRecord) -> Result<()> {
        let mut records = self.lock();
        records.insert(record.identity.clone(), record);
        self.save(&records)
    }

    fn remove(&self, identity: &DeviceIdentity) -> Result<Option<InventoryRecord>> {
        let mut records = self.lock();
        let removed = records.remove(identity);
        if removed.is_some() {
            self.save(&records)?;
        }
        Ok(removed)
    }

    fn records(&self) -> Vec<InventoryRecord> {
        self.lock().values().cloned().collect()
    }
}
