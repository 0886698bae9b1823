//! The image history: the most recently used images and their checksums.

use crate::persist;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub path: PathBuf,
    /// Lowercase hex SHA-256.
    pub checksum: String,
    pub recorded_at: DateTime<Utc>,
}

/// A capacity-bounded list of images, newest first, with one entry per path.
pub trait ImageHistoryStore: Send + Sync {
    /// Records the checksum computed for `path`, moving it to the front.
    fn record(&self, path: &Path, checksum: &str) -> Result<()>;

    fn checksum_for(&self, path: &Path) -> Option<String>;

    fn entries(&self) -> Vec<HistoryEntry>;
}

pub struct JsonImageHistory {
    path: PathBuf,
    capacity: usize,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl JsonImageHistory {
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let capacity = capacity.max(1);
        let mut entries: Vec<HistoryEntry> = persist::read_json_or_default(&path)?;
        entries.truncate(capacity);
        debug!(path = %path.display(), entries = entries.len(), "loaded image history");
        Ok(Self {
            path,
            capacity,
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistoryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ImageHistoryStore for JsonImageHistory {
    fn record(&self, path: &Path, checksum: &str) -> Result<()> {
        let mut entries = self.lock();
        entries.retain(|e| e.path != path);
        entries.insert(
            0,
            HistoryEntry {
                path: path.to_path_buf(),
                checksum: checksum.to_lowercase(),
                recorded_at: Utc::now(),
            },
        );
        entries.truncate(self.capacity);
        persist::write_json_atomic(&self.path, &*entries)
    }

    fn checksum_for(&self, path: &Path) -> Option<String> {
        self.lock()
            .iter()
            .find(|e| e.path == path)
            .map(|e| e.checksum.clone())
    }

    fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }
}
