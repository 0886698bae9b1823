//! TOML configuration with defaults for every key.

use crate::history::DEFAULT_CAPACITY;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "flashr";
const CONFIG_FILE: &str = "flashr.toml";

/// How image bytes reach the raw device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyBackend {
    #[default]
    Native,
    Dd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashCfg {
    pub mount_timeout_secs: u64,
    pub block_size: usize,
    pub verify_sample_bytes: usize,
    pub progress_interval_ms: u64,
    pub compute_checksum: bool,
    pub copy_backend: CopyBackend,
    /// Bypass the page cache when writing natively.
    pub direct_io: bool,
}

impl Default for FlashCfg {
    fn default() -> Self {
        Self {
            mount_timeout_secs: 10,
            block_size: 1024 * 1024,
            verify_sample_bytes: 1024 * 1024,
            progress_interval_ms: 500,
            compute_checksum: true,
            copy_backend: CopyBackend::Native,
            direct_io: true,
        }
    }
}

impl FlashCfg {
    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageCfg {
    /// Defaults to `<data dir>/inventory.json`.
    pub inventory_path: Option<PathBuf>,
    /// Defaults to `<data dir>/history.json`.
    pub history_path: Option<PathBuf>,
    pub history_capacity: usize,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            inventory_path: None,
            history_path: None,
            history_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl StorageCfg {
    pub fn inventory_path(&self) -> PathBuf {
        self.inventory_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("inventory.json"))
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("history.json"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingCfg {
    /// An `EnvFilter` directive, e.g. `info` or `flashr_core=debug`.
    pub level: String,
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flash: FlashCfg,
    pub storage: StorageCfg,
    pub logging: LoggingCfg,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        toml::from_str(&s).with_context(|| format!("parse config: {}", path.display()))
    }

    /// Loads `explicit` if given (it must exist), otherwise the default config
    /// file if it exists, otherwise the built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }
}

/// `$XDG_DATA_HOME/flashr`, else `$HOME/.local/share/flashr`, else `./.flashr`.
pub fn default_data_dir() -> PathBuf {
    if let Some(xdg_data) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data).join(APP_DIR);
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR);
    }

    PathBuf::from(".flashr")
}

/// `$XDG_CONFIG_HOME/flashr/flashr.toml`, else `$HOME/.config/flashr/flashr.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join(APP_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.flash.mount_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.flash.progress_interval(), Duration::from_millis(500));
        assert_eq!(cfg.storage.history_capacity, 20);
        assert!(cfg.flash.compute_checksum);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [flash]
            copy_backend = "dd"
            mount_timeout_secs = 30

            [storage]
            history_path = "/tmp/flashr-history.json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.flash.copy_backend, CopyBackend::Dd);
        assert_eq!(cfg.flash.mount_timeout_secs, 30);
        assert_eq!(cfg.flash.block_size, 1024 * 1024);
        assert_eq!(cfg.storage.history_path(), PathBuf::from("/tmp/flashr-history.json"));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(toml::from_str::<Config>("[flash]\ncopy_backend = \"rsync\"").is_err());
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load_or_default(Some(&missing)).is_err());

        let present = dir.path().join("flashr.toml");
        fs::write(&present, "[logging]\nlevel = \"debug\"\n").unwrap();
        let cfg = Config::load_or_default(Some(&present)).unwrap();
        assert_eq!(cfg.logging.level, "debug");
    }
}
