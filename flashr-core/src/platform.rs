//! Provides platform-specific device discovery.
//!
//! Flashing targets whole-disk nodes with raw twins (`/dev/disk4` and
//! `/dev/rdisk4`), so discovery is implemented for macOS, where it is built
//! on `diskutil`. Other platforms report that discovery is unsupported; a
//! front-end can still describe a device by hand.

use crate::device::DeviceDescriptor;
use anyhow::Result;

pub mod diskutil;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use self::macos::get_removable_devices;

/// Discovers removable devices.
#[cfg(not(target_os = "macos"))]
pub fn get_removable_devices() -> Result<Vec<DeviceDescriptor>> {
    anyhow::bail!("removable device discovery is only supported on macOS")
}

/// Yields the removable devices currently attached.
pub trait DeviceEnumerator: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// The enumerator for the host platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnumerator;

impl DeviceEnumerator for SystemEnumerator {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        get_removable_devices()
    }
}
