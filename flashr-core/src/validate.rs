//! Pre-flight safety checks.
//!
//! Nothing destructive happens before [`FlashPreconditionValidator::validate`]
//! has accepted the (image, device) pair, and validation itself only ever
//! checks for existence. The checks run in a fixed order and the first
//! failure wins:
//!
//! 1. the device node exists,
//! 2. the image is reachable,
//! 3. the device is writable,
//! 4. the image is strictly smaller than the device,
//! 5. the device path is not a mounted volume (`/Volumes/...`),
//! 6. the device path is not a partition slice (`disk4s1`),
//! 7. a raw node can be derived from the whole-disk node (`disk4` → `rdisk4`).

use crate::device::DeviceDescriptor;
use crate::error::FlashError;
use crate::image::{ImageAccess, ImageDescriptor};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// The path component under which the OS mounts volumes.
pub const VOLUMES_ROOT: &str = "Volumes";

const WHOLE_DISK_PREFIX: &str = "disk";
const RAW_DISK_PREFIX: &str = "rdisk";

/// Answers whether a device path exists.
pub trait PathProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl PathProbe for FsProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Clone)]
pub struct FlashPreconditionValidator {
    probe: Arc<dyn PathProbe>,
    images: Arc<dyn ImageAccess>,
}

impl FlashPreconditionValidator {
    pub fn new(probe: Arc<dyn PathProbe>, images: Arc<dyn ImageAccess>) -> Self {
        Self { probe, images }
    }

    /// Runs every check and returns the raw device path to write to.
    pub fn validate(
        &self,
        image: &ImageDescriptor,
        device: &DeviceDescriptor,
    ) -> Result<PathBuf, FlashError> {
        let path = device.path.as_path();

        if !self.probe.exists(path) {
            return reject(path, "device node does not exist", FlashError::DeviceNotFound);
        }
        if !self.images.exists(image) {
            warn!(image = %image.path().display(), "rejected: image is not reachable");
            return Err(FlashError::ImageNotFound);
        }
        if device.read_only {
            return reject(path, "device is read-only", FlashError::DeviceReadOnly);
        }
        if image.size() >= device.size {
            warn!(
                image_size = image.size(),
                device_size = device.size,
                "rejected: image does not fit on the device"
            );
            return Err(FlashError::ImageTooLarge);
        }
        if is_mounted_volume_path(path) {
            return reject(path, "path is a mounted volume", FlashError::DeviceNotFound);
        }
        if is_partition_slice(path) {
            return reject(path, "path is a partition slice", FlashError::DeviceNotFound);
        }

        match raw_device_path(path) {
            Some(raw) => {
                debug!(device = %path.display(), raw = %raw.display(), "preconditions passed");
                Ok(raw)
            }
            None => reject(path, "path is not a whole-disk node", FlashError::DeviceNotFound),
        }
    }
}

fn reject<T>(path: &Path, reason: &str, err: FlashError) -> Result<T, FlashError> {
    warn!(device = %path.display(), "rejected: {reason}");
    Err(err)
}

/// True for any path with a `Volumes` component, e.g. `/Volumes/USB_DRIVE`.
pub fn is_mounted_volume_path(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == VOLUMES_ROOT))
}

/// True when the last path segment ends in `s` followed by one or more
/// digits, e.g. `disk4s1`.
pub fn is_partition_slice(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let without_digits = name.trim_end_matches(|c: char| c.is_ascii_digit());
    without_digits.len() < name.len() && without_digits.ends_with('s')
}

/// Maps a whole-disk node to its raw, unbuffered twin in the same directory
/// (`/dev/disk4` → `/dev/rdisk4`). Returns `None` for anything that is not
/// `disk<digits>`.
pub fn raw_device_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let number = name.strip_prefix(WHOLE_DISK_PREFIX)?;
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(path.with_file_name(format!("{RAW_DISK_PREFIX}{number}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageKind;
    use std::io::{self, Read};

    struct Everything;
    impl PathProbe for Everything {
        fn exists(&self, _: &Path) -> bool {
            true
        }
    }
    impl ImageAccess for Everything {
        fn exists(&self, _: &ImageDescriptor) -> bool {
            true
        }
        fn open(&self, _: &ImageDescriptor) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(io::empty()))
        }
    }

    struct Nothing;
    impl PathProbe for Nothing {
        fn exists(&self, _: &Path) -> bool {
            false
        }
    }
    impl ImageAccess for Nothing {
        fn exists(&self, _: &ImageDescriptor) -> bool {
            false
        }
        fn open(&self, _: &ImageDescriptor) -> io::Result<Box<dyn Read + Send>> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn validator() -> FlashPreconditionValidator {
        FlashPreconditionValidator::new(Arc::new(Everything), Arc::new(Everything))
    }

    fn image(size: u64) -> ImageDescriptor {
        ImageDescriptor::new("/images/raspios.img", size, ImageKind::Img)
    }

    #[test]
    fn slice_detection() {
        assert!(is_partition_slice(Path::new("/dev/disk4s1")));
        assert!(is_partition_slice(Path::new("/dev/disk12s10")));
        assert!(!is_partition_slice(Path::new("/dev/disk4")));
        assert!(!is_partition_slice(Path::new("/dev/disks")));
        assert!(!is_partition_slice(Path::new("/")));
    }

    #[test]
    fn volume_detection() {
        assert!(is_mounted_volume_path(Path::new("/Volumes/USB_DRIVE")));
        assert!(is_mounted_volume_path(Path::new("/Volumes")));
        assert!(!is_mounted_volume_path(Path::new("/dev/disk4")));
        assert!(!is_mounted_volume_path(Path::new("/dev/MyVolumes")));
    }

    #[test]
    fn raw_path_derivation() {
        assert_eq!(raw_device_path(Path::new("/dev/disk4")), Some(PathBuf::from("/dev/rdisk4")));
        assert_eq!(raw_device_path(Path::new("/dev/disk12")), Some(PathBuf::from("/dev/rdisk12")));
        assert_eq!(raw_device_path(Path::new("/dev/rdisk4")), None);
        assert_eq!(raw_device_path(Path::new("/dev/disk")), None);
        assert_eq!(raw_device_path(Path::new("/dev/sda")), None);
    }

    #[test]
    fn checks_run_in_order() {
        let nothing = FlashPreconditionValidator::new(Arc::new(Nothing), Arc::new(Nothing));
        let mut device = DeviceDescriptor::new("/dev/disk4", 10);
        device.read_only = true;
        // Everything is wrong; the first check decides.
        assert_eq!(nothing.validate(&image(100), &device), Err(FlashError::DeviceNotFound));

        let no_image = FlashPreconditionValidator::new(Arc::new(Everything), Arc::new(Nothing));
        assert_eq!(no_image.validate(&image(100), &device), Err(FlashError::ImageNotFound));

        assert_eq!(validator().validate(&image(100), &device), Err(FlashError::DeviceReadOnly));

        device.read_only = false;
        assert_eq!(validator().validate(&image(100), &device), Err(FlashError::ImageTooLarge));
    }

    #[test]
    fn non_whole_disk_nodes_are_rejected() {
        let device = DeviceDescriptor::new("/dev/sdb", 1_000);
        assert_eq!(validator().validate(&image(10), &device), Err(FlashError::DeviceNotFound));
    }
}
