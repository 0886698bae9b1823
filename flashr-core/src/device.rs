use std::fmt;
use std::path::{Path, PathBuf};

/// One partition (slice) of a detected disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// The partition's device node (e.g., `/dev/disk4s1`).
    pub path: PathBuf,
    /// The partition size in bytes.
    pub size: u64,
    /// The volume name, if the partition carries a filesystem with one.
    pub volume_name: Option<String>,
    /// Where the partition is currently mounted, if anywhere.
    pub mount_point: Option<PathBuf>,
}

/// Raw attributes of a detected block device, as reported by the enumerator.
///
/// A descriptor describes one detection cycle and is never mutated by the
/// core. Stable identity across reconnects is derived from it by
/// [`crate::identity::resolve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// The whole-disk node (e.g., `/dev/disk4`).
    pub path: PathBuf,
    /// The total size of the device in bytes.
    pub size: u64,
    pub removable: bool,
    pub read_only: bool,
    pub ejectable: bool,
    pub vendor: Option<String>,
    pub revision: Option<String>,
    pub media_name: Option<String>,
    /// The bus protocol (e.g., "USB", "Secure Digital").
    pub protocol: Option<String>,
    pub partitions: Vec<PartitionDescriptor>,
    /// A persistent media identifier, when the OS exposes one.
    pub persistent_id: Option<String>,
    /// A mount point of the whole disk itself (unpartitioned media).
    pub mount_point: Option<PathBuf>,
}

impl DeviceDescriptor {
    /// A descriptor with the given path and size and every optional attribute
    /// unset.
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            removable: true,
            read_only: false,
            ejectable: true,
            vendor: None,
            revision: None,
            media_name: None,
            protocol: None,
            partitions: Vec::new(),
            persistent_id: None,
            mount_point: None,
        }
    }

    /// Every mount point on this device, whole disk first.
    pub fn mount_points(&self) -> impl Iterator<Item = &Path> {
        self.mount_point
            .as_deref()
            .into_iter()
            .chain(self.partitions.iter().filter_map(|p| p.mount_point.as_deref()))
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_points().next().is_some()
    }

    /// A human readable name: the media name, then the vendor, then the node.
    pub fn display_name(&self) -> String {
        self.media_name
            .as_deref()
            .or(self.vendor.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.path.display().to_string())
            })
    }

    pub fn size_gb(&self) -> f64 {
        self.size as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mount_points().next() {
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<15} {:<25} {:.1} GB {}",
            self.path.display(),
            self.display_name(),
            self.size_gb(),
            mount_info
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounted_when_any_partition_has_a_mount_point() {
        let mut device = DeviceDescriptor::new("/dev/disk4", 8_000_000_000);
        assert!(!device.is_mounted());

        device.partitions.push(PartitionDescriptor {
            path: PathBuf::from("/dev/disk4s1"),
            size: 200_000_000,
            volume_name: Some("EFI".to_string()),
            mount_point: None,
        });
        assert!(!device.is_mounted());

        device.partitions.push(PartitionDescriptor {
            path: PathBuf::from("/dev/disk4s2"),
            size: 7_000_000_000,
            volume_name: Some("USB_DRIVE".to_string()),
            mount_point: Some(PathBuf::from("/Volumes/USB_DRIVE")),
        });
        assert!(device.is_mounted());
        assert_eq!(
            device.mount_points().collect::<Vec<_>>(),
            vec![Path::new("/Volumes/USB_DRIVE")]
        );
    }

    #[test]
    fn display_name_falls_back_to_node_name() {
        let mut device = DeviceDescriptor::new("/dev/disk4", 1);
        assert_eq!(device.display_name(), "disk4");
        device.vendor = Some("SanDisk".to_string());
        assert_eq!(device.display_name(), "SanDisk");
        device.media_name = Some("Cruzer Blade".to_string());
        assert_eq!(device.display_name(), "Cruzer Blade");
    }
}
