use super::diskutil::{self, DiskInfo};
use crate::device::DeviceDescriptor;
use anyhow::{Context, Result};
use tracing::{debug, warn};

fn run_diskutil(args: &[&str]) -> Result<Vec<u8>> {
    let output = duct::cmd("diskutil", args.iter().copied())
        .stdout_capture()
        .stderr_capture()
        .run()
        .with_context(|| format!("diskutil {}", args.join(" ")))?;
    Ok(output.stdout)
}

/// The whole disk holding the root filesystem, e.g. `disk3`.
fn system_whole_disk() -> Option<String> {
    let info = run_diskutil(&["info", "-plist", "/"])
        .and_then(|out| diskutil::parse_info(&out))
        .ok()?;
    info.parent_whole_disk
        .or(info.device_node)
        .and_then(|node| diskutil::whole_disk_of(&node))
}

/// Scans for removable whole disks on macOS.
///
/// Only external, physical disks are listed. The disk holding `/` and any
/// disk reporting itself as internal are skipped.
pub fn get_removable_devices() -> Result<Vec<DeviceDescriptor>> {
    let system_disk = system_whole_disk();
    if system_disk.is_none() {
        warn!("could not determine the system disk");
    }

    let list = diskutil::parse_list(&run_diskutil(&["list", "-plist", "external", "physical"])?)?;

    let mut devices = Vec::new();
    for entry in &list.all_disks_and_partitions {
        let id = entry.device_identifier.as_str();
        if !list.whole_disks.iter().any(|w| w == id) {
            continue;
        }
        if system_disk.as_deref() == Some(id) {
            debug!(disk = id, "skipping system disk");
            continue;
        }

        let info: DiskInfo = match run_diskutil(&["info", "-plist", id])
            .and_then(|out| diskutil::parse_info(&out))
        {
            Ok(info) => info,
            Err(e) => {
                warn!(disk = id, "skipping disk: {e:#}");
                continue;
            }
        };
        if info.internal == Some(true) {
            debug!(disk = id, "skipping internal disk");
            continue;
        }

        let device = diskutil::descriptor(entry, &info);
        if device.size == 0 {
            continue;
        }
        devices.push(device);
    }

    Ok(devices)
}
