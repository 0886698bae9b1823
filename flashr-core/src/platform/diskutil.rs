//! Parsing of `diskutil list -plist` and `diskutil info -plist` output.
//!
//! Kept free of process spawning so it can be tested on any host.
use crate::device::{DeviceDescriptor, PartitionDescriptor};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// `diskutil list -plist`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiskList {
    #[serde(default)]
    pub all_disks_and_partitions: Vec<DiskEntry>,
    #[serde(default)]
    pub whole_disks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiskEntry {
    pub device_identifier: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub volume_name: Option<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartitionEntry {
    pub device_identifier: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub volume_name: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
}

/// The subset of `diskutil info -plist <disk>` used to describe a device.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiskInfo {
    pub device_node: Option<String>,
    pub parent_whole_disk: Option<String>,
    pub total_size: Option<u64>,
    pub size: Option<u64>,
    pub removable: Option<bool>,
    pub removable_media: Option<bool>,
    pub ejectable: Option<bool>,
    pub writable_media: Option<bool>,
    pub internal: Option<bool>,
    pub media_name: Option<String>,
    pub bus_protocol: Option<String>,
    pub mount_point: Option<String>,
    #[serde(rename = "MediaUUID")]
    pub media_uuid: Option<String>,
    #[serde(rename = "DiskUUID")]
    pub disk_uuid: Option<String>,
}

pub fn parse_list(bytes: &[u8]) -> Result<DiskList> {
    plist::from_bytes(bytes).context("parse diskutil list output")
}

pub fn parse_info(bytes: &[u8]) -> Result<DiskInfo> {
    plist::from_bytes(bytes).context("parse diskutil info output")
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn dev_node(identifier: &str) -> PathBuf {
    PathBuf::from("/dev").join(identifier)
}

/// Combines a whole-disk entry from the list with its `info` output.
pub fn descriptor(entry: &DiskEntry, info: &DiskInfo) -> DeviceDescriptor {
    let path = non_empty(&info.device_node)
        .map(PathBuf::from)
        .unwrap_or_else(|| dev_node(&entry.device_identifier));
    let size = info.total_size.or(info.size).unwrap_or(entry.size);

    let media_name = non_empty(&info.media_name);
    let vendor = media_name
        .as_deref()
        .and_then(|name| name.split_whitespace().next())
        .map(str::to_owned);

    let partitions = entry
        .partitions
        .iter()
        .map(|p| PartitionDescriptor {
            path: dev_node(&p.device_identifier),
            size: p.size,
            volume_name: non_empty(&p.volume_name),
            mount_point: non_empty(&p.mount_point).map(PathBuf::from),
        })
        .collect();

    DeviceDescriptor {
        path,
        size,
        removable: info.removable.unwrap_or(false)
            || info.removable_media.unwrap_or(false)
            || !info.internal.unwrap_or(true),
        read_only: !info.writable_media.unwrap_or(true),
        ejectable: info.ejectable.unwrap_or(false),
        vendor,
        revision: None,
        media_name,
        protocol: non_empty(&info.bus_protocol),
        partitions,
        persistent_id: non_empty(&info.media_uuid).or_else(|| non_empty(&info.disk_uuid)),
        mount_point: non_empty(&info.mount_point)
            .or_else(|| non_empty(&entry.mount_point))
            .map(PathBuf::from),
    }
}

/// `disk3s1s1` → `disk3`.
pub fn whole_disk_of(identifier: &str) -> Option<String> {
    let name = identifier.rsplit('/').next()?;
    let number: String = name
        .strip_prefix("disk")?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if number.is_empty() {
        return None;
    }
    Some(format!("disk{number}"))
}
