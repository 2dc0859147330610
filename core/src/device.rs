use crate::filesystem::FsTag;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One physical disk as seen at enumeration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub device_type: DeviceType,
    pub removable: bool,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
    SSD,
    USB,
    SDCard,
    NVMe,
    OpticalDrive,
    Virtual,
    Unknown,
}

/// A contiguous region of a `BlockDevice`.
///
/// `fs_type` comes from the partition table and is only a hint; signature
/// detection decides what actually lives there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub path: String,
    pub number: u32,
    pub start_bytes: u64,
    pub size_bytes: u64,
    pub fs_type: Option<FsTag>,
    pub type_label: String,
}

/// Platform hook for enumerating disks and naming their partition nodes.
pub trait DeviceManager: Send + Sync {
    fn enumerate_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Host device node for partition `number` of `device_path`, if the OS
    /// exposes one.
    fn partition_node(&self, device_path: &str, number: u32) -> Option<String>;
}

/// Lookup of host-level mounts, recomputed on every call.
pub trait MountTable: Send + Sync {
    fn mount_point(&self, partition_path: &str) -> Result<Option<PathBuf>>;
}
