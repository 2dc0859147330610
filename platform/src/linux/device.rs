use log::{debug, info};
use rawscope_core::{BlockDevice, DeviceManager, DeviceType, Partition, RawscopeError, Result};
use std::fs;
use std::path::{Path, PathBuf};

const SYSFS_SECTOR: u64 = 512;

/// Enumerates disks from `/sys/block` without touching the devices themselves.
pub struct LinuxDeviceManager {
    sys_block: PathBuf,
    dev_dir: PathBuf,
}

impl Default for LinuxDeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxDeviceManager {
    pub fn new() -> Self {
        Self::with_roots("/sys/block", "/dev")
    }

    /// Point the manager at another sysfs tree and device directory.
    pub fn with_roots(sys_block: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_dir: dev_dir.into(),
        }
    }

    fn is_skipped(&self, name: &str) -> bool {
        if name.starts_with("ram") || name.starts_with("zram") || name.starts_with("dm-") {
            return true;
        }
        // Unattached loop devices have no backing file and read as empty.
        if name.starts_with("loop") {
            return !self.sys_block.join(name).join("loop").join("backing_file").exists();
        }
        false
    }

    fn is_removable(dir: &Path) -> bool {
        read_trimmed(&dir.join("removable")).map(|v| v == "1").unwrap_or(false)
    }

    fn get_device_type(name: &str, dir: &Path) -> DeviceType {
        if name.starts_with("nvme") {
            return DeviceType::NVMe;
        }
        if name.starts_with("mmcblk") {
            return DeviceType::SDCard;
        }
        if name.starts_with("loop") {
            return DeviceType::Virtual;
        }
        if name.starts_with("sr") {
            return DeviceType::OpticalDrive;
        }
        if Self::is_removable(dir) {
            return DeviceType::USB;
        }

        match read_trimmed(&dir.join("queue").join("rotational")).as_deref() {
            Some("1") => DeviceType::HardDisk,
            Some("0") => DeviceType::SSD,
            _ => DeviceType::Unknown,
        }
    }

    fn get_device_model(name: &str, dir: &Path) -> String {
        let model = read_trimmed(&dir.join("device").join("model")).filter(|m| !m.is_empty());
        let vendor = read_trimmed(&dir.join("device").join("vendor")).filter(|v| !v.is_empty());
        match (vendor, model) {
            (Some(vendor), Some(model)) => format!("{} {} ({})", vendor, model, name),
            (None, Some(model)) => format!("{} ({})", model, name),
            _ => name.to_string(),
        }
    }

    fn get_partitions(&self, name: &str, dir: &Path) -> Vec<Partition> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut partitions = Vec::new();
        for entry in entries.flatten() {
            let part_dir = entry.path();
            let number = match read_trimmed(&part_dir.join("partition")).and_then(|n| n.parse::<u32>().ok()) {
                Some(number) => number,
                None => continue,
            };
            let part_name = entry.file_name().to_string_lossy().into_owned();
            let start = read_sectors(&part_dir.join("start")).unwrap_or(0);
            let size = match read_sectors(&part_dir.join("size")) {
                Some(size) => size,
                None => {
                    debug!("Partition {} of {} vanished during enumeration", part_name, name);
                    continue;
                }
            };
            partitions.push(Partition {
                path: self.dev_dir.join(&part_name).to_string_lossy().into_owned(),
                name: part_name,
                number,
                start_bytes: start * SYSFS_SECTOR,
                size_bytes: size * SYSFS_SECTOR,
                fs_type: None,
                type_label: String::new(),
            });
        }
        partitions.sort_by_key(|p| p.number);
        partitions
    }
}

impl DeviceManager for LinuxDeviceManager {
    fn enumerate_devices(&self) -> Result<Vec<BlockDevice>> {
        let entries = fs::read_dir(&self.sys_block).map_err(|e| {
            RawscopeError::from_io(
                &self.sys_block.to_string_lossy(),
                format!("reading {}", self.sys_block.display()),
                e,
            )
        })?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.is_skipped(&name) {
                continue;
            }
            let dir = self.sys_block.join(&name);

            let size_bytes = match read_sectors(&dir.join("size")) {
                Some(0) => continue,
                Some(sectors) => sectors * SYSFS_SECTOR,
                None => {
                    debug!("Device {} vanished during enumeration", name);
                    continue;
                }
            };

            devices.push(BlockDevice {
                name: Self::get_device_model(&name, &dir),
                path: self.dev_dir.join(&name).to_string_lossy().into_owned(),
                size_bytes,
                device_type: Self::get_device_type(&name, &dir),
                removable: Self::is_removable(&dir),
                partitions: self.get_partitions(&name, &dir),
            });
        }

        // Removable media first, then by device path
        devices.sort_by(|a, b| b.removable.cmp(&a.removable).then_with(|| a.path.cmp(&b.path)));
        info!("Found {} block devices under {}", devices.len(), self.sys_block.display());
        Ok(devices)
    }

    fn partition_node(&self, device_path: &str, number: u32) -> Option<String> {
        let node = partition_node_name(device_path, number)?;
        Path::new(&node).exists().then_some(node)
    }
}

/// `/dev/sda` + 1 is `/dev/sda1`; names ending in a digit take a `p`
/// separator (`/dev/nvme0n1p1`, `/dev/mmcblk0p1`, `/dev/loop0p1`).
pub fn partition_node_name(device_path: &str, number: u32) -> Option<String> {
    if !device_path.starts_with("/dev/") || number == 0 {
        return None;
    }
    let separator = if device_path.ends_with(|c: char| c.is_ascii_digit()) { "p" } else { "" };
    Some(format!("{}{}{}", device_path, separator, number))
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_sectors(path: &Path) -> Option<u64> {
    read_trimmed(path).and_then(|s| s.parse::<u64>().ok())
}
