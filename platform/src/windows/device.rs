use log::{debug, info};
use rawscope_core::{BlockDevice, DeviceManager, DeviceType, MountTable, Partition, RawscopeError, Result};
use rawscope_filesystems::DeviceLocation;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::process::Command;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

#[derive(Debug, Deserialize)]
struct WindowsDisk {
    #[serde(rename = "Number")]
    number: u32,
    #[serde(rename = "FriendlyName")]
    friendly_name: Option<String>,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "BusType")]
    bus_type: Option<String>,
    #[serde(rename = "MediaType")]
    media_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WindowsPartition {
    #[serde(rename = "DiskNumber")]
    disk_number: u32,
    #[serde(rename = "PartitionNumber")]
    partition_number: u32,
    #[serde(rename = "DriveLetter")]
    drive_letter: Option<String>,
    #[serde(rename = "Offset")]
    offset: u64,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "Type")]
    partition_type: Option<String>,
}

impl WindowsPartition {
    fn drive_root(&self) -> Option<PathBuf> {
        let letter = self.drive_letter.as_deref()?.chars().next()?;
        letter
            .is_ascii_alphabetic()
            .then(|| PathBuf::from(format!("{}:\\", letter.to_ascii_uppercase())))
    }
}

const DISKS_QUERY: &str =
    "Get-Disk | Select-Object Number, FriendlyName, Size, BusType, MediaType | ConvertTo-Json";
const PARTITIONS_QUERY: &str =
    "Get-Partition | Select-Object DiskNumber, PartitionNumber, DriveLetter, Offset, Size, Type | ConvertTo-Json";

/// Enumerates disks through PowerShell's storage cmdlets.
pub struct WindowsDeviceManager;

impl WindowsDeviceManager {
    fn get_device_type(bus_type: Option<&str>, media_type: Option<&str>) -> DeviceType {
        if let Some(bus) = bus_type {
            match bus.to_uppercase().as_str() {
                "USB" => return DeviceType::USB,
                "SD" | "MMC" => return DeviceType::SDCard,
                "NVME" => return DeviceType::NVMe,
                "FILE BACKED VIRTUAL" | "VIRTUAL" => return DeviceType::Virtual,
                _ => {}
            }
        }

        match media_type.map(|m| m.to_uppercase()).as_deref() {
            Some("SSD") => DeviceType::SSD,
            Some("HDD") => DeviceType::HardDisk,
            _ => DeviceType::Unknown,
        }
    }

    fn is_removable(bus_type: Option<&str>) -> bool {
        bus_type
            .map(|bus| matches!(bus.to_uppercase().as_str(), "USB" | "SD" | "MMC"))
            .unwrap_or(false)
    }
}

impl DeviceManager for WindowsDeviceManager {
    fn enumerate_devices(&self) -> Result<Vec<BlockDevice>> {
        let disks: Vec<WindowsDisk> = parse_json_list(&powershell(DISKS_QUERY)?)?;
        // Partition details are best effort; a disk list without them is still useful.
        let partitions: Vec<WindowsPartition> = match powershell(PARTITIONS_QUERY).and_then(|json| parse_json_list(&json)) {
            Ok(partitions) => partitions,
            Err(e) => {
                debug!("Partition query failed: {}", e);
                Vec::new()
            }
        };

        let mut devices: Vec<BlockDevice> = disks
            .into_iter()
            .map(|disk| {
                let path = physical_drive_path(disk.number);
                let partitions = partitions
                    .iter()
                    .filter(|p| p.disk_number == disk.number)
                    .map(|p| Partition {
                        name: format!("Partition {}", p.partition_number),
                        path: globalroot_path(disk.number, p.partition_number),
                        number: p.partition_number,
                        start_bytes: p.offset,
                        size_bytes: p.size,
                        fs_type: None,
                        type_label: p.partition_type.clone().unwrap_or_default(),
                    })
                    .collect();
                BlockDevice {
                    name: disk.friendly_name.clone().unwrap_or_else(|| format!("Disk {}", disk.number)),
                    path,
                    size_bytes: disk.size,
                    device_type: Self::get_device_type(disk.bus_type.as_deref(), disk.media_type.as_deref()),
                    removable: Self::is_removable(disk.bus_type.as_deref()),
                    partitions,
                }
            })
            .collect();

        // Removable media first, then by disk path
        devices.sort_by(|a, b| b.removable.cmp(&a.removable).then_with(|| a.path.cmp(&b.path)));
        info!("Found {} disks via Get-Disk", devices.len());
        Ok(devices)
    }

    /// Windows numbers partitions its own way (logical MBR partitions are
    /// not 5, 6, ...), so partitions read from the table are addressed as
    /// byte windows of the physical drive instead.
    fn partition_node(&self, _device_path: &str, _number: u32) -> Option<String> {
        None
    }
}

/// Drive-letter lookup. Accepts both `GLOBALROOT` partition paths and
/// `\\.\PhysicalDriveN@offset+length` windows.
pub struct WindowsMountTable;

impl MountTable for WindowsMountTable {
    fn mount_point(&self, partition_path: &str) -> Result<Option<PathBuf>> {
        let wanted = match PartitionKey::parse(partition_path) {
            Some(key) => key,
            None => return Ok(None),
        };
        let partitions: Vec<WindowsPartition> = parse_json_list(&powershell(PARTITIONS_QUERY)?)?;
        Ok(partitions
            .iter()
            .find(|p| wanted.matches(p))
            .and_then(WindowsPartition::drive_root))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PartitionKey {
    Numbered { disk: u32, partition: u32 },
    Offset { disk: u32, offset: u64 },
}

impl PartitionKey {
    fn parse(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix(r"\\?\globalroot\device\harddisk") {
            let (disk, partition) = rest.split_once(r"\partition")?;
            return Some(PartitionKey::Numbered {
                disk: disk.parse().ok()?,
                partition: partition.parse().ok()?,
            });
        }
        let location = DeviceLocation::parse(path).ok()?;
        location.length?;
        let disk = location.path.to_ascii_lowercase().strip_prefix(r"\\.\physicaldrive")?.parse().ok()?;
        Some(PartitionKey::Offset {
            disk,
            offset: location.offset,
        })
    }

    fn matches(&self, partition: &WindowsPartition) -> bool {
        match *self {
            PartitionKey::Numbered { disk, partition: number } => {
                partition.disk_number == disk && partition.partition_number == number
            }
            PartitionKey::Offset { disk, offset } => partition.disk_number == disk && partition.offset == offset,
        }
    }
}

fn physical_drive_path(number: u32) -> String {
    format!(r"\\.\PhysicalDrive{}", number)
}

fn globalroot_path(disk: u32, partition: u32) -> String {
    format!(r"\\?\GLOBALROOT\Device\Harddisk{}\Partition{}", disk, partition)
}

fn powershell(script: &str) -> Result<String> {
    let mut cmd = Command::new("powershell.exe");

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let output = cmd
        .args(["-NoProfile", "-Command", script])
        .output()
        .map_err(|e| RawscopeError::from_io("powershell.exe", "running PowerShell", e))?;
    if !output.status.success() {
        return Err(RawscopeError::Io {
            context: "running PowerShell".into(),
            source: io::Error::new(
                io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `ConvertTo-Json` emits a bare object for one result, an array for
/// several and nothing at all for none.
fn parse_json_list<T: DeserializeOwned>(json: &str) -> Result<Vec<T>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let parsed = if json.starts_with('[') {
        serde_json::from_str(json)
    } else {
        serde_json::from_str(json).map(|item| vec![item])
    };
    parsed.map_err(|e| RawscopeError::InvalidInput(format!("unexpected PowerShell output: {}", e)))
}
