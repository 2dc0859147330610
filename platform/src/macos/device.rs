use log::{debug, info};
use rawscope_core::{BlockDevice, DeviceManager, DeviceType, MountTable, Partition, RawscopeError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Enumerates disks by parsing the text output of `diskutil list`.
pub struct MacOSDeviceManager;

impl DeviceManager for MacOSDeviceManager {
    fn enumerate_devices(&self) -> Result<Vec<BlockDevice>> {
        let text = run("diskutil", &["list"])?;
        let devices = parse_diskutil_list(&text);
        info!("Found {} disks via diskutil", devices.len());
        Ok(devices)
    }

    fn partition_node(&self, device_path: &str, number: u32) -> Option<String> {
        if !device_path.starts_with("/dev/disk") || number == 0 {
            return None;
        }
        let node = format!("{}s{}", device_path, number);
        Path::new(&node).exists().then_some(node)
    }
}

/// Mount lookup backed by the output of `mount`, re-run on every query.
pub struct MacOSMountTable;

impl MountTable for MacOSMountTable {
    fn mount_point(&self, partition_path: &str) -> Result<Option<PathBuf>> {
        let text = run("mount", &[])?;
        Ok(find_mount(&text, partition_path))
    }
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| RawscopeError::from_io(program, format!("running {}", program), e))?;
    if !output.status.success() {
        return Err(RawscopeError::Io {
            context: format!("running {}", program),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `diskutil list`:
///
/// ```text
/// /dev/disk2 (external, physical):
///    #:                       TYPE NAME                    SIZE       IDENTIFIER
///    0:     FDisk_partition_scheme                        *16.0 GB    disk2
///    1:             DOS_FAT_32 UNTITLED                16.0 GB    disk2s1
/// ```
///
/// Synthesized APFS containers are skipped; they mirror a physical slice.
pub fn parse_diskutil_list(text: &str) -> Vec<BlockDevice> {
    let mut devices: Vec<BlockDevice> = Vec::new();
    let mut skipping = false;

    for line in text.lines() {
        if line.starts_with("/dev/") {
            let (path, kind) = match line.split_once(' ') {
                Some((path, kind)) => (path, kind),
                None => (line.trim_end_matches(':'), ""),
            };
            skipping = kind.contains("synthesized");
            if skipping {
                debug!("Skipping synthesized disk {}", path);
                continue;
            }
            let removable = kind.contains("external");
            let device_type = if kind.contains("disk image") {
                DeviceType::Virtual
            } else if removable {
                DeviceType::USB
            } else {
                DeviceType::Unknown
            };
            let name = path.trim_start_matches("/dev/").to_string();
            devices.push(BlockDevice {
                name,
                path: path.to_string(),
                size_bytes: 0,
                device_type,
                removable,
                partitions: Vec::new(),
            });
            continue;
        }
        if skipping {
            continue;
        }
        let device = match devices.last_mut() {
            Some(device) => device,
            None => continue,
        };
        let row = match parse_row(line) {
            Some(row) => row,
            None => continue,
        };
        if row.index == 0 {
            device.size_bytes = row.size_bytes;
            continue;
        }
        device.partitions.push(Partition {
            name: if row.name.is_empty() { row.identifier.clone() } else { row.name },
            path: format!("/dev/{}", row.identifier),
            number: row.index,
            start_bytes: 0,
            size_bytes: row.size_bytes,
            fs_type: None,
            type_label: row.type_label,
        });
    }
    devices
}

struct Row {
    index: u32,
    type_label: String,
    name: String,
    size_bytes: u64,
    identifier: String,
}

fn parse_row(line: &str) -> Option<Row> {
    let (index, rest) = line.trim_start().split_once(':')?;
    let index = index.parse::<u32>().ok()?;

    let rest = rest.trim();
    let (rest, identifier) = rest.rsplit_once(char::is_whitespace)?;
    let (rest, unit) = rest.trim_end().rsplit_once(char::is_whitespace)?;
    let (rest, value) = rest.trim_end().rsplit_once(char::is_whitespace)?;
    let size_bytes = parse_size(value.trim_start_matches(['*', '+']), unit)?;

    // First token is TYPE, the rest is NAME.
    let rest = rest.trim();
    let (type_label, name) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Some(Row {
        index,
        type_label: type_label.to_string(),
        name: name.trim().to_string(),
        size_bytes,
        identifier: identifier.to_string(),
    })
}

fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let number = value.parse::<f64>().ok()?;
    let multiplier: u64 = match unit {
        "B" | "Bytes" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => return None,
    };
    Some((number * multiplier as f64).round() as u64)
}

/// `mount` prints `/dev/disk2s1 on /Volumes/NAME (msdos, local, nodev)`.
pub fn find_mount(text: &str, partition_path: &str) -> Option<PathBuf> {
    text.lines().find_map(|line| {
        let (source, rest) = line.split_once(" on ")?;
        if source != partition_path {
            return None;
        }
        let mount_point = rest.rsplit_once(" (").map(|(mp, _)| mp).unwrap_or(rest);
        Some(PathBuf::from(mount_point))
    })
}
