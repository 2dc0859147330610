// RawBridge: the library entry point. Each call re-reads the device and the
// host mount table; nothing is cached between calls.

use log::{debug, warn};
use rawscope_core::{
    child_path, plan, split_relative_path, AccessPlan, BlockDevice, DeviceManager, DirectoryEntry,
    FilesystemInfo, ListOptions, Listing, MountObservation, MountTable, Partition, Platform, RawscopeError, Result,
};
use rawscope_filesystems::{self as raw, DeviceLocation, DeviceReader};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

pub struct RawBridge<D: DeviceManager, M: MountTable> {
    devices: D,
    mounts: M,
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
impl RawBridge<crate::PlatformDeviceManager, crate::PlatformMountTable> {
    /// Bridge wired to this host's device enumerator and mount table.
    pub fn native() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::new(crate::linux::LinuxDeviceManager::new(), crate::linux::LinuxMountTable::new())
        }
        #[cfg(target_os = "macos")]
        {
            Self::new(crate::macos::MacOSDeviceManager, crate::macos::MacOSMountTable)
        }
        #[cfg(target_os = "windows")]
        {
            Self::new(crate::windows::WindowsDeviceManager, crate::windows::WindowsMountTable)
        }
    }
}

impl<D: DeviceManager, M: MountTable> RawBridge<D, M> {
    pub fn new(devices: D, mounts: M) -> Self {
        Self { devices, mounts }
    }

    pub fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        self.devices.enumerate_devices()
    }

    /// Read the MBR or GPT of `device_path`.
    ///
    /// Each partition is addressed by its host node when the OS exposes one,
    /// otherwise by a byte window of the device (`path@offset+length`).
    pub fn list_partitions(&self, device_path: &str) -> Result<Vec<Partition>> {
        let table = {
            let mut device = DeviceReader::open(device_path)?;
            raw::read_partition_table(&mut device)?
        };
        debug!("{}: {:?} table with {} entries", device_path, table.style, table.entries.len());

        Ok(table
            .entries
            .into_iter()
            .map(|entry| {
                let path = self
                    .devices
                    .partition_node(device_path, entry.number)
                    .unwrap_or_else(|| DeviceLocation::region(device_path, entry.start_bytes, entry.size_bytes));
                let name = if entry.name.is_empty() {
                    format!("Partition {}", entry.number)
                } else {
                    entry.name
                };
                Partition {
                    name,
                    path,
                    number: entry.number,
                    start_bytes: entry.start_bytes,
                    size_bytes: entry.size_bytes,
                    fs_type: entry.fs_hint,
                    type_label: entry.type_label,
                }
            })
            .collect())
    }

    pub fn detect_and_parse(&self, partition_path: &str) -> Result<FilesystemInfo> {
        raw::detect_and_parse(partition_path)
    }

    /// Decide how `partition_path` can be browsed right now. Never fails;
    /// probe and mount-table errors end up in the plan's message.
    pub fn get_access_plan(&self, partition_path: &str) -> AccessPlan {
        let probe = raw::probe(partition_path);
        let mount = self.observe_mount(partition_path);
        plan(partition_path, &probe, mount.as_ref(), Platform::current())
    }

    /// List a directory, through the host mount when it is readable and
    /// from raw sectors otherwise.
    pub fn list_entries(&self, partition_path: &str, relative_path: &str, options: &ListOptions) -> Result<Listing> {
        match self.readable_mount(partition_path) {
            Some(root) => list_mounted(&root, relative_path, options),
            None => raw::list_entries(partition_path, relative_path, options),
        }
    }

    /// Read at most `limit` bytes from the start of a file.
    pub fn read_preview(&self, partition_path: &str, relative_path: &str, limit: usize) -> Result<Vec<u8>> {
        match self.readable_mount(partition_path) {
            Some(root) => preview_mounted(&root, relative_path, limit),
            None => raw::read_preview(partition_path, relative_path, limit),
        }
    }

    fn observe_mount(&self, partition_path: &str) -> Option<MountObservation> {
        match self.mounts.mount_point(partition_path) {
            Ok(Some(mount_point)) => {
                let readable = match fs::read_dir(&mount_point) {
                    Ok(_) => true,
                    Err(e) => {
                        debug!("{} is mounted at {} but unreadable: {}", partition_path, mount_point.display(), e);
                        false
                    }
                };
                Some(MountObservation { mount_point, readable })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Mount table lookup for {} failed: {}", partition_path, e);
                None
            }
        }
    }

    fn readable_mount(&self, partition_path: &str) -> Option<PathBuf> {
        self.observe_mount(partition_path)
            .filter(|m| m.readable)
            .map(|m| m.mount_point)
    }
}

fn mounted_path(root: &Path, components: &[&str]) -> PathBuf {
    components.iter().fold(root.to_path_buf(), |path, c| path.join(c))
}

fn mount_error(relative_path: &str, full: &Path, e: std::io::Error) -> RawscopeError {
    if e.kind() == ErrorKind::NotFound {
        return RawscopeError::PathNotFound(relative_path.to_string());
    }
    RawscopeError::from_io(&full.to_string_lossy(), format!("reading {}", full.display()), e)
}

/// Directory listing over a host mount, sorted by name so paging is stable.
fn list_mounted(root: &Path, relative_path: &str, options: &ListOptions) -> Result<Listing> {
    options.validate()?;
    let components = split_relative_path(relative_path)?;
    let dir = mounted_path(root, &components);

    let metadata = fs::metadata(&dir).map_err(|e| mount_error(relative_path, &dir, e))?;
    if !metadata.is_dir() {
        return Err(RawscopeError::NotADirectory(relative_path.to_string()));
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| mount_error(relative_path, &dir, e))? {
        let entry = entry.map_err(|e| mount_error(relative_path, &dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Follow symlinks for the kind; a dangling link shows as a zero-size file.
        let (is_dir, size) = match fs::metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => (true, 0),
            Ok(meta) => (false, meta.len()),
            Err(_) => (false, 0),
        };
        entries.push(DirectoryEntry {
            path: child_path(&components, &name),
            name,
            is_dir,
            size,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let total = entries.len();
    let end = options.end().min(total);
    let page: Vec<DirectoryEntry> = entries
        .into_iter()
        .skip(options.offset)
        .take(options.limit)
        .collect();
    Ok(Listing {
        entries: page,
        next_offset: (end < total).then_some(end),
    })
}

fn preview_mounted(root: &Path, relative_path: &str, limit: usize) -> Result<Vec<u8>> {
    let components = split_relative_path(relative_path)?;
    if components.is_empty() {
        return Err(RawscopeError::NotAFile(relative_path.to_string()));
    }
    let file_path = mounted_path(root, &components);

    let metadata = fs::metadata(&file_path).map_err(|e| mount_error(relative_path, &file_path, e))?;
    if !metadata.is_file() {
        return Err(RawscopeError::NotAFile(relative_path.to_string()));
    }

    let file = fs::File::open(&file_path).map_err(|e| mount_error(relative_path, &file_path, e))?;
    let mut data = Vec::with_capacity(metadata.len().min(limit as u64) as usize);
    file.take(limit as u64)
        .read_to_end(&mut data)
        .map_err(|e| mount_error(relative_path, &file_path, e))?;
    Ok(data)
}
