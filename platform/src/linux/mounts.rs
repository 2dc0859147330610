use log::debug;
use rawscope_core::{MountTable, RawscopeError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Mount lookup backed by `/proc/self/mounts`, re-read on every query.
pub struct LinuxMountTable {
    source: PathBuf,
}

impl Default for LinuxMountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxMountTable {
    pub fn new() -> Self {
        Self::from_file("/proc/self/mounts")
    }

    pub fn from_file(source: impl Into<PathBuf>) -> Self {
        Self { source: source.into() }
    }
}

impl MountTable for LinuxMountTable {
    fn mount_point(&self, partition_path: &str) -> Result<Option<PathBuf>> {
        let text = fs::read_to_string(&self.source).map_err(|e| {
            RawscopeError::from_io(
                &self.source.to_string_lossy(),
                format!("reading {}", self.source.display()),
                e,
            )
        })?;
        Ok(find_mount(&parse_mounts(&text), partition_path))
    }
}

/// One line of a `mounts` file: source device and mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
}

/// Parse the `/proc/mounts` format. Fields are space separated and
/// spaces, tabs, newlines and backslashes inside them are octal-escaped.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                source: unescape_octal(source),
                mount_point: PathBuf::from(unescape_octal(mount_point)),
            })
        })
        .collect()
}

/// First mount whose source is `partition_path`, comparing through symlinks
/// such as `/dev/disk/by-uuid/...`.
pub fn find_mount(entries: &[MountEntry], partition_path: &str) -> Option<PathBuf> {
    let wanted = canonical(partition_path);
    let found = entries
        .iter()
        .find(|entry| {
            entry.source == partition_path
                || (entry.source.starts_with('/') && canonical(&entry.source) == wanted)
        })
        .map(|entry| entry.mount_point.clone());
    if let Some(mount_point) = &found {
        debug!("{} is mounted at {}", partition_path, mount_point.display());
    }
    found
}

fn canonical(path: &str) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| Path::new(path).to_path_buf())
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
