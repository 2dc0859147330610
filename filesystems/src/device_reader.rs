// Read-only device access with sector alignment.
// Raw devices on Windows (and O_DIRECT-ish devices elsewhere) only accept
// whole-sector reads, so every read is widened to sector boundaries here.

use log::{debug, trace};
use rawscope_core::{RawscopeError, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};

pub const SECTOR_SIZE: usize = 512;

/// Upper bound on a single read. On-disk length fields that ask for more
/// than this are treated as corrupt.
pub const MAX_READ_BYTES: usize = 64 * 1024 * 1024;

/// A device node or image file, optionally narrowed to a byte window.
///
/// The textual form `path@<offset>+<length>` addresses a partition inside a
/// disk image (or a disk whose partitions have no device node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLocation {
    pub path: String,
    pub offset: u64,
    pub length: Option<u64>,
}

impl DeviceLocation {
    pub fn parse(locator: &str) -> Result<Self> {
        if locator.is_empty() {
            return Err(RawscopeError::InvalidInput("empty device path".into()));
        }
        if let Some((path, window)) = locator.rsplit_once('@') {
            if let Some((offset, length)) = window.split_once('+') {
                if let (Ok(offset), Ok(length)) = (offset.parse::<u64>(), length.parse::<u64>()) {
                    if path.is_empty() {
                        return Err(RawscopeError::InvalidInput(format!("missing device in {}", locator)));
                    }
                    return Ok(Self {
                        path: path.to_string(),
                        offset,
                        length: Some(length),
                    });
                }
            }
        }
        Ok(Self {
            path: locator.to_string(),
            offset: 0,
            length: None,
        })
    }

    /// Locator string for a window of `device`.
    pub fn region(device: &str, offset: u64, length: u64) -> String {
        format!("{}@{}+{}", device, offset, length)
    }
}

/// Scoped read-only handle on a device or image.
///
/// The file is opened without write access and this type offers no way to
/// write; dropping it closes the descriptor. The sector cache lives only as
/// long as the handle.
pub struct DeviceReader {
    file: File,
    path: String,
    base: u64,
    len: Option<u64>,
    device_len: Option<u64>,
    sector_cache: HashMap<u64, Vec<u8>>,
    max_cache_sectors: usize,
}

impl DeviceReader {
    /// Open a device path or region locator for reading.
    pub fn open(locator: &str) -> Result<Self> {
        let location = DeviceLocation::parse(locator)?;
        debug!("Opening {} read-only", location.path);

        let file = OpenOptions::new()
            .read(true)
            .open(&location.path)
            .map_err(|e| RawscopeError::from_io(&location.path, format!("opening {}", location.path), e))?;

        Self::with_location(file, locator, &location)
    }

    fn with_location(mut file: File, locator: &str, location: &DeviceLocation) -> Result<Self> {
        let device_len = probe_length(&mut file);
        let len = match (location.length, device_len) {
            (Some(window), Some(total)) => {
                if location.offset > total {
                    return Err(RawscopeError::InvalidInput(format!(
                        "{} starts past the end of {} ({} bytes)",
                        locator, location.path, total
                    )));
                }
                Some(window.min(total - location.offset))
            }
            (Some(window), None) => Some(window),
            (None, Some(total)) => Some(total),
            (None, None) => None,
        };

        Ok(Self {
            file,
            path: locator.to_string(),
            base: location.offset,
            len,
            device_len,
            sector_cache: HashMap::new(),
            max_cache_sectors: 1024,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Size of the addressable window, when the platform can tell.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }

    /// Read exactly `size` bytes at `offset` within the window.
    ///
    /// Reads that run past the end of the window are structural errors: the
    /// on-disk pointer that produced them is out of range.
    pub fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        if size > MAX_READ_BYTES {
            return Err(RawscopeError::MalformedStructure(format!(
                "refusing {} byte read at {:#x} on {}",
                size, offset, self.path
            )));
        }
        if let Some(len) = self.len {
            let end = offset.checked_add(size as u64);
            if end.map_or(true, |end| end > len) {
                return Err(RawscopeError::MalformedStructure(format!(
                    "read of {} bytes at offset {:#x} runs past the end of {} ({} bytes)",
                    size, offset, self.path, len
                )));
            }
        }
        self.read_aligned(offset, size)
    }

    /// Like `read_at`, but bytes beyond the end of the window read as zero.
    /// Used for fixed-offset signature probes on small partitions.
    pub fn read_at_lossy(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let available = match self.len {
            Some(len) if offset >= len => 0,
            Some(len) => ((len - offset) as usize).min(size),
            None => size,
        };
        let mut data = if available > 0 {
            self.read_aligned(offset, available)?
        } else {
            Vec::new()
        };
        data.resize(size, 0);
        Ok(data)
    }

    fn read_aligned(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let absolute = self.base + offset;
        let start_sector = absolute / SECTOR_SIZE as u64;
        let end_sector = (absolute + size as u64 + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64;
        trace!(
            "Reading {} bytes at {:#x} (sectors {}..{}) from {}",
            size,
            offset,
            start_sector,
            end_sector,
            self.path
        );

        let mut data = Vec::with_capacity(((end_sector - start_sector) as usize) * SECTOR_SIZE);
        let mut sector = start_sector;
        while sector < end_sector {
            if let Some(cached) = self.sector_cache.get(&sector) {
                data.extend_from_slice(cached);
                sector += 1;
                continue;
            }
            // Batch the uncached run into one read.
            let mut run = 1;
            while sector + run < end_sector && !self.sector_cache.contains_key(&(sector + run)) {
                run += 1;
            }
            let chunk = self.read_sectors(sector, run as usize)?;
            if run == 1 && self.sector_cache.len() < self.max_cache_sectors {
                self.sector_cache.insert(sector, chunk.clone());
            }
            data.extend_from_slice(&chunk);
            sector += run;
        }

        let skip = (absolute % SECTOR_SIZE as u64) as usize;
        Ok(data[skip..skip + size].to_vec())
    }

    /// Read whole sectors from the underlying file. A short tail at the very
    /// end of an image is zero-filled.
    fn read_sectors(&mut self, start_sector: u64, count: usize) -> Result<Vec<u8>> {
        let offset = start_sector * SECTOR_SIZE as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| RawscopeError::from_io(&self.path, format!("seeking to {:#x}", offset), e))?;

        let mut buffer = vec![0u8; count * SECTOR_SIZE];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RawscopeError::from_io(
                        &self.path,
                        format!("reading {} sectors at {:#x}", count, offset),
                        e,
                    ))
                }
            }
        }

        if filled < buffer.len() {
            let past_end = self.device_len.map_or(true, |len| offset + filled as u64 >= len);
            if !past_end {
                return Err(RawscopeError::from_io(
                    &self.path,
                    format!("short read at {:#x}", offset),
                    ErrorKind::UnexpectedEof.into(),
                ));
            }
        }
        Ok(buffer)
    }
}

/// Byte length of an image file or block device, if it can be found without
/// privileged ioctls. Block devices report their size through SEEK_END.
fn probe_length(file: &mut File) -> Option<u64> {
    if let Ok(meta) = file.metadata() {
        if meta.is_file() {
            return Some(meta.len());
        }
    }
    let end = file.seek(SeekFrom::End(0)).ok()?;
    let _ = file.seek(SeekFrom::Start(0));
    if end == 0 {
        None
    } else {
        Some(end)
    }
}
