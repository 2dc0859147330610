// Filesystem detection trait and utilities

use crate::device_reader::DeviceReader;
use crate::families::{btrfs, ext, fat, ntfs, xfs};
use log::debug;
use rawscope_core::{FsTag, Result};
use serde::{Deserialize, Serialize};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT_SUPERBLOCK_SIZE: usize = 1024;
pub const BTRFS_WINDOW_OFFSET: u64 = 0x10000;
pub const BTRFS_WINDOW_SIZE: usize = 512;

/// The fixed byte ranges every detector works from. Reading these is the
/// whole I/O cost of detection: 2 KiB.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    /// Bytes 0..512
    pub boot_sector: Vec<u8>,
    /// Bytes 1024..2048
    pub ext_superblock: Vec<u8>,
    /// Bytes 0x10000..0x10200
    pub btrfs_window: Vec<u8>,
}

impl ProbeSample {
    /// Ranges past the end of a small partition read as zeros.
    pub fn read(device: &mut DeviceReader) -> Result<Self> {
        Ok(Self {
            boot_sector: device.read_at_lossy(0, BOOT_SECTOR_SIZE)?,
            ext_superblock: device.read_at_lossy(EXT_SUPERBLOCK_OFFSET, EXT_SUPERBLOCK_SIZE)?,
            btrfs_window: device.read_at_lossy(BTRFS_WINDOW_OFFSET, BTRFS_WINDOW_SIZE)?,
        })
    }
}

/// Trait for filesystem-specific detection logic
pub trait FilesystemDetector {
    /// `Some(tag)` if the sample carries this format's signature.
    fn detect(sample: &ProbeSample) -> Option<FsTag>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Detection {
    Recognized(FsTag),
    /// No magic matched, but a known layout is still visible.
    Damaged { fs_type: FsTag, reason: String },
    NotRecognized,
}

/// Every signature that matches, in precedence order:
/// ext, NTFS, exFAT, FAT, Btrfs, XFS.
pub fn candidates(sample: &ProbeSample) -> Vec<FsTag> {
    let detectors: [fn(&ProbeSample) -> Option<FsTag>; 6] = [
        ext::ExtDetector::detect,
        ntfs::NtfsDetector::detect,
        fat::exfat::ExFatDetector::detect,
        fat::FatDetector::detect,
        btrfs::BtrfsDetector::detect,
        xfs::XfsDetector::detect,
    ];
    detectors.iter().filter_map(|detect| detect(sample)).collect()
}

/// Classify a sample. First match wins.
pub fn classify(sample: &ProbeSample) -> Detection {
    let matches = candidates(sample);
    if matches.len() > 1 {
        debug!("Ambiguous signatures {:?}; taking {}", matches, matches[0]);
    }
    if let Some(&tag) = matches.first() {
        return Detection::Recognized(tag);
    }
    if let Some((fs_type, reason)) = ext::detect_damaged(sample) {
        return Detection::Damaged { fs_type, reason };
    }
    Detection::NotRecognized
}

/// Detect filesystem type from the fixed probe ranges.
pub fn detect_filesystem(device: &mut DeviceReader) -> Result<Detection> {
    let sample = ProbeSample::read(device)?;
    let detection = classify(&sample);
    debug!("{}: {:?}", device.path(), detection);
    Ok(detection)
}
