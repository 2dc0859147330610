use crate::{RawscopeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Filesystem formats this crate can recognize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FsTag {
    #[serde(rename = "ext2")]
    Ext2,
    #[serde(rename = "ext3")]
    Ext3,
    #[serde(rename = "ext4")]
    Ext4,
    #[serde(rename = "NTFS")]
    Ntfs,
    #[serde(rename = "FAT12")]
    Fat12,
    #[serde(rename = "FAT16")]
    Fat16,
    #[serde(rename = "FAT32")]
    Fat32,
    #[serde(rename = "exFAT")]
    ExFat,
    #[serde(rename = "Btrfs")]
    Btrfs,
    #[serde(rename = "XFS")]
    Xfs,
}

impl FsTag {
    pub const ALL: [FsTag; 10] = [
        FsTag::Ext2,
        FsTag::Ext3,
        FsTag::Ext4,
        FsTag::Ntfs,
        FsTag::Fat12,
        FsTag::Fat16,
        FsTag::Fat32,
        FsTag::ExFat,
        FsTag::Btrfs,
        FsTag::Xfs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FsTag::Ext2 => "ext2",
            FsTag::Ext3 => "ext3",
            FsTag::Ext4 => "ext4",
            FsTag::Ntfs => "NTFS",
            FsTag::Fat12 => "FAT12",
            FsTag::Fat16 => "FAT16",
            FsTag::Fat32 => "FAT32",
            FsTag::ExFat => "exFAT",
            FsTag::Btrfs => "Btrfs",
            FsTag::Xfs => "XFS",
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FsTag::Ext2 | FsTag::Ext3 | FsTag::Ext4)
    }

    pub fn is_fat(&self) -> bool {
        matches!(self, FsTag::Fat12 | FsTag::Fat16 | FsTag::Fat32)
    }
}

impl fmt::Display for FsTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsTag {
    type Err = RawscopeError;

    fn from_str(s: &str) -> Result<Self> {
        FsTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RawscopeError::InvalidInput(format!("unknown filesystem type '{}'", s)))
    }
}

/// Format-agnostic metadata decoded from a superblock or boot sector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub fs_type: FsTag,
    pub volume_name: String,
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub serial_number: String,
    pub features: BTreeSet<String>,
}

impl FilesystemInfo {
    /// Build a record, refusing counters that contradict each other.
    pub fn new(
        fs_type: FsTag,
        volume_name: impl Into<String>,
        block_size: u32,
        total_blocks: u64,
        free_blocks: u64,
        serial_number: impl Into<String>,
        features: BTreeSet<String>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(RawscopeError::malformed(fs_type.as_str(), "block size is zero"));
        }
        if free_blocks > total_blocks {
            return Err(RawscopeError::malformed(
                fs_type.as_str(),
                format!("free blocks {} exceed total blocks {}", free_blocks, total_blocks),
            ));
        }
        Ok(Self {
            fs_type,
            volume_name: volume_name.into(),
            block_size,
            total_blocks,
            free_blocks,
            serial_number: serial_number.into(),
            features,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_blocks.saturating_mul(self.block_size as u64)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_blocks.saturating_mul(self.block_size as u64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }
}
