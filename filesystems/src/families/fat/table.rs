// FAT table access and cluster chain following

use super::boot::FatBootSector;
use crate::device_reader::DeviceReader;
use crate::utils::{le_u16, le_u32};
use log::warn;
use rawscope_core::{FsTag, RawscopeError, Result};
use std::collections::HashSet;

/// FAT cluster values with special meanings
pub mod cluster_values {
    pub const FREE_CLUSTER: u32 = 0x0000_0000;
    pub const BAD_CLUSTER_FAT12: u32 = 0x0000_0FF7;
    pub const BAD_CLUSTER_FAT16: u32 = 0x0000_FFF7;
    pub const BAD_CLUSTER_FAT32: u32 = 0x0FFF_FFF7;
}

const SCAN_CHUNK: usize = 1024 * 1024;

pub struct FatTable {
    variant: FsTag,
    offset: u64,
    size_bytes: u64,
    cluster_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Next(u32),
    Bad,
    EndOfChain,
}

impl FatTable {
    pub fn new(boot: &FatBootSector) -> Self {
        Self {
            variant: boot.fat_type,
            offset: boot.active_fat_offset(),
            size_bytes: boot.fat_size as u64 * boot.bytes_per_sector as u64,
            cluster_count: boot.cluster_count(),
        }
    }

    fn bad_value(&self) -> u32 {
        match self.variant {
            FsTag::Fat12 => cluster_values::BAD_CLUSTER_FAT12,
            FsTag::Fat16 => cluster_values::BAD_CLUSTER_FAT16,
            _ => cluster_values::BAD_CLUSTER_FAT32,
        }
    }

    fn classify(&self, value: u32) -> FatEntry {
        let bad = self.bad_value();
        if value == cluster_values::FREE_CLUSTER {
            FatEntry::Free
        } else if value == bad {
            FatEntry::Bad
        } else if value > bad {
            FatEntry::EndOfChain
        } else {
            FatEntry::Next(value)
        }
    }

    fn entry_position(&self, cluster: u64) -> (u64, usize) {
        match self.variant {
            FsTag::Fat12 => (cluster + cluster / 2, 2),
            FsTag::Fat16 => (cluster * 2, 2),
            _ => (cluster * 4, 4),
        }
    }

    /// Entry value for `cluster` stored at byte `pos` of `buf`.
    fn value_at(&self, buf: &[u8], pos: usize, cluster: u64) -> u32 {
        match self.variant {
            FsTag::Fat12 => {
                let pair = le_u16(buf, pos);
                if cluster & 1 == 1 {
                    (pair >> 4) as u32
                } else {
                    (pair & 0x0FFF) as u32
                }
            }
            FsTag::Fat16 => le_u16(buf, pos) as u32,
            _ => le_u32(buf, pos) & 0x0FFF_FFFF,
        }
    }

    /// Decode from a buffer holding the table from its first byte.
    fn decode(&self, fat: &[u8], cluster: u64) -> u32 {
        self.value_at(fat, self.entry_position(cluster).0 as usize, cluster)
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && (cluster as u64) < self.cluster_count + 2
    }

    pub fn entry(&self, device: &mut DeviceReader, cluster: u32) -> Result<FatEntry> {
        let (pos, len) = self.entry_position(cluster as u64);
        let raw = device.read_at(self.offset + pos, len)?;
        Ok(self.classify(self.value_at(&raw, 0, cluster as u64)))
    }

    /// Follow a chain from `start`. Stops at end-of-chain or after
    /// `max_clusters`. Loops, bad clusters and out-of-range links are
    /// structural errors.
    pub fn chain(&self, device: &mut DeviceReader, start: u32, max_clusters: Option<usize>) -> Result<Vec<u32>> {
        let fs = self.variant.as_str();
        let max = max_clusters.unwrap_or(usize::MAX);
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = start;

        while chain.len() < max {
            if !self.is_valid_cluster(current) {
                return Err(RawscopeError::malformed(fs, format!("cluster {} out of range", current)));
            }
            if !visited.insert(current) {
                return Err(RawscopeError::malformed(fs, format!("cluster chain loops at {}", current)));
            }
            chain.push(current);
            match self.entry(device, current)? {
                FatEntry::Next(next) => current = next,
                FatEntry::EndOfChain => break,
                FatEntry::Bad => {
                    return Err(RawscopeError::malformed(fs, format!("chain reaches bad cluster after {}", current)))
                }
                FatEntry::Free => {
                    return Err(RawscopeError::malformed(fs, format!("chain runs into free cluster after {}", current)))
                }
            }
        }
        Ok(chain)
    }

    /// Count free clusters by scanning the whole FAT.
    pub fn count_free(&self, device: &mut DeviceReader) -> Result<u64> {
        let last = self.cluster_count + 2;
        let mut free = 0u64;

        if self.variant == FsTag::Fat12 {
            // FAT12 entries straddle bytes; the table is small enough to read whole.
            let fat = device.read_at(self.offset, self.size_bytes as usize)?;
            for cluster in 2..last {
                if self.decode(&fat, cluster) == cluster_values::FREE_CLUSTER {
                    free += 1;
                }
            }
            return Ok(free);
        }

        let entry_size = if self.variant == FsTag::Fat16 { 2u64 } else { 4 };
        let needed = (last * entry_size).min(self.size_bytes);
        if needed < last * entry_size {
            warn!("{} table shorter than its cluster count; counting what is there", self.variant);
        }
        let mut pos = 0u64;
        while pos < needed {
            let len = (needed - pos).min(SCAN_CHUNK as u64);
            let chunk = device.read_at(self.offset + pos, len as usize)?;
            let first = pos / entry_size;
            for i in 0..(len / entry_size) {
                let cluster = first + i;
                if cluster < 2 {
                    continue;
                }
                if self.value_at(&chunk, (i * entry_size) as usize, cluster) == cluster_values::FREE_CLUSTER {
                    free += 1;
                }
            }
            pos += len;
        }
        Ok(free)
    }
}
