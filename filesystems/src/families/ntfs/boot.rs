// NTFS boot sector (volume boot record)

use crate::utils::{is_power_of_two_in, le_u16, le_u64, u8_at};
use rawscope_core::{RawscopeError, Result};

pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub record_size: u32,
    pub index_block_size: u32,
    pub serial_number: u64,
}

/// Sizes at 0x40/0x44: positive means clusters, negative means 2^-n bytes.
fn decode_size(raw: u8, cluster_size: u64) -> Option<u32> {
    let signed = raw as i8;
    let size = if signed > 0 {
        signed as u64 * cluster_size
    } else {
        let shift = -(signed as i32);
        if !(9..=31).contains(&shift) {
            return None;
        }
        1u64 << shift
    };
    u32::try_from(size).ok()
}

impl NtfsBootSector {
    pub fn parse(boot: &[u8]) -> Result<Self> {
        let bad = |reason: String| Err(RawscopeError::malformed("NTFS", reason));
        if boot.get(3..11) != Some(&NTFS_OEM_ID[..]) {
            return bad("missing NTFS OEM id".into());
        }
        if u8_at(boot, 510) != 0x55 || u8_at(boot, 511) != 0xAA {
            return bad("missing 0x55AA boot signature".into());
        }

        let bytes_per_sector = le_u16(boot, 11);
        if !is_power_of_two_in(bytes_per_sector as u64, 512, 4096) {
            return bad(format!("bytes per sector {}", bytes_per_sector));
        }
        let reserved_zero = le_u16(boot, 14) == 0
            && boot[16] == 0
            && le_u16(boot, 17) == 0
            && le_u16(boot, 19) == 0
            && le_u16(boot, 22) == 0;
        if !reserved_zero {
            return bad("BPB fields unused by NTFS are not zero".into());
        }
        let raw_spc = boot[13];
        let sectors_per_cluster = if raw_spc > 0x80 {
            1u32 << (256 - raw_spc as u32).min(31)
        } else {
            raw_spc as u32
        };
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return bad(format!("sectors per cluster {:#04x}", raw_spc));
        }
        let cluster_size = bytes_per_sector as u64 * sectors_per_cluster as u64;

        let total_sectors = le_u64(boot, 0x28);
        let mft_lcn = le_u64(boot, 0x30);
        let total_clusters = total_sectors / sectors_per_cluster as u64;
        if total_clusters == 0 || mft_lcn == 0 || mft_lcn >= total_clusters {
            return bad(format!("MFT cluster {} outside {} clusters", mft_lcn, total_clusters));
        }

        let record_size = decode_size(boot[0x40], cluster_size)
            .filter(|&s| is_power_of_two_in(s as u64, 256, 65536))
            .ok_or_else(|| RawscopeError::malformed("NTFS", format!("MFT record size byte {:#04x}", boot[0x40])))?;
        let index_block_size = decode_size(boot[0x44], cluster_size)
            .filter(|&s| is_power_of_two_in(s as u64, 256, 65536))
            .ok_or_else(|| RawscopeError::malformed("NTFS", format!("index block size byte {:#04x}", boot[0x44])))?;

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn: le_u64(boot, 0x38),
            record_size,
            index_block_size,
            serial_number: le_u64(boot, 0x48),
        })
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }

    pub fn serial(&self) -> String {
        format!("{:016X}", self.serial_number)
    }
}
