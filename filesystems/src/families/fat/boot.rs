// FAT12/16/32 boot sector (BPB) decoding

use crate::utils::{ascii_field, format_serial32, is_power_of_two_in, le_u16, le_u32, u8_at};
use rawscope_core::{FsTag, RawscopeError, Result};

pub const FAT12_MAX_CLUSTERS: u64 = 4085;
pub const FAT16_MAX_CLUSTERS: u64 = 65525;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors: u32,
    pub media: u8,
    pub fat_size: u32,
    pub ext_flags: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub volume_id: Option<u32>,
    pub volume_label: String,
    pub fat_type: FsTag,
}

impl FatBootSector {
    /// Decode and sanity-check a BPB. Anything implausible is an error, so
    /// this doubles as the FAT signature test.
    pub fn parse(boot: &[u8]) -> Result<Self> {
        let bad = |reason: String| Err(RawscopeError::malformed("FAT", reason));

        if boot.len() < 512 || u8_at(boot, 510) != 0x55 || u8_at(boot, 511) != 0xAA {
            return bad("missing 0x55AA boot signature".into());
        }
        let jump_ok = (boot[0] == 0xEB && boot[2] == 0x90) || boot[0] == 0xE9;
        if !jump_ok {
            return bad(format!("boot jump {:02x} {:02x} {:02x}", boot[0], boot[1], boot[2]));
        }

        let bytes_per_sector = le_u16(boot, 11);
        if !is_power_of_two_in(bytes_per_sector as u64, 512, 4096) {
            return bad(format!("bytes per sector {} invalid", bytes_per_sector));
        }
        let sectors_per_cluster = boot[13];
        if !is_power_of_two_in(sectors_per_cluster as u64, 1, 128) {
            return bad(format!("sectors per cluster {} invalid", sectors_per_cluster));
        }
        let reserved_sectors = le_u16(boot, 14);
        let num_fats = boot[16];
        if reserved_sectors == 0 || num_fats == 0 || num_fats > 4 {
            return bad(format!("reserved {} / FAT count {} invalid", reserved_sectors, num_fats));
        }
        let media = boot[21];
        if media != 0xF0 && media < 0xF8 {
            return bad(format!("media descriptor {:#04x} invalid", media));
        }

        let root_entries = le_u16(boot, 17);
        let total16 = le_u16(boot, 19) as u32;
        let total_sectors = if total16 != 0 { total16 } else { le_u32(boot, 32) };
        let fat16_size = le_u16(boot, 22) as u32;
        let is_fat32_layout = fat16_size == 0;
        let fat_size = if is_fat32_layout { le_u32(boot, 36) } else { fat16_size };
        if total_sectors == 0 || fat_size == 0 {
            return bad("zero total sectors or FAT size".into());
        }

        let bps = bytes_per_sector as u64;
        let root_dir_sectors = (root_entries as u64 * 32).div_ceil(bps);
        let meta = reserved_sectors as u64 + num_fats as u64 * fat_size as u64 + root_dir_sectors;
        if meta >= total_sectors as u64 {
            return bad(format!("metadata ({} sectors) fills the volume", meta));
        }
        let clusters = (total_sectors as u64 - meta) / sectors_per_cluster as u64;
        // A zero 16-bit FAT size means the FAT32 layout (root chain, 32-bit
        // links, FSInfo) whatever the cluster count; Linux reads it that way.
        let fat_type = if is_fat32_layout {
            FsTag::Fat32
        } else if clusters < FAT12_MAX_CLUSTERS {
            FsTag::Fat12
        } else if clusters < FAT16_MAX_CLUSTERS {
            FsTag::Fat16
        } else {
            return bad(format!("{} clusters but the BPB uses the FAT12/16 layout", clusters));
        };
        if is_fat32_layout && root_entries != 0 {
            return bad(format!("FAT32 layout with {} fixed root entries", root_entries));
        }

        // Extended BPB sits at 36 for FAT12/16 and at 64 for FAT32.
        let ext = if is_fat32_layout { 64 } else { 36 };
        let has_ext = matches!(u8_at(boot, ext + 2), 0x28 | 0x29);
        let volume_id = has_ext.then(|| le_u32(boot, ext + 3));
        let volume_label = if u8_at(boot, ext + 2) == 0x29 {
            ascii_field(&boot[ext + 7..ext + 18])
        } else {
            String::new()
        };

        let fs = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entries,
            total_sectors,
            media,
            fat_size,
            ext_flags: if is_fat32_layout { le_u16(boot, 40) } else { 0 },
            root_cluster: if is_fat32_layout { le_u32(boot, 44) } else { 0 },
            fs_info_sector: if is_fat32_layout { le_u16(boot, 48) } else { 0 },
            backup_boot_sector: if is_fat32_layout { le_u16(boot, 50) } else { 0 },
            volume_id,
            volume_label,
            fat_type,
        };

        if fat_type == FsTag::Fat32 && (fs.root_cluster < 2 || fs.root_cluster as u64 >= clusters + 2) {
            return bad(format!("root cluster {} out of range", fs.root_cluster));
        }
        Ok(fs)
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn root_dir_sectors(&self) -> u64 {
        (self.root_entries as u64 * 32).div_ceil(self.bytes_per_sector as u64)
    }

    /// Byte offset of the FAT copy in use (FAT32 may disable mirroring).
    pub fn active_fat_offset(&self) -> u64 {
        let index = if self.fat_type == FsTag::Fat32 && self.ext_flags & 0x80 != 0 {
            (self.ext_flags & 0x0F) as u64
        } else {
            0
        };
        (self.reserved_sectors as u64 + index * self.fat_size as u64) * self.bytes_per_sector as u64
    }

    pub fn root_dir_offset(&self) -> u64 {
        (self.reserved_sectors as u64 + self.num_fats as u64 * self.fat_size as u64) * self.bytes_per_sector as u64
    }

    pub fn data_offset(&self) -> u64 {
        self.root_dir_offset() + self.root_dir_sectors() * self.bytes_per_sector as u64
    }

    pub fn cluster_count(&self) -> u64 {
        let data_sectors = self.total_sectors as u64 - self.data_offset() / self.bytes_per_sector as u64;
        data_sectors / self.sectors_per_cluster as u64
    }

    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.cluster_size()
    }

    pub fn serial(&self) -> String {
        self.volume_id.map(format_serial32).unwrap_or_default()
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.fat_type == FsTag::Fat32 {
            if self.fs_info_sector != 0 && self.fs_info_sector != 0xFFFF {
                names.push("fsinfo".to_string());
            }
            if self.backup_boot_sector != 0 && self.backup_boot_sector != 0xFFFF {
                names.push("backup-boot-sector".to_string());
            }
        }
        if self.num_fats > 1 && !(self.fat_type == FsTag::Fat32 && self.ext_flags & 0x80 != 0) {
            names.push("fat-mirroring".to_string());
        }
        names
    }
}

/// Free-cluster hint from a FAT32 FSInfo sector, if it is trustworthy.
pub fn fsinfo_free_clusters(sector: &[u8], cluster_count: u64) -> Option<u64> {
    let valid = le_u32(sector, 0) == 0x4161_5252
        && le_u32(sector, 484) == 0x6141_7272
        && le_u32(sector, 508) == 0xAA55_0000;
    let free = le_u32(sector, 488);
    (valid && free != 0xFFFF_FFFF && free as u64 <= cluster_count).then_some(free as u64)
}
