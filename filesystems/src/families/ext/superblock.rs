// ext2/3/4 superblock decoding

use crate::utils::{ascii_field, format_uuid, le_u16, le_u32};
use rawscope_core::{FsTag, RawscopeError, Result};

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT_MAGIC: u16 = 0xEF53;

pub const COMPAT_HAS_JOURNAL: u32 = 0x0004;

pub const INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const INCOMPAT_META_BG: u32 = 0x0010;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_MMP: u32 = 0x0100;
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const INCOMPAT_INLINE_DATA: u32 = 0x8000;

pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const RO_COMPAT_HUGE_FILE: u32 = 0x0008;
pub const RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const RO_COMPAT_DIR_NLINK: u32 = 0x0020;
pub const RO_COMPAT_EXTRA_ISIZE: u32 = 0x0040;
pub const RO_COMPAT_BIGALLOC: u32 = 0x0200;
pub const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

const COMPAT_NAMES: &[(u32, &str)] = &[
    (0x0001, "dir_prealloc"),
    (0x0002, "imagic_inodes"),
    (0x0004, "has_journal"),
    (0x0008, "ext_attr"),
    (0x0010, "resize_inode"),
    (0x0020, "dir_index"),
    (0x0200, "sparse_super2"),
    (0x0400, "fast_commit"),
    (0x1000, "orphan_file"),
];

const INCOMPAT_NAMES: &[(u32, &str)] = &[
    (0x0001, "compression"),
    (0x0002, "filetype"),
    (0x0004, "needs_recovery"),
    (0x0008, "journal_dev"),
    (0x0010, "meta_bg"),
    (0x0040, "extent"),
    (0x0080, "64bit"),
    (0x0100, "mmp"),
    (0x0200, "flex_bg"),
    (0x0400, "ea_inode"),
    (0x1000, "dirdata"),
    (0x2000, "metadata_csum_seed"),
    (0x4000, "large_dir"),
    (0x8000, "inline_data"),
    (0x10000, "encrypt"),
    (0x20000, "casefold"),
];

const RO_COMPAT_NAMES: &[(u32, &str)] = &[
    (0x0001, "sparse_super"),
    (0x0002, "large_file"),
    (0x0008, "huge_file"),
    (0x0010, "uninit_bg"),
    (0x0020, "dir_nlink"),
    (0x0040, "extra_isize"),
    (0x0100, "quota"),
    (0x0200, "bigalloc"),
    (0x0400, "metadata_csum"),
    (0x1000, "read-only"),
    (0x2000, "project"),
    (0x8000, "verity"),
    (0x10000, "orphan_present"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtSuperblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,
    pub desc_size: u16,
    pub first_meta_bg: u32,
}

impl ExtSuperblock {
    /// Decode the 1024-byte superblock. No validation happens here.
    pub fn parse(buf: &[u8]) -> Self {
        let incompat = le_u32(buf, 96);
        let wide = incompat & INCOMPAT_64BIT != 0;
        let hi = |offset: usize| if wide { (le_u32(buf, offset) as u64) << 32 } else { 0 };

        let mut uuid = [0u8; 16];
        if let Some(src) = buf.get(104..120) {
            uuid.copy_from_slice(src);
        }

        Self {
            inodes_count: le_u32(buf, 0),
            blocks_count: le_u32(buf, 4) as u64 | hi(336),
            free_blocks_count: le_u32(buf, 12) as u64 | hi(344),
            free_inodes_count: le_u32(buf, 16),
            first_data_block: le_u32(buf, 20),
            log_block_size: le_u32(buf, 24),
            log_cluster_size: le_u32(buf, 28),
            blocks_per_group: le_u32(buf, 32),
            clusters_per_group: le_u32(buf, 36),
            inodes_per_group: le_u32(buf, 40),
            magic: le_u16(buf, 56),
            state: le_u16(buf, 58),
            rev_level: le_u32(buf, 76),
            first_ino: le_u32(buf, 84),
            inode_size: le_u16(buf, 88),
            feature_compat: le_u32(buf, 92),
            feature_incompat: incompat,
            feature_ro_compat: le_u32(buf, 100),
            uuid,
            volume_name: ascii_field(buf.get(120..136).unwrap_or(&[])),
            last_mounted: ascii_field(buf.get(136..200).unwrap_or(&[])),
            desc_size: le_u16(buf, 254),
            first_meta_bg: le_u32(buf, 260),
        }
    }

    pub fn block_size(&self) -> u64 {
        1024u64 << self.log_block_size.min(16)
    }

    pub fn inode_size(&self) -> u64 {
        if self.rev_level == 0 {
            128
        } else {
            self.inode_size as u64
        }
    }

    pub fn group_count(&self) -> u64 {
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block as u64);
        data_blocks.div_ceil(self.blocks_per_group.max(1) as u64)
    }

    /// Bytes per group descriptor.
    pub fn desc_size(&self) -> u64 {
        if self.feature_incompat & INCOMPAT_64BIT != 0 && self.desc_size >= 64 {
            self.desc_size as u64
        } else {
            32
        }
    }

    pub fn has_incompat(&self, flag: u32) -> bool {
        self.feature_incompat & flag != 0
    }

    /// ext2, ext3 or ext4, judged from feature flags.
    pub fn version(&self) -> FsTag {
        let ext4_incompat = INCOMPAT_EXTENTS | INCOMPAT_64BIT | INCOMPAT_FLEX_BG | INCOMPAT_MMP | INCOMPAT_INLINE_DATA;
        let ext4_ro = RO_COMPAT_HUGE_FILE
            | RO_COMPAT_GDT_CSUM
            | RO_COMPAT_DIR_NLINK
            | RO_COMPAT_EXTRA_ISIZE
            | RO_COMPAT_BIGALLOC
            | RO_COMPAT_METADATA_CSUM;
        if self.feature_incompat & ext4_incompat != 0 || self.feature_ro_compat & ext4_ro != 0 {
            FsTag::Ext4
        } else if self.feature_compat & COMPAT_HAS_JOURNAL != 0 {
            FsTag::Ext3
        } else {
            FsTag::Ext2
        }
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (flags, table) in [
            (self.feature_compat, COMPAT_NAMES),
            (self.feature_incompat, INCOMPAT_NAMES),
            (self.feature_ro_compat, RO_COMPAT_NAMES),
        ] {
            names.extend(
                table
                    .iter()
                    .filter(|(bit, _)| flags & bit != 0)
                    .map(|(_, name)| name.to_string()),
            );
        }
        if self.state & 0x0002 != 0 {
            names.push("errors_detected".to_string());
        }
        names
    }

    pub fn serial(&self) -> String {
        format_uuid(&self.uuid)
    }

    /// Check the fields everything else depends on.
    pub fn validate(&self) -> Result<()> {
        let fs = self.version();
        if self.magic != EXT_MAGIC {
            return Err(RawscopeError::malformed(
                fs.as_str(),
                format!("superblock magic {:#06x} at offset 1080, expected {:#06x}", self.magic, EXT_MAGIC),
            ));
        }
        self.validate_geometry()
            .map_err(|reason| RawscopeError::malformed(fs.as_str(), reason))
    }

    fn validate_geometry(&self) -> std::result::Result<(), String> {
        if self.log_block_size > 6 {
            return Err(format!("log block size {} out of range", self.log_block_size));
        }
        let block_size = self.block_size();
        let bigalloc = self.feature_ro_compat & RO_COMPAT_BIGALLOC != 0;
        if bigalloc {
            // The block bitmap tracks clusters, so the per-group limit applies
            // to clusters and blocks per group scale with the cluster ratio.
            if self.log_cluster_size < self.log_block_size || self.log_cluster_size - self.log_block_size > 16 {
                return Err(format!("log cluster size {} out of range", self.log_cluster_size));
            }
            let ratio = 1u64 << (self.log_cluster_size - self.log_block_size);
            if self.clusters_per_group == 0 || self.clusters_per_group as u64 > 8 * block_size {
                return Err(format!("clusters per group {} invalid", self.clusters_per_group));
            }
            if self.blocks_per_group as u64 != self.clusters_per_group as u64 * ratio {
                return Err(format!(
                    "blocks per group {} disagrees with {} clusters of {} blocks",
                    self.blocks_per_group, self.clusters_per_group, ratio
                ));
            }
        } else if self.blocks_per_group == 0 || self.blocks_per_group as u64 > 8 * block_size {
            return Err(format!("blocks per group {} invalid", self.blocks_per_group));
        }
        if self.inodes_per_group == 0 || self.inodes_per_group as u64 > 8 * block_size {
            return Err(format!("inodes per group {} invalid", self.inodes_per_group));
        }
        // mkfs starts bigalloc volumes at block 0 even with 1 KiB blocks.
        let expected_first = if block_size == 1024 && !bigalloc { 1 } else { 0 };
        if self.first_data_block != expected_first {
            return Err(format!(
                "first data block {} inconsistent with {} byte blocks",
                self.first_data_block, block_size
            ));
        }
        if self.rev_level > 1 {
            return Err(format!("unknown revision {}", self.rev_level));
        }
        let inode_size = self.inode_size();
        if !inode_size.is_power_of_two() || inode_size < 128 || inode_size > block_size {
            return Err(format!("inode size {} invalid", inode_size));
        }
        if self.blocks_count == 0 || self.free_blocks_count > self.blocks_count {
            return Err(format!(
                "block counters inconsistent (total {}, free {})",
                self.blocks_count, self.free_blocks_count
            ));
        }
        if self.inodes_count == 0 || self.free_inodes_count > self.inodes_count {
            return Err("inode counters inconsistent".to_string());
        }
        Ok(())
    }

    /// True when everything except the magic looks like an ext superblock.
    ///
    /// Used to tell a damaged ext volume apart from an unformatted one.
    pub fn looks_like_ext_without_magic(&self) -> bool {
        if self.validate_geometry().is_err() {
            return false;
        }
        // Group bookkeeping must agree as well: inode count equals groups
        // times inodes per group on every mkfs-produced volume.
        let groups = self.group_count();
        groups > 0 && self.inodes_count as u64 == groups * self.inodes_per_group as u64
    }
}
