// Btrfs superblock (metadata only; no tree walking)

use crate::detection::{FilesystemDetector, ProbeSample, BTRFS_WINDOW_OFFSET};
use crate::device_reader::DeviceReader;
use crate::utils::{ascii_field, format_uuid, is_power_of_two_in, le_u16, le_u32, le_u64};
use log::debug;
use rawscope_core::{FilesystemInfo, FsTag, RawscopeError, Result};

pub const SUPERBLOCK_OFFSET: u64 = BTRFS_WINDOW_OFFSET;
pub const SUPERBLOCK_SIZE: usize = 4096;
pub const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";
const MAGIC_OFFSET: usize = 0x40;
const LABEL_OFFSET: usize = 0x12B;
const LABEL_SIZE: usize = 256;
const CSUM_TYPE_CRC32C: u16 = 0;

const INCOMPAT_NAMES: &[(u64, &str)] = &[
    (0x0001, "mixed_backref"),
    (0x0002, "default_subvol"),
    (0x0004, "mixed_groups"),
    (0x0008, "compress_lzo"),
    (0x0010, "compress_zstd"),
    (0x0020, "big_metadata"),
    (0x0040, "extended_iref"),
    (0x0080, "raid56"),
    (0x0100, "skinny_metadata"),
    (0x0200, "no_holes"),
    (0x0400, "metadata_uuid"),
    (0x0800, "raid1c34"),
    (0x1000, "zoned"),
    (0x2000, "extent_tree_v2"),
];

const COMPAT_RO_NAMES: &[(u64, &str)] = &[
    (0x0001, "free_space_tree"),
    (0x0002, "free_space_tree_valid"),
    (0x0004, "verity"),
    (0x0008, "block_group_tree"),
];

#[derive(Debug, Clone)]
pub struct BtrfsSuperblock {
    pub csum: u32,
    pub fsid: String,
    pub bytenr: u64,
    pub generation: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub label: String,
}

impl BtrfsSuperblock {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            csum: le_u32(buf, 0x00),
            fsid: format_uuid(buf.get(0x20..0x30).unwrap_or(&[])),
            bytenr: le_u64(buf, 0x30),
            generation: le_u64(buf, 0x48),
            total_bytes: le_u64(buf, 0x70),
            bytes_used: le_u64(buf, 0x78),
            num_devices: le_u64(buf, 0x88),
            sectorsize: le_u32(buf, 0x90),
            nodesize: le_u32(buf, 0x94),
            compat_ro_flags: le_u64(buf, 0xB4),
            incompat_flags: le_u64(buf, 0xBC),
            csum_type: le_u16(buf, 0xC4),
            label: ascii_field(buf.get(LABEL_OFFSET..LABEL_OFFSET + LABEL_SIZE).unwrap_or(&[])),
        }
    }

    pub fn validate(&self, raw: &[u8]) -> Result<()> {
        let bad = |reason: String| Err(RawscopeError::malformed("Btrfs", reason));
        if raw.get(MAGIC_OFFSET..MAGIC_OFFSET + 8) != Some(&BTRFS_MAGIC[..]) {
            return bad("missing _BHRfS_M magic".into());
        }
        if self.bytenr != SUPERBLOCK_OFFSET {
            return bad(format!("superblock claims to live at {:#x}", self.bytenr));
        }
        if !is_power_of_two_in(self.sectorsize as u64, 4096, 65536) {
            return bad(format!("sector size {}", self.sectorsize));
        }
        if !is_power_of_two_in(self.nodesize as u64, self.sectorsize as u64, 65536) {
            return bad(format!("node size {}", self.nodesize));
        }
        if self.total_bytes == 0 || self.bytes_used > self.total_bytes {
            return bad(format!("{} bytes used of {}", self.bytes_used, self.total_bytes));
        }
        if self.csum_type == CSUM_TYPE_CRC32C {
            let computed = crc32c::crc32c(raw.get(0x20..SUPERBLOCK_SIZE).unwrap_or(&[]));
            if computed != self.csum {
                return bad(format!("superblock crc32c {:#010x}, computed {:#010x}", self.csum, computed));
            }
        } else {
            debug!("Btrfs checksum type {} not verified", self.csum_type);
        }
        Ok(())
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for &(bit, name) in INCOMPAT_NAMES {
            if self.incompat_flags & bit != 0 {
                names.push(name.to_string());
            }
        }
        for &(bit, name) in COMPAT_RO_NAMES {
            if self.compat_ro_flags & bit != 0 {
                names.push(name.to_string());
            }
        }
        if self.num_devices > 1 {
            names.push("multi-device".to_string());
        }
        names
    }
}

pub struct BtrfsDetector;

impl FilesystemDetector for BtrfsDetector {
    fn detect(sample: &ProbeSample) -> Option<FsTag> {
        (sample.btrfs_window.get(MAGIC_OFFSET..MAGIC_OFFSET + 8) == Some(&BTRFS_MAGIC[..])).then_some(FsTag::Btrfs)
    }
}

pub fn parse_info(device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let raw = device.read_at(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
    let sb = BtrfsSuperblock::parse(&raw);
    sb.validate(&raw)?;
    debug!(
        "Btrfs generation {}, {} device(s), node size {}",
        sb.generation, sb.num_devices, sb.nodesize
    );

    let sector = sb.sectorsize as u64;
    FilesystemInfo::new(
        FsTag::Btrfs,
        sb.label.clone(),
        sb.sectorsize,
        sb.total_bytes / sector,
        (sb.total_bytes - sb.bytes_used) / sector,
        sb.fsid.clone(),
        sb.feature_names().into_iter().collect(),
    )
}
