// exFAT module - boot region decoding, detection and volume metadata

pub mod reader;

pub use reader::{ExFatNode, ExFatReader};

use crate::detection::{FilesystemDetector, ProbeSample};
use crate::device_reader::DeviceReader;
use crate::utils::{format_serial32, le_u16, le_u32, le_u64, u8_at};
use log::{debug, warn};
use rawscope_core::{FilesystemInfo, FsTag, RawscopeError, Result};

pub const EXFAT_SIGNATURE: &[u8; 8] = b"EXFAT   ";

const VOLUME_DIRTY: u16 = 0x0002;
const MEDIA_FAILURE: u16 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExFatBootSector {
    pub partition_offset: u64,
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub first_cluster_of_root: u32,
    pub volume_serial_number: u32,
    pub fs_revision: u16,
    pub volume_flags: u16,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub percent_in_use: u8,
}

impl ExFatBootSector {
    pub fn parse(boot: &[u8]) -> Result<Self> {
        let bad = |reason: String| Err(RawscopeError::malformed("exFAT", reason));
        if boot.get(3..11) != Some(&EXFAT_SIGNATURE[..]) {
            return bad("missing EXFAT signature".into());
        }
        if u8_at(boot, 510) != 0x55 || u8_at(boot, 511) != 0xAA {
            return bad("missing 0x55AA boot signature".into());
        }
        if boot[11..64].iter().any(|&b| b != 0) {
            return bad("legacy BPB area is not zeroed".into());
        }

        let bs = Self {
            partition_offset: le_u64(boot, 64),
            volume_length: le_u64(boot, 72),
            fat_offset: le_u32(boot, 80),
            fat_length: le_u32(boot, 84),
            cluster_heap_offset: le_u32(boot, 88),
            cluster_count: le_u32(boot, 92),
            first_cluster_of_root: le_u32(boot, 96),
            volume_serial_number: le_u32(boot, 100),
            fs_revision: le_u16(boot, 104),
            volume_flags: le_u16(boot, 106),
            bytes_per_sector_shift: boot[108],
            sectors_per_cluster_shift: boot[109],
            number_of_fats: boot[110],
            percent_in_use: boot[112],
        };

        if !(9..=12).contains(&bs.bytes_per_sector_shift) {
            return bad(format!("bytes per sector shift {}", bs.bytes_per_sector_shift));
        }
        if bs.bytes_per_sector_shift as u32 + bs.sectors_per_cluster_shift as u32 > 25 {
            return bad(format!("cluster size shift {} too large", bs.sectors_per_cluster_shift));
        }
        if !(1..=2).contains(&bs.number_of_fats) {
            return bad(format!("FAT count {}", bs.number_of_fats));
        }
        if bs.fat_offset == 0 || bs.cluster_heap_offset as u64 >= bs.volume_length || bs.cluster_count == 0 {
            return bad("FAT or cluster heap outside the volume".into());
        }
        let root = bs.first_cluster_of_root;
        if root < 2 || root > bs.cluster_count + 1 {
            return bad(format!("root cluster {} out of range", root));
        }
        Ok(bs)
    }

    pub fn bytes_per_sector(&self) -> u64 {
        1u64 << self.bytes_per_sector_shift
    }

    pub fn cluster_size(&self) -> u64 {
        1u64 << (self.bytes_per_sector_shift + self.sectors_per_cluster_shift)
    }

    pub fn fat_byte_offset(&self) -> u64 {
        self.fat_offset as u64 * self.bytes_per_sector()
    }

    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.cluster_heap_offset as u64 * self.bytes_per_sector() + (cluster as u64 - 2) * self.cluster_size()
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names = vec![format!(
            "revision-{}.{}",
            self.fs_revision >> 8,
            self.fs_revision & 0xFF
        )];
        if self.volume_flags & VOLUME_DIRTY != 0 {
            names.push("volume-dirty".to_string());
        }
        if self.volume_flags & MEDIA_FAILURE != 0 {
            names.push("media-failure".to_string());
        }
        if self.number_of_fats == 2 {
            names.push("texfat".to_string());
        }
        names
    }
}

pub struct ExFatDetector;

impl FilesystemDetector for ExFatDetector {
    fn detect(sample: &ProbeSample) -> Option<FsTag> {
        // exFAT signature is at offset 3: "EXFAT   "
        (sample.boot_sector.get(3..11) == Some(&EXFAT_SIGNATURE[..])).then_some(FsTag::ExFat)
    }
}

pub fn parse_info(device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let mut reader = ExFatReader::open(device)?;
    let boot = reader.boot_sector().clone();
    let root = reader.scan_root_metadata()?;
    let clusters = boot.cluster_count as u64;

    let free = match root.bitmap {
        Some((first_cluster, length)) => match reader.count_free_in_bitmap(first_cluster, length) {
            Ok(free) => free,
            Err(e) => {
                warn!("exFAT allocation bitmap unreadable ({}); using percent-in-use", e);
                free_from_percent(&boot)
            }
        },
        None => {
            debug!("No allocation bitmap entry in the exFAT root");
            free_from_percent(&boot)
        }
    };

    FilesystemInfo::new(
        FsTag::ExFat,
        root.label.unwrap_or_default(),
        boot.cluster_size() as u32,
        clusters,
        free,
        format_serial32(boot.volume_serial_number),
        boot.feature_names().into_iter().collect(),
    )
}

fn free_from_percent(boot: &ExFatBootSector) -> u64 {
    let clusters = boot.cluster_count as u64;
    if boot.percent_in_use > 100 {
        warn!("exFAT percent-in-use not recorded; reporting no free space");
        return 0;
    }
    clusters * (100 - boot.percent_in_use as u64) / 100
}
