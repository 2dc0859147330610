// FAT Filesystem Family
// Includes FAT12, FAT16, FAT32, and exFAT

pub mod boot;
pub mod dir;
pub mod exfat;
pub mod reader;
pub mod table;

pub use boot::FatBootSector;
pub use reader::{FatNode, FatReader};

use crate::detection::{FilesystemDetector, ProbeSample};
use crate::device_reader::DeviceReader;
use log::{debug, warn};
use rawscope_core::{FilesystemInfo, FsTag, Result};

pub struct FatDetector;

impl FilesystemDetector for FatDetector {
    fn detect(sample: &ProbeSample) -> Option<FsTag> {
        FatBootSector::parse(&sample.boot_sector).ok().map(|bs| bs.fat_type)
    }
}

/// Labels formatted without a name carry this placeholder.
fn clean_label(label: String) -> String {
    if label == "NO NAME" {
        String::new()
    } else {
        label
    }
}

pub fn parse_info(device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let mut reader = FatReader::open(device)?;
    let boot = reader.boot_sector().clone();
    let clusters = boot.cluster_count();

    let label = match reader.root_volume_label() {
        Ok(Some(label)) => label,
        Ok(None) => boot.volume_label.clone(),
        Err(e) => {
            warn!("Could not read {} root directory for the label: {}", boot.fat_type, e);
            boot.volume_label.clone()
        }
    };

    let hint = reader.fsinfo_free_hint()?;
    let free = match hint {
        Some(free) => free,
        None => {
            debug!("No usable FSInfo hint; scanning the {}", boot.fat_type);
            reader.count_free_clusters()?
        }
    };

    FilesystemInfo::new(
        boot.fat_type,
        clean_label(label),
        boot.cluster_size() as u32,
        clusters,
        free,
        boot.serial(),
        boot.feature_names().into_iter().collect(),
    )
}
