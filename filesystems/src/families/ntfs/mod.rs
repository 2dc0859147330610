// NTFS filesystem support module
// Read-only: boot sector, MFT records, $I30 indexes

pub mod boot;
pub mod index;
pub mod mft;
pub mod reader;

pub use boot::NtfsBootSector;
pub use reader::NtfsReader;

use crate::detection::{FilesystemDetector, ProbeSample};
use crate::device_reader::DeviceReader;
use log::warn;
use rawscope_core::{FilesystemInfo, FsTag, Result};
use std::collections::BTreeSet;

pub struct NtfsDetector;

impl FilesystemDetector for NtfsDetector {
    fn detect(sample: &ProbeSample) -> Option<FsTag> {
        // NTFS OEM id sits at offset 3: "NTFS    "
        (sample.boot_sector.get(3..11) == Some(&boot::NTFS_OEM_ID[..])).then_some(FsTag::Ntfs)
    }
}

/// Volume facts from the boot sector, enriched from $Volume and $Bitmap
/// when the MFT is readable.
pub fn parse_info(device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let sector = device.read_at(0, 512)?;
    let boot = NtfsBootSector::parse(&sector)?;
    let mut features = BTreeSet::new();
    let mut label = String::new();
    let mut free = 0;

    match read_volume_state(device) {
        Ok((meta, free_clusters)) => {
            label = meta.label;
            free = free_clusters;
            if let Some((major, minor)) = meta.version {
                features.insert(format!("ntfs-{}.{}", major, minor));
            }
            if meta.dirty {
                features.insert("dirty".to_string());
            }
        }
        Err(e) => {
            warn!("NTFS volume metadata unreadable on {}: {}", device.path(), e);
            features.insert("volume-metadata-unavailable".to_string());
        }
    }

    FilesystemInfo::new(
        FsTag::Ntfs,
        label,
        boot.cluster_size() as u32,
        boot.total_clusters(),
        free,
        boot.serial(),
        features,
    )
}

fn read_volume_state(device: &mut DeviceReader) -> Result<(reader::VolumeMetadata, u64)> {
    let mut reader = NtfsReader::open(device)?;
    let meta = reader.volume_metadata()?;
    let free = reader.count_free_clusters()?;
    Ok((meta, free))
}
