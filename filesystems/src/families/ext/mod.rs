// ext2/ext3/ext4 family

pub mod reader;
pub mod superblock;

pub use reader::ExtReader;
pub use superblock::ExtSuperblock;

use crate::detection::{FilesystemDetector, ProbeSample};
use crate::device_reader::DeviceReader;
use rawscope_core::{FilesystemInfo, FsTag, Result};

pub struct ExtDetector;

impl FilesystemDetector for ExtDetector {
    fn detect(sample: &ProbeSample) -> Option<FsTag> {
        let sb = ExtSuperblock::parse(&sample.ext_superblock);
        (sb.magic == superblock::EXT_MAGIC).then(|| sb.version())
    }
}

/// A superblock whose magic is gone but whose geometry is still ext-shaped.
pub fn detect_damaged(sample: &ProbeSample) -> Option<(FsTag, String)> {
    let sb = ExtSuperblock::parse(&sample.ext_superblock);
    if sb.magic != superblock::EXT_MAGIC && sb.looks_like_ext_without_magic() {
        Some((
            sb.version(),
            format!("superblock magic is {:#06x} but the ext geometry is intact", sb.magic),
        ))
    } else {
        None
    }
}

pub fn parse_info(device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let raw = device.read_at(superblock::SUPERBLOCK_OFFSET, superblock::SUPERBLOCK_SIZE)?;
    let sb = ExtSuperblock::parse(&raw);
    sb.validate()?;

    log::debug!(
        "{} superblock: {} blocks, {} free, last mounted at '{}'",
        sb.version(),
        sb.blocks_count,
        sb.free_blocks_count,
        sb.last_mounted
    );

    FilesystemInfo::new(
        sb.version(),
        sb.volume_name.clone(),
        sb.block_size() as u32,
        sb.blocks_count,
        sb.free_blocks_count,
        sb.serial(),
        sb.feature_names().into_iter().collect(),
    )
}
