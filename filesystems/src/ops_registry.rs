// Per-format dispatch: every public filesystem operation lands here and is
// routed by a match on the detected tag.

use crate::detection::{classify, detect_filesystem, Detection, ProbeSample};
use crate::device_reader::DeviceReader;
use crate::families::fat::exfat::{self, ExFatReader};
use crate::families::{btrfs, ext, fat, ntfs, xfs};
use crate::ops::{self, TreeWalker};
use log::{debug, info};
use rawscope_core::{FilesystemInfo, FsTag, ListOptions, Listing, ProbeOutcome, RawscopeError, Result};

/// Formats whose directory trees can be walked from raw sectors.
pub fn has_raw_walker(tag: FsTag) -> bool {
    match tag {
        FsTag::Ext2 | FsTag::Ext3 | FsTag::Ext4 => true,
        FsTag::Fat12 | FsTag::Fat16 | FsTag::Fat32 | FsTag::ExFat => true,
        FsTag::Ntfs => true,
        FsTag::Btrfs | FsTag::Xfs => false,
    }
}

/// Run the metadata parser for `tag`.
pub fn parse_filesystem(tag: FsTag, device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let info = match tag {
        FsTag::Ext2 | FsTag::Ext3 | FsTag::Ext4 => ext::parse_info(device)?,
        FsTag::Ntfs => ntfs::parse_info(device)?,
        FsTag::Fat12 | FsTag::Fat16 | FsTag::Fat32 => fat::parse_info(device)?,
        FsTag::ExFat => exfat::parse_info(device)?,
        FsTag::Btrfs => btrfs::parse_info(device)?,
        FsTag::Xfs => xfs::parse_info(device)?,
    };
    if info.fs_type != tag {
        // The superblock decides the exact variant (e.g. ext3 vs ext4).
        debug!("{} parser reported {}", tag, info.fs_type);
    }
    Ok(info)
}

/// Detect the format and parse its metadata. Candidates are tried in
/// precedence order; the next one is only tried after `NotRecognized`.
pub fn detect_and_parse_device(device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let sample = ProbeSample::read(device)?;
    let candidates = crate::detection::candidates(&sample);

    if candidates.is_empty() {
        return match classify(&sample) {
            Detection::Damaged { fs_type, reason } => Err(RawscopeError::malformed(fs_type.as_str(), reason)),
            _ => Err(RawscopeError::NotRecognized(device.path().to_string())),
        };
    }

    let mut last = None;
    for tag in candidates {
        match parse_filesystem(tag, device) {
            Ok(info) => {
                info!("{}: {} volume '{}'", device.path(), info.fs_type, info.volume_name);
                return Ok(info);
            }
            Err(RawscopeError::NotRecognized(reason)) => {
                debug!("{} candidate rejected: {}", tag, reason);
                last = Some(RawscopeError::NotRecognized(reason));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| RawscopeError::NotRecognized(device.path().to_string())))
}

pub fn detect_and_parse(locator: &str) -> Result<FilesystemInfo> {
    let mut device = DeviceReader::open(locator)?;
    detect_and_parse_device(&mut device)
}

/// Signature detection alone.
pub fn detect(locator: &str) -> Result<Detection> {
    let mut device = DeviceReader::open(locator)?;
    detect_filesystem(&mut device)
}

/// Everything the access planner needs to know about the raw side.
pub fn probe(locator: &str) -> ProbeOutcome {
    let outcome = match detect_and_parse(locator) {
        Ok(info) => ProbeOutcome::Recognized {
            fs_type: info.fs_type,
            raw_walker: has_raw_walker(info.fs_type),
        },
        Err(RawscopeError::NotRecognized(_)) => ProbeOutcome::NotRecognized,
        Err(RawscopeError::PermissionDenied { reason, .. }) => ProbeOutcome::Denied { reason },
        Err(RawscopeError::MalformedStructure(reason)) => ProbeOutcome::Damaged {
            fs_type: damaged_tag(locator),
            reason,
        },
        Err(e) => ProbeOutcome::Failed { reason: e.to_string() },
    };
    debug!("probe {}: {:?}", locator, outcome);
    outcome
}

fn damaged_tag(locator: &str) -> Option<FsTag> {
    match detect(locator).ok()? {
        Detection::Recognized(tag) => Some(tag),
        Detection::Damaged { fs_type, .. } => Some(fs_type),
        Detection::NotRecognized => None,
    }
}

/// Resolve the walkable format of a device, refusing metadata-only ones.
fn walkable_tag(device: &mut DeviceReader) -> Result<FsTag> {
    let detection = detect_filesystem(device)?;
    match detection {
        Detection::Recognized(tag) if has_raw_walker(tag) => Ok(tag),
        Detection::Recognized(tag) => Err(RawscopeError::NotSupported(format!(
            "directory decoder not yet implemented for {}",
            tag
        ))),
        Detection::Damaged { fs_type, reason } => Err(RawscopeError::malformed(fs_type.as_str(), reason)),
        Detection::NotRecognized => Err(RawscopeError::NotRecognized(device.path().to_string())),
    }
}

/// Run `f` against the walker for the device's format.
macro_rules! with_walker {
    ($device:expr, $tag:expr, |$walker:ident| $body:expr) => {
        match $tag {
            FsTag::Ext2 | FsTag::Ext3 | FsTag::Ext4 => {
                let mut $walker = ext::ExtReader::open($device)?;
                $body
            }
            FsTag::Fat12 | FsTag::Fat16 | FsTag::Fat32 => {
                let mut $walker = fat::FatReader::open($device)?;
                $body
            }
            FsTag::ExFat => {
                let mut $walker = ExFatReader::open($device)?;
                $body
            }
            FsTag::Ntfs => {
                let mut $walker = ntfs::NtfsReader::open($device)?;
                $body
            }
            FsTag::Btrfs | FsTag::Xfs => Err(RawscopeError::NotSupported(format!(
                "directory decoder not yet implemented for {}",
                $tag
            ))),
        }
    };
}

pub fn list_entries(locator: &str, relative_path: &str, options: &ListOptions) -> Result<Listing> {
    options.validate()?;
    let mut device = DeviceReader::open(locator)?;
    let tag = walkable_tag(&mut device)?;
    with_walker!(&mut device, tag, |walker| ops::list_directory(&mut walker, relative_path, options))
}

pub fn read_preview(locator: &str, relative_path: &str, limit: usize) -> Result<Vec<u8>> {
    let mut device = DeviceReader::open(locator)?;
    let tag = walkable_tag(&mut device)?;
    with_walker!(&mut device, tag, |walker| {
        debug!("{} preview of '{}' ({} bytes max)", walker.fs_type(), relative_path, limit);
        ops::read_preview(&mut walker, relative_path, limit)
    })
}
