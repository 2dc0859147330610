// XFS superblock (big-endian, metadata only)

use crate::detection::{FilesystemDetector, ProbeSample};
use crate::device_reader::DeviceReader;
use crate::utils::{ascii_field, be_u16, be_u32, be_u64, format_uuid, is_power_of_two_in, u8_at};
use rawscope_core::{FilesystemInfo, FsTag, RawscopeError, Result};

pub const XFS_MAGIC: &[u8; 4] = b"XFSB";
pub const SUPERBLOCK_SIZE: usize = 512;

const VERSION_MASK: u16 = 0x000F;
const VERSION_MOREBITS: u16 = 0x8000;

const VERSION_NAMES: &[(u16, &str)] = &[
    (0x0010, "attr"),
    (0x0020, "nlink"),
    (0x0040, "quota"),
    (0x0080, "align"),
    (0x0100, "dalign"),
    (0x0400, "logv2"),
    (0x0800, "sector"),
    (0x1000, "extflg"),
    (0x2000, "dirv2"),
];

const FEATURES2_NAMES: &[(u32, &str)] = &[
    (0x0002, "lazy-count"),
    (0x0008, "attr2"),
    (0x0010, "parent"),
    (0x0080, "projid32"),
    (0x0100, "crc"),
    (0x0200, "ftype"),
];

const RO_COMPAT_NAMES: &[(u32, &str)] = &[
    (0x0001, "finobt"),
    (0x0002, "rmapbt"),
    (0x0004, "reflink"),
    (0x0008, "inobtcount"),
];

const INCOMPAT_NAMES: &[(u32, &str)] = &[
    (0x0001, "ftype"),
    (0x0002, "sparse-inodes"),
    (0x0004, "meta-uuid"),
    (0x0008, "bigtime"),
    (0x0010, "needs-repair"),
    (0x0020, "nrext64"),
];

#[derive(Debug, Clone)]
pub struct XfsSuperblock {
    pub blocksize: u32,
    pub dblocks: u64,
    pub uuid: String,
    pub agblocks: u32,
    pub agcount: u32,
    pub versionnum: u16,
    pub sectsize: u16,
    pub inodesize: u16,
    pub fname: String,
    pub blocklog: u8,
    pub icount: u64,
    pub fdblocks: u64,
    pub features2: u32,
    pub features_ro_compat: u32,
    pub features_incompat: u32,
}

impl XfsSuperblock {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            blocksize: be_u32(buf, 4),
            dblocks: be_u64(buf, 8),
            uuid: format_uuid(buf.get(32..48).unwrap_or(&[])),
            agblocks: be_u32(buf, 84),
            agcount: be_u32(buf, 88),
            versionnum: be_u16(buf, 100),
            sectsize: be_u16(buf, 102),
            inodesize: be_u16(buf, 104),
            fname: ascii_field(buf.get(108..120).unwrap_or(&[])),
            blocklog: u8_at(buf, 120),
            icount: be_u64(buf, 128),
            fdblocks: be_u64(buf, 144),
            features2: be_u32(buf, 200),
            features_ro_compat: be_u32(buf, 212),
            features_incompat: be_u32(buf, 216),
        }
    }

    pub fn version(&self) -> u16 {
        self.versionnum & VERSION_MASK
    }

    pub fn validate(&self, raw: &[u8]) -> Result<()> {
        let bad = |reason: String| Err(RawscopeError::malformed("XFS", reason));
        if raw.get(0..4) != Some(&XFS_MAGIC[..]) {
            return bad("missing XFSB magic".into());
        }
        if !matches!(self.version(), 4 | 5) {
            return bad(format!("superblock version {}", self.version()));
        }
        if !is_power_of_two_in(self.blocksize as u64, 512, 65536) || 1u32 << self.blocklog.min(31) != self.blocksize {
            return bad(format!("block size {} (log {})", self.blocksize, self.blocklog));
        }
        if !is_power_of_two_in(self.sectsize as u64, 512, 32768) {
            return bad(format!("sector size {}", self.sectsize));
        }
        if self.agcount == 0 || self.agblocks == 0 || self.dblocks == 0 {
            return bad("empty allocation group geometry".into());
        }
        if self.dblocks > self.agcount as u64 * self.agblocks as u64 {
            return bad(format!(
                "{} data blocks exceed {} groups of {}",
                self.dblocks, self.agcount, self.agblocks
            ));
        }
        if self.fdblocks > self.dblocks {
            return bad(format!("{} free blocks of {}", self.fdblocks, self.dblocks));
        }
        Ok(())
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names = vec![format!("v{}", self.version())];
        names.extend(
            VERSION_NAMES
                .iter()
                .filter(|(bit, _)| self.versionnum & bit != 0)
                .map(|(_, name)| name.to_string()),
        );
        if self.versionnum & VERSION_MOREBITS != 0 {
            names.extend(
                FEATURES2_NAMES
                    .iter()
                    .filter(|(bit, _)| self.features2 & bit != 0)
                    .map(|(_, name)| name.to_string()),
            );
        }
        if self.version() == 5 {
            for (flags, table) in [
                (self.features_ro_compat, RO_COMPAT_NAMES),
                (self.features_incompat, INCOMPAT_NAMES),
            ] {
                names.extend(
                    table
                        .iter()
                        .filter(|(bit, _)| flags & bit != 0)
                        .map(|(_, name)| name.to_string()),
                );
            }
        }
        names
    }
}

pub struct XfsDetector;

impl FilesystemDetector for XfsDetector {
    fn detect(sample: &ProbeSample) -> Option<FsTag> {
        (sample.boot_sector.get(0..4) == Some(&XFS_MAGIC[..])).then_some(FsTag::Xfs)
    }
}

pub fn parse_info(device: &mut DeviceReader) -> Result<FilesystemInfo> {
    let raw = device.read_at(0, SUPERBLOCK_SIZE)?;
    let sb = XfsSuperblock::parse(&raw);
    sb.validate(&raw)?;
    log::debug!(
        "XFS v{}: {} groups of {} blocks, {} inodes of {} bytes",
        sb.version(),
        sb.agcount,
        sb.agblocks,
        sb.icount,
        sb.inodesize
    );

    FilesystemInfo::new(
        FsTag::Xfs,
        sb.fname.clone(),
        sb.blocksize,
        sb.dblocks,
        sb.fdblocks,
        sb.uuid.clone(),
        sb.feature_names().into_iter().collect(),
    )
}
