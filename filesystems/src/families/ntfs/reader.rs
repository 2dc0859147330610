// NTFS reader
// Maps the MFT through its own $DATA runs and walks $I30 indexes.

use super::boot::NtfsBootSector;
use super::index::{parse_index_block, parse_index_root, IndexEntry, FILE_NAME_DOS};
use super::mft::*;
use crate::device_reader::DeviceReader;
use crate::ops::{preview_len, CursorStep, NodeKind, Page, PageCursor, TreeWalker, WalkEntry};
use crate::utils::utf16le_to_string;
use log::{debug, info, trace, warn};
use rawscope_core::{FsTag, RawscopeError, Result};
use std::collections::HashSet;

pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_VOLUME: u64 = 3;
pub const MFT_RECORD_ROOT: u64 = 5;
pub const MFT_RECORD_BITMAP: u64 = 6;
/// Records below this are filesystem metafiles ($MFT, $LogFile, $Extend, ...).
pub const FIRST_USER_RECORD: u64 = 16;

const INDEX_NAME: &str = "$I30";
const VOLUME_DIRTY: u16 = 0x0001;

#[derive(Debug, Clone, Default)]
pub struct VolumeMetadata {
    pub label: String,
    pub version: Option<(u8, u8)>,
    pub dirty: bool,
}

pub struct NtfsReader<'a> {
    device: &'a mut DeviceReader,
    boot: NtfsBootSector,
    mft_runs: Vec<DataRun>,
    mft_size: u64,
}

impl<'a> NtfsReader<'a> {
    pub fn open(device: &'a mut DeviceReader) -> Result<Self> {
        let sector = device.read_at(0, 512)?;
        let boot = NtfsBootSector::parse(&sector)?;
        let cluster_size = boot.cluster_size();

        // Record 0 describes the MFT itself; read it straight from mft_lcn,
        // or from the $MFTMirr copy when the primary is torn.
        let mft_record = match first_record(device, &boot, boot.mft_lcn) {
            Ok(record) => record,
            Err(primary) if boot.mft_mirror_lcn != 0 && boot.mft_mirror_lcn < boot.total_clusters() => {
                warn!(
                    "$MFT record 0 at cluster {} unusable ({}); trying $MFTMirr at cluster {}",
                    boot.mft_lcn, primary, boot.mft_mirror_lcn
                );
                first_record(device, &boot, boot.mft_mirror_lcn).map_err(|_| primary)?
            }
            Err(e) => return Err(e),
        };
        let data = mft_record
            .find(ATTR_DATA, "")
            .ok_or_else(|| RawscopeError::malformed("NTFS", "$MFT has no $DATA attribute"))?;
        let (mft_runs, mft_size) = match &data.body {
            AttrBody::NonResident { runs, real_size, .. } => (runs.clone(), *real_size),
            AttrBody::Resident(_) => return Err(RawscopeError::malformed("NTFS", "$MFT $DATA is resident")),
        };
        if mft_record.has(ATTR_ATTRIBUTE_LIST) {
            warn!("$MFT has an attribute list; records past the first extent may be unreachable");
        }

        info!(
            "Opened NTFS on {} ({} byte clusters, {} byte records, {} MFT records)",
            device.path(),
            cluster_size,
            boot.record_size,
            mft_size / boot.record_size as u64
        );
        Ok(Self {
            device,
            boot,
            mft_runs,
            mft_size,
        })
    }

    pub fn boot_sector(&self) -> &NtfsBootSector {
        &self.boot
    }

    /// Read `len` bytes at byte `offset` of a run list. Sparse runs and
    /// anything past the runs read as zeros.
    fn read_runs(&mut self, runs: &[DataRun], offset: u64, len: usize) -> Result<Vec<u8>> {
        let cluster_size = self.boot.cluster_size();
        let total_clusters = self.boot.total_clusters();
        let mut out = vec![0u8; len];
        let end = offset.saturating_add(len as u64);
        let out_of_range = |run: &DataRun| {
            RawscopeError::malformed(
                "NTFS",
                format!("data run at VCN {} (+{} clusters) leaves the volume", run.vcn, run.length),
            )
        };

        for run in runs {
            let run_start = run.vcn.checked_mul(cluster_size).ok_or_else(|| out_of_range(run))?;
            let run_end = run
                .vcn
                .checked_add(run.length)
                .and_then(|c| c.checked_mul(cluster_size))
                .ok_or_else(|| out_of_range(run))?;
            let from = run_start.max(offset);
            let to = run_end.min(end);
            if from >= to {
                continue;
            }
            let Some(lcn) = run.lcn else {
                continue;
            };
            if lcn.checked_add(run.length).map_or(true, |last| last > total_clusters) {
                return Err(out_of_range(run));
            }
            let device_offset = lcn
                .checked_mul(cluster_size)
                .and_then(|o| o.checked_add(from - run_start))
                .ok_or_else(|| out_of_range(run))?;
            let data = self.device.read_at(device_offset, (to - from) as usize)?;
            let at = (from - offset) as usize;
            out[at..at + data.len()].copy_from_slice(&data);
        }
        Ok(out)
    }

    pub fn read_record(&mut self, number: u64) -> Result<MftRecord> {
        let size = self.boot.record_size as u64;
        let record_end = number.checked_add(1).and_then(|n| n.checked_mul(size));
        if record_end.map_or(true, |end| end > self.mft_size) {
            return Err(RawscopeError::malformed(
                "NTFS",
                format!("MFT record {} beyond the MFT ({} bytes)", number, self.mft_size),
            ));
        }
        let runs = self.mft_runs.clone();
        let raw = self.read_runs(&runs, number * size, size as usize)?;
        MftRecord::parse(number, raw)
    }

    /// Value of an attribute, at most `limit` bytes. Bytes past the
    /// initialized size read as zeros.
    pub fn read_attribute(&mut self, record: u64, attr: &Attribute, limit: usize) -> Result<Vec<u8>> {
        if attr.is_encrypted() {
            return Err(RawscopeError::NotSupported(format!("record {} data is encrypted", record)));
        }
        if attr.is_compressed() {
            return Err(RawscopeError::NotSupported(format!("record {} data is compressed", record)));
        }
        match &attr.body {
            AttrBody::Resident(value) => Ok(value[..preview_len(value.len() as u64, limit)].to_vec()),
            AttrBody::NonResident {
                runs,
                start_vcn,
                real_size,
                initialized_size,
                ..
            } => {
                if *start_vcn != 0 {
                    return Err(RawscopeError::NotSupported(format!(
                        "record {} holds a partial data extent",
                        record
                    )));
                }
                let len = preview_len(*real_size, limit);
                let mut data = self.read_runs(runs, 0, len)?;
                if (*initialized_size as usize) < data.len() {
                    data[*initialized_size as usize..].fill(0);
                }
                Ok(data)
            }
        }
    }

    /// The unnamed `$DATA` attribute, or `NotSupported` when it lives in an
    /// extension record behind an attribute list.
    fn data_attribute<'r>(&self, record: &'r MftRecord) -> Result<&'r Attribute> {
        match record.find(ATTR_DATA, "") {
            Some(attr) => Ok(attr),
            None if record.has(ATTR_ATTRIBUTE_LIST) => Err(RawscopeError::NotSupported(format!(
                "record {} keeps $DATA behind an attribute list",
                record.number
            ))),
            None => Err(RawscopeError::malformed(
                "NTFS",
                format!("record {} has no $DATA attribute", record.number),
            )),
        }
    }

    pub fn volume_metadata(&mut self) -> Result<VolumeMetadata> {
        let record = self.read_record(MFT_RECORD_VOLUME)?;
        let label = record
            .find(ATTR_VOLUME_NAME, "")
            .and_then(Attribute::resident_value)
            .map(utf16le_to_string)
            .unwrap_or_default();
        let info = record.find(ATTR_VOLUME_INFORMATION, "").and_then(Attribute::resident_value);
        Ok(VolumeMetadata {
            label,
            version: info.filter(|v| v.len() >= 10).map(|v| (v[8], v[9])),
            dirty: info
                .filter(|v| v.len() >= 12)
                .map(|v| u16::from_le_bytes([v[10], v[11]]) & VOLUME_DIRTY != 0)
                .unwrap_or(false),
        })
    }

    /// Free clusters counted from `$Bitmap`.
    pub fn count_free_clusters(&mut self) -> Result<u64> {
        let record = self.read_record(MFT_RECORD_BITMAP)?;
        let attr = self.data_attribute(&record)?.clone();
        let clusters = self.boot.total_clusters();
        let bytes = clusters.div_ceil(8) as usize;
        if attr.value_size() < bytes as u64 {
            return Err(RawscopeError::malformed(
                "NTFS",
                format!("$Bitmap of {} bytes covers fewer than {} clusters", attr.value_size(), clusters),
            ));
        }
        let bitmap = self.read_attribute(MFT_RECORD_BITMAP, &attr, bytes)?;
        let used: u64 = bitmap
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                let bits = (clusters - i as u64 * 8).min(8);
                let mask = if bits == 8 { 0xFF } else { (1u8 << bits) - 1 };
                (byte & mask).count_ones() as u64
            })
            .sum();
        Ok(clusters - used)
    }

    /// Every visible child of a directory record, sorted by name.
    fn directory_entries(&mut self, dir: u64) -> Result<Vec<IndexEntry>> {
        let record = self.read_record(dir)?;
        if !record.in_use() {
            return Err(RawscopeError::malformed("NTFS", format!("record {} is not in use", dir)));
        }
        if !record.is_directory() {
            return Err(RawscopeError::NotADirectory(format!("MFT record {}", dir)));
        }

        let mut raw_entries = Vec::new();
        let root = record
            .find(ATTR_INDEX_ROOT, INDEX_NAME)
            .and_then(Attribute::resident_value)
            .ok_or_else(|| RawscopeError::malformed("NTFS", format!("directory {} has no $I30 root", dir)))?;
        parse_index_root(root, &mut raw_entries)?;

        if let Some(alloc) = record.find(ATTR_INDEX_ALLOCATION, INDEX_NAME).cloned() {
            let block_size = self.boot.index_block_size as u64;
            let AttrBody::NonResident { runs, .. } = &alloc.body else {
                return Err(RawscopeError::malformed("NTFS", "resident $INDEX_ALLOCATION"));
            };
            let mapped = runs
                .iter()
                .map(|r| r.vcn.saturating_add(r.length))
                .max()
                .unwrap_or(0)
                .saturating_mul(self.boot.cluster_size());
            let total = alloc.value_size().min(mapped);
            let blocks = total / block_size;

            // Freed blocks keep their old entries; only blocks marked in
            // $BITMAP:$I30 are live.
            let bitmap = match record.find(ATTR_BITMAP, INDEX_NAME).cloned() {
                Some(attr) => Some(self.read_attribute(dir, &attr, blocks.div_ceil(8) as usize)?),
                None => {
                    debug!("Directory {} has no $I30 bitmap; reading every index block", dir);
                    None
                }
            };
            for block_index in 0..blocks {
                let in_use = bitmap.as_ref().map_or(true, |bits| {
                    bits.get((block_index / 8) as usize)
                        .is_some_and(|byte| byte & (1 << (block_index % 8)) != 0)
                });
                if !in_use {
                    trace!("Skipping free index block {} of directory {}", block_index, dir);
                    continue;
                }
                let block = self.read_runs(runs, block_index * block_size, block_size as usize)?;
                parse_index_block(block, &mut raw_entries)?;
            }
        }

        // Hard links show up once per name; DOS aliases are dropped.
        let mut seen = HashSet::new();
        let mut entries: Vec<IndexEntry> = raw_entries
            .into_iter()
            .filter(|e| e.namespace != FILE_NAME_DOS && e.mft_reference >= FIRST_USER_RECORD)
            .filter(|e| seen.insert((e.mft_reference, e.file_name.clone())))
            .collect();
        entries.sort_by(|a, b| {
            a.file_name
                .to_uppercase()
                .cmp(&b.file_name.to_uppercase())
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        debug!("NTFS directory {} has {} visible entries", dir, entries.len());
        Ok(entries)
    }

    /// The entry's record, unless it was freed or reused since the index
    /// entry was written.
    fn live_entry(&mut self, entry: IndexEntry) -> Result<Option<WalkEntry<u64>>> {
        let record = self.read_record(entry.mft_reference)?;
        if !record.in_use() || (entry.sequence != 0 && entry.sequence != record.sequence) {
            debug!(
                "Index entry {:?} refers to record {} (sequence {}), now {} with sequence {}",
                entry.file_name,
                entry.mft_reference,
                entry.sequence,
                if record.in_use() { "in use" } else { "free" },
                record.sequence
            );
            return Ok(None);
        }
        let is_dir = record.is_directory();
        let size = if is_dir {
            0
        } else {
            match record.find(ATTR_DATA, "") {
                Some(attr) => attr.value_size(),
                None => entry.real_size,
            }
        };
        Ok(Some(WalkEntry {
            name: entry.file_name,
            kind: if is_dir { NodeKind::Directory } else { NodeKind::File },
            size,
            node: entry.mft_reference,
        }))
    }
}

fn first_record(device: &mut DeviceReader, boot: &NtfsBootSector, lcn: u64) -> Result<MftRecord> {
    let offset = lcn
        .checked_mul(boot.cluster_size())
        .ok_or_else(|| RawscopeError::malformed("NTFS", format!("cluster {} has no byte offset", lcn)))?;
    let raw = device.read_at(offset, boot.record_size as usize)?;
    MftRecord::parse(MFT_RECORD_MFT, raw)
}

impl TreeWalker for NtfsReader<'_> {
    type Node = u64;

    fn fs_type(&self) -> FsTag {
        FsTag::Ntfs
    }

    fn case_insensitive(&self) -> bool {
        true
    }

    fn root(&mut self) -> Result<u64> {
        Ok(MFT_RECORD_ROOT)
    }

    fn children(&mut self, dir: &u64, skip: usize, take: usize) -> Result<Page<u64>> {
        let mut cursor = PageCursor::new(skip, take);
        let mut out = Vec::new();
        // Stale entries must not count towards the page offsets.
        for entry in self.directory_entries(*dir)? {
            let Some(walked) = self.live_entry(entry)? else {
                continue;
            };
            match cursor.step() {
                CursorStep::Skip => continue,
                CursorStep::Stop => break,
                CursorStep::Keep => out.push(walked),
            }
        }
        Ok(cursor.finish(out))
    }

    fn find_child(&mut self, dir: &u64, name: &str) -> Result<Option<WalkEntry<u64>>> {
        let wanted = name.to_uppercase();
        for entry in self.directory_entries(*dir)? {
            if entry.file_name != name && entry.file_name.to_uppercase() != wanted {
                continue;
            }
            if let Some(walked) = self.live_entry(entry)? {
                return Ok(Some(walked));
            }
        }
        Ok(None)
    }

    fn read_file(&mut self, node: &u64, _kind: NodeKind, limit: usize) -> Result<Vec<u8>> {
        let record = self.read_record(*node)?;
        let attr = self.data_attribute(&record)?.clone();
        debug!("Reading up to {} bytes of MFT record {}", limit, node);
        self.read_attribute(*node, &attr, limit)
    }
}
