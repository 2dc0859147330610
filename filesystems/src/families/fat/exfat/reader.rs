// exFAT filesystem reader
// Directory entry sets, FAT chains and NoFatChain streams.

use super::ExFatBootSector;
use crate::device_reader::DeviceReader;
use crate::ops::{preview_len, CursorStep, NodeKind, Page, PageCursor, TreeWalker, WalkEntry};
use crate::utils::{le_u16, le_u32, le_u64};
use log::{debug, info};
use rawscope_core::{FsTag, RawscopeError, Result};
use std::collections::HashSet;
use std::ops::ControlFlow;

const ENTRY_SIZE: usize = 32;

// Entry types
const ENTRY_TYPE_END: u8 = 0x00;
const ENTRY_TYPE_ALLOCATION_BITMAP: u8 = 0x81;
const ENTRY_TYPE_VOLUME_LABEL: u8 = 0x83;
const ENTRY_TYPE_FILE: u8 = 0x85;
const ENTRY_TYPE_STREAM_EXTENSION: u8 = 0xC0;
const ENTRY_TYPE_FILE_NAME: u8 = 0xC1;
const IN_USE: u8 = 0x80;

const ATTR_DIRECTORY: u16 = 0x0010;
const FLAG_NO_FAT_CHAIN: u8 = 0x02;

const FAT_BAD: u32 = 0xFFFF_FFF7;
const FAT_END: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExFatNode {
    pub first_cluster: u32,
    pub contiguous: bool,
    /// Allocated length; 0 for the root, whose chain runs to end-of-chain.
    pub data_length: u64,
    pub valid_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExFatEntry {
    pub name: String,
    pub is_dir: bool,
    pub node: ExFatNode,
}

/// Volume-level entries found in the root directory.
#[derive(Debug, Default)]
pub struct RootMetadata {
    pub label: Option<String>,
    pub bitmap: Option<(u32, u64)>,
}

enum Item {
    Entry(ExFatEntry),
    Label(String),
    Bitmap { first_cluster: u32, length: u64 },
}

/// Accumulates a file entry set (file, stream extension, names).
struct PendingSet {
    remaining: u8,
    attributes: u16,
    stream: Option<(u8, usize, ExFatNode)>,
    name: Vec<u16>,
}

impl PendingSet {
    fn finish(self) -> Option<ExFatEntry> {
        let (_, name_len, node) = self.stream?;
        let units = &self.name[..name_len.min(self.name.len())];
        Some(ExFatEntry {
            name: String::from_utf16_lossy(units),
            is_dir: self.attributes & ATTR_DIRECTORY != 0,
            node,
        })
    }
}

#[derive(Default)]
struct EntryParser {
    pending: Option<PendingSet>,
}

impl EntryParser {
    /// `None` means the end-of-directory marker was reached.
    fn feed(&mut self, raw: &[u8]) -> Option<Option<Item>> {
        let kind = raw[0];
        if kind == ENTRY_TYPE_END {
            return None;
        }
        if kind & IN_USE == 0 {
            self.pending = None;
            return Some(None);
        }
        let secondary = kind & 0x40 != 0;
        if !secondary {
            self.pending = None;
        }
        let item = match kind {
            ENTRY_TYPE_VOLUME_LABEL => {
                let count = (raw[1] as usize).min(11);
                let units: Vec<u16> = (0..count).map(|i| le_u16(raw, 2 + i * 2)).collect();
                Some(Item::Label(String::from_utf16_lossy(&units)))
            }
            ENTRY_TYPE_ALLOCATION_BITMAP => Some(Item::Bitmap {
                first_cluster: le_u32(raw, 20),
                length: le_u64(raw, 24),
            }),
            ENTRY_TYPE_FILE => {
                self.pending = Some(PendingSet {
                    remaining: raw[1],
                    attributes: le_u16(raw, 4),
                    stream: None,
                    name: Vec::new(),
                });
                None
            }
            _ if secondary => self.secondary(kind, raw),
            _ => None,
        };
        Some(item)
    }

    fn secondary(&mut self, kind: u8, raw: &[u8]) -> Option<Item> {
        let set = self.pending.as_mut()?;
        match kind {
            ENTRY_TYPE_STREAM_EXTENSION if set.stream.is_none() => {
                let flags = raw[1];
                set.stream = Some((
                    flags,
                    raw[3] as usize,
                    ExFatNode {
                        first_cluster: le_u32(raw, 20),
                        contiguous: flags & FLAG_NO_FAT_CHAIN != 0,
                        data_length: le_u64(raw, 24),
                        valid_length: le_u64(raw, 8),
                    },
                ));
            }
            ENTRY_TYPE_FILE_NAME if set.stream.is_some() => {
                set.name.extend((0..15).map(|i| le_u16(raw, 2 + i * 2)));
            }
            // Vendor extensions and anything else only use up a slot.
            _ => {}
        }
        set.remaining = set.remaining.saturating_sub(1);
        if set.remaining == 0 {
            return self.pending.take().and_then(PendingSet::finish).map(Item::Entry);
        }
        None
    }
}

/// exFAT filesystem reader
pub struct ExFatReader<'a> {
    device: &'a mut DeviceReader,
    boot: ExFatBootSector,
}

impl<'a> ExFatReader<'a> {
    /// Open an exFAT filesystem for reading
    pub fn open(device: &'a mut DeviceReader) -> Result<Self> {
        let sector = device.read_at(0, 512)?;
        let boot = ExFatBootSector::parse(&sector)?;
        info!(
            "Opened exFAT on {} ({} byte clusters, {} clusters, root at {})",
            device.path(),
            boot.cluster_size(),
            boot.cluster_count,
            boot.first_cluster_of_root
        );
        Ok(Self { device, boot })
    }

    pub fn boot_sector(&self) -> &ExFatBootSector {
        &self.boot
    }

    fn root_node(&self) -> ExFatNode {
        ExFatNode {
            first_cluster: self.boot.first_cluster_of_root,
            contiguous: false,
            data_length: 0,
            valid_length: 0,
        }
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster < 2 || cluster > self.boot.cluster_count + 1 {
            return Err(RawscopeError::malformed("exFAT", format!("cluster {} out of range", cluster)));
        }
        Ok(())
    }

    /// Clusters of a stream, at most `max`.
    fn clusters(&mut self, node: &ExFatNode, max: usize) -> Result<Vec<u32>> {
        let cluster_size = self.boot.cluster_size();
        if node.contiguous {
            let count = (node.data_length.div_ceil(cluster_size) as usize).min(max);
            let chain: Vec<u32> = (0..count as u32).map(|i| node.first_cluster + i).collect();
            if let Some(&last) = chain.last() {
                self.check_cluster(node.first_cluster)?;
                self.check_cluster(last)?;
            }
            return Ok(chain);
        }

        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = node.first_cluster;
        while chain.len() < max {
            self.check_cluster(current)?;
            if !visited.insert(current) {
                return Err(RawscopeError::malformed("exFAT", format!("cluster chain loops at {}", current)));
            }
            chain.push(current);
            let raw = self.device.read_at(self.boot.fat_byte_offset() + current as u64 * 4, 4)?;
            match le_u32(&raw, 0) {
                FAT_END => break,
                FAT_BAD => {
                    return Err(RawscopeError::malformed("exFAT", format!("chain reaches bad cluster after {}", current)))
                }
                next => current = next,
            }
        }
        Ok(chain)
    }

    fn scan_dir<F>(&mut self, dir: &ExFatNode, mut visit: F) -> Result<()>
    where
        F: FnMut(Item) -> ControlFlow<()>,
    {
        let max = if dir.data_length == 0 {
            usize::MAX
        } else {
            dir.data_length.div_ceil(self.boot.cluster_size()) as usize
        };
        let chain = self.clusters(dir, max)?;
        let cluster_size = self.boot.cluster_size() as usize;
        let mut parser = EntryParser::default();

        'clusters: for cluster in chain {
            let data = self.device.read_at(self.boot.cluster_offset(cluster), cluster_size)?;
            for raw in data.chunks_exact(ENTRY_SIZE) {
                match parser.feed(raw) {
                    None => break 'clusters,
                    Some(Some(item)) => {
                        if visit(item).is_break() {
                            break 'clusters;
                        }
                    }
                    Some(None) => {}
                }
            }
        }
        Ok(())
    }

    /// Label and allocation bitmap location from the root directory.
    pub fn scan_root_metadata(&mut self) -> Result<RootMetadata> {
        let mut meta = RootMetadata::default();
        let root = self.root_node();
        self.scan_dir(&root, |item| {
            match item {
                Item::Label(label) if meta.label.is_none() => meta.label = Some(label),
                Item::Bitmap { first_cluster, length } if meta.bitmap.is_none() => {
                    meta.bitmap = Some((first_cluster, length))
                }
                _ => {}
            }
            ControlFlow::Continue(())
        })?;
        Ok(meta)
    }

    /// Count clear bits in the allocation bitmap.
    pub fn count_free_in_bitmap(&mut self, first_cluster: u32, length: u64) -> Result<u64> {
        let clusters = self.boot.cluster_count as u64;
        if length < clusters.div_ceil(8) {
            return Err(RawscopeError::malformed(
                "exFAT",
                format!("allocation bitmap of {} bytes covers fewer than {} clusters", length, clusters),
            ));
        }
        let node = ExFatNode {
            first_cluster,
            contiguous: false,
            data_length: length,
            valid_length: length,
        };
        let data = self.read_stream(&node, clusters.div_ceil(8) as usize)?;
        let used: u64 = data
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                let bits_here = (clusters - i as u64 * 8).min(8);
                let mask = if bits_here == 8 { 0xFF } else { (1u8 << bits_here) - 1 };
                (byte & mask).count_ones() as u64
            })
            .sum();
        Ok(clusters - used)
    }

    /// First `len` bytes of a stream; bytes past the valid length are zero.
    fn read_stream(&mut self, node: &ExFatNode, len: usize) -> Result<Vec<u8>> {
        if len == 0 || node.first_cluster == 0 {
            return Ok(Vec::new());
        }
        let cluster_size = self.boot.cluster_size();
        let count = (len as u64).div_ceil(cluster_size) as usize;
        let chain = self.clusters(node, count)?;

        let mut out = Vec::with_capacity(chain.len() * cluster_size as usize);
        let mut i = 0;
        while i < chain.len() {
            let mut run = 1;
            while i + run < chain.len() && chain[i + run] == chain[i] + run as u32 {
                run += 1;
            }
            let data = self
                .device
                .read_at(self.boot.cluster_offset(chain[i]), run * cluster_size as usize)?;
            out.extend_from_slice(&data);
            i += run;
        }
        out.truncate(len);
        if (node.valid_length as usize) < out.len() {
            out[node.valid_length as usize..].fill(0);
        }
        Ok(out)
    }

    fn walk_entry(entry: ExFatEntry) -> WalkEntry<ExFatNode> {
        WalkEntry {
            kind: if entry.is_dir { NodeKind::Directory } else { NodeKind::File },
            size: if entry.is_dir { 0 } else { entry.node.data_length },
            name: entry.name,
            node: entry.node,
        }
    }
}

impl TreeWalker for ExFatReader<'_> {
    type Node = ExFatNode;

    fn fs_type(&self) -> FsTag {
        FsTag::ExFat
    }

    fn case_insensitive(&self) -> bool {
        true
    }

    fn root(&mut self) -> Result<ExFatNode> {
        Ok(self.root_node())
    }

    fn children(&mut self, dir: &ExFatNode, skip: usize, take: usize) -> Result<Page<ExFatNode>> {
        let mut cursor = PageCursor::new(skip, take);
        let mut out = Vec::new();
        self.scan_dir(dir, |item| {
            let Item::Entry(entry) = item else {
                return ControlFlow::Continue(());
            };
            match cursor.step() {
                CursorStep::Skip => ControlFlow::Continue(()),
                CursorStep::Stop => ControlFlow::Break(()),
                CursorStep::Keep => {
                    out.push(Self::walk_entry(entry));
                    ControlFlow::Continue(())
                }
            }
        })?;
        Ok(cursor.finish(out))
    }

    fn find_child(&mut self, dir: &ExFatNode, name: &str) -> Result<Option<WalkEntry<ExFatNode>>> {
        let wanted = name.to_lowercase();
        let mut hit = None;
        self.scan_dir(dir, |item| match item {
            Item::Entry(entry) if entry.name == name || entry.name.to_lowercase() == wanted => {
                hit = Some(entry);
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        })?;
        Ok(hit.map(Self::walk_entry))
    }

    fn read_file(&mut self, node: &ExFatNode, _kind: NodeKind, limit: usize) -> Result<Vec<u8>> {
        let len = preview_len(node.data_length, limit);
        debug!("Reading {} bytes from exFAT cluster {}", len, node.first_cluster);
        self.read_stream(node, len)
    }
}
