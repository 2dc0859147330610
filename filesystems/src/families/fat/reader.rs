// FAT12/16/32 reader
// Walks directories through the FAT without any OS driver.

use super::boot::{fsinfo_free_clusters, FatBootSector};
use super::dir::{decode_slot, FatDirEntry, LfnParser, Slot, DIR_ENTRY_SIZE};
use super::table::FatTable;
use crate::device_reader::DeviceReader;
use crate::ops::{preview_len, CursorStep, NodeKind, Page, PageCursor, TreeWalker, WalkEntry};
use log::{debug, info};
use rawscope_core::{FsTag, Result};
use std::ops::ControlFlow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatNode {
    /// The FAT12/16 root directory region between the FATs and the data area.
    FixedRoot,
    Chain { first_cluster: u32, size: u32 },
}

pub struct FatReader<'a> {
    device: &'a mut DeviceReader,
    boot: FatBootSector,
    table: FatTable,
}

impl<'a> FatReader<'a> {
    pub fn open(device: &'a mut DeviceReader) -> Result<Self> {
        let sector = device.read_at(0, 512)?;
        let boot = FatBootSector::parse(&sector)?;
        info!(
            "Opened {} on {} ({} byte clusters, {} clusters)",
            boot.fat_type,
            device.path(),
            boot.cluster_size(),
            boot.cluster_count()
        );
        Ok(Self {
            table: FatTable::new(&boot),
            device,
            boot,
        })
    }

    pub fn boot_sector(&self) -> &FatBootSector {
        &self.boot
    }

    fn is_fat32(&self) -> bool {
        self.boot.fat_type == FsTag::Fat32
    }

    fn root_node(&self) -> FatNode {
        if self.is_fat32() {
            FatNode::Chain {
                first_cluster: self.boot.root_cluster,
                size: 0,
            }
        } else {
            FatNode::FixedRoot
        }
    }

    fn node_for(&self, entry: &FatDirEntry) -> FatNode {
        // A directory pointing at cluster 0 means the root.
        if entry.is_dir && entry.first_cluster == 0 {
            self.root_node()
        } else {
            FatNode::Chain {
                first_cluster: entry.first_cluster,
                size: entry.size,
            }
        }
    }

    /// Read up to `max` clusters of a chain, coalescing contiguous runs.
    fn read_chain(&mut self, first_cluster: u32, max: Option<usize>) -> Result<Vec<u8>> {
        let chain = self.table.chain(self.device, first_cluster, max)?;
        let cluster_size = self.boot.cluster_size();
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
        Ok(out)
    }

    /// Visit the directory's slots in on-disk order until `visit` breaks or
    /// the end marker appears.
    fn scan_dir<F>(&mut self, node: &FatNode, mut visit: F) -> Result<()>
    where
        F: FnMut(Slot) -> ControlFlow<()>,
    {
        let fat32 = self.is_fat32();
        let mut lfn = LfnParser::new();
        let mut feed = |buf: &[u8]| -> ControlFlow<()> {
            for raw in buf.chunks_exact(DIR_ENTRY_SIZE) {
                match decode_slot(raw, &mut lfn, fat32) {
                    Slot::End => return ControlFlow::Break(()),
                    slot => {
                        if visit(slot).is_break() {
                            return ControlFlow::Break(());
                        }
                    }
                }
            }
            ControlFlow::Continue(())
        };

        match node {
            FatNode::FixedRoot => {
                let len = self.boot.root_entries as usize * DIR_ENTRY_SIZE;
                let region = self.device.read_at(self.boot.root_dir_offset(), len)?;
                let _ = feed(&region);
            }
            FatNode::Chain { first_cluster, .. } => {
                let chain = self.table.chain(self.device, *first_cluster, None)?;
                let cluster_size = self.boot.cluster_size() as usize;
                for cluster in chain {
                    let data = self.device.read_at(self.boot.cluster_offset(cluster), cluster_size)?;
                    if feed(&data).is_break() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// The label stored as a volume-ID entry in the root directory.
    pub fn root_volume_label(&mut self) -> Result<Option<String>> {
        let mut label = None;
        let root = self.root_node();
        self.scan_dir(&root, |slot| match slot {
            Slot::VolumeLabel(name) => {
                label = Some(name);
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        })?;
        Ok(label)
    }

    /// Free-cluster count recorded in the FAT32 FSInfo sector.
    pub fn fsinfo_free_hint(&mut self) -> Result<Option<u64>> {
        let sector = self.boot.fs_info_sector;
        if self.boot.fat_type != FsTag::Fat32 || sector == 0 || sector == 0xFFFF {
            return Ok(None);
        }
        let raw = self.device.read_at(sector as u64 * self.boot.bytes_per_sector as u64, 512)?;
        Ok(fsinfo_free_clusters(&raw, self.boot.cluster_count()))
    }

    pub fn count_free_clusters(&mut self) -> Result<u64> {
        self.table.count_free(self.device)
    }

    fn walk_entry(&self, entry: FatDirEntry) -> WalkEntry<FatNode> {
        WalkEntry {
            kind: if entry.is_dir { NodeKind::Directory } else { NodeKind::File },
            size: if entry.is_dir { 0 } else { entry.size as u64 },
            node: self.node_for(&entry),
            name: entry.name,
        }
    }
}

impl TreeWalker for FatReader<'_> {
    type Node = FatNode;

    fn fs_type(&self) -> FsTag {
        self.boot.fat_type
    }

    fn case_insensitive(&self) -> bool {
        true
    }

    fn root(&mut self) -> Result<FatNode> {
        Ok(self.root_node())
    }

    fn children(&mut self, dir: &FatNode, skip: usize, take: usize) -> Result<Page<FatNode>> {
        let mut cursor = PageCursor::new(skip, take);
        let mut found = Vec::new();
        self.scan_dir(dir, |slot| {
            let Slot::Entry(entry) = slot else {
                return ControlFlow::Continue(());
            };
            match cursor.step() {
                CursorStep::Skip => ControlFlow::Continue(()),
                CursorStep::Stop => ControlFlow::Break(()),
                CursorStep::Keep => {
                    found.push(entry);
                    ControlFlow::Continue(())
                }
            }
        })?;
        let entries = found.into_iter().map(|e| self.walk_entry(e)).collect();
        Ok(cursor.finish(entries))
    }

    fn find_child(&mut self, dir: &FatNode, name: &str) -> Result<Option<WalkEntry<FatNode>>> {
        let wanted = name.to_lowercase();
        let mut hit = None;
        self.scan_dir(dir, |slot| match slot {
            Slot::Entry(entry) if entry.name == name || entry.name.to_lowercase() == wanted => {
                hit = Some(entry);
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        })?;
        Ok(hit.map(|e| self.walk_entry(e)))
    }

    fn read_file(&mut self, node: &FatNode, _kind: NodeKind, limit: usize) -> Result<Vec<u8>> {
        let FatNode::Chain { first_cluster, size } = *node else {
            return Ok(Vec::new());
        };
        let len = preview_len(size as u64, limit);
        if len == 0 || first_cluster == 0 {
            return Ok(Vec::new());
        }
        let clusters = (len as u64).div_ceil(self.boot.cluster_size()) as usize;
        debug!("Reading {} bytes from cluster {} ({} clusters)", len, first_cluster, clusters);
        let mut data = self.read_chain(first_cluster, Some(clusters))?;
        data.truncate(len);
        Ok(data)
    }
}
