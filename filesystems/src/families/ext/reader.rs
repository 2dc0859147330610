// Ext filesystem reader - supports ext2/ext3/ext4
// Walks inodes, extent trees and classic block maps straight from the device.

use super::superblock::*;
use crate::device_reader::DeviceReader;
use crate::ops::{preview_len, CursorStep, NodeKind, Page, PageCursor, TreeWalker, WalkEntry};
use crate::utils::{le_u16, le_u32};
use log::{debug, info};
use rawscope_core::{FsTag, RawscopeError, Result};
use std::collections::HashMap;

pub const ROOT_INODE: u32 = 2;

const EXTENT_MAGIC: u16 = 0xF30A;
const MAX_EXTENT_DEPTH: u16 = 5;
const MAX_EXTENTS: usize = 1 << 16;

const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;
const EXT4_ENCRYPT_FL: u32 = 0x0000_0800;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;
const S_IFLNK: u16 = 0xA000;

#[derive(Debug, Clone)]
pub struct Inode {
    pub number: u32,
    pub mode: u16,
    pub size: u64,
    pub flags: u32,
    pub block: [u8; 60],
}

impl Inode {
    fn parse(number: u32, buf: &[u8]) -> Self {
        let mut block = [0u8; 60];
        if let Some(src) = buf.get(0x28..0x28 + 60) {
            block.copy_from_slice(src);
        }
        Self {
            number,
            mode: le_u16(buf, 0x00),
            size: le_u32(buf, 0x04) as u64 | (le_u32(buf, 0x6C) as u64) << 32,
            flags: le_u32(buf, 0x20),
            block,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.mode & S_IFMT {
            S_IFDIR => NodeKind::Directory,
            S_IFREG => NodeKind::File,
            S_IFLNK => NodeKind::Symlink,
            _ => NodeKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    logical: u64,
    len: u64,
    physical: u64,
    uninit: bool,
}

/// How an inode's logical blocks map onto the device.
enum FileMap {
    Extents(Vec<Extent>),
    Blocks([u32; 15]),
    Inline(Vec<u8>),
}

#[derive(Debug, Clone)]
struct RawDirent {
    inode: u32,
    name: String,
}

/// Ext filesystem reader
pub struct ExtReader<'a> {
    device: &'a mut DeviceReader,
    superblock: ExtSuperblock,
    block_size: u64,
    version: FsTag,
}

impl<'a> ExtReader<'a> {
    /// Open an ext filesystem for reading
    pub fn open(device: &'a mut DeviceReader) -> Result<Self> {
        let raw = device.read_at(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        let superblock = ExtSuperblock::parse(&raw);
        superblock.validate()?;

        let version = superblock.version();
        if superblock.has_incompat(INCOMPAT_JOURNAL_DEV) {
            return Err(RawscopeError::NotSupported(
                "external ext journal device has no file tree".into(),
            ));
        }
        if superblock.has_incompat(INCOMPAT_COMPRESSION) {
            return Err(RawscopeError::NotSupported(format!("{} compression", version)));
        }
        info!(
            "Opened {} on {} ({} byte blocks, {} groups)",
            version,
            device.path(),
            superblock.block_size(),
            superblock.group_count()
        );

        Ok(Self {
            block_size: superblock.block_size(),
            device,
            superblock,
            version,
        })
    }

    fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        if block >= self.superblock.blocks_count {
            return Err(RawscopeError::malformed(
                self.version.as_str(),
                format!("block {} beyond volume end ({} blocks)", block, self.superblock.blocks_count),
            ));
        }
        let offset = block.checked_mul(self.block_size).ok_or_else(|| {
            RawscopeError::malformed(self.version.as_str(), format!("block {} has no byte offset", block))
        })?;
        self.device.read_at(offset, self.block_size as usize)
    }

    fn group_has_superblock(&self, group: u64) -> bool {
        if self.superblock.feature_ro_compat & RO_COMPAT_SPARSE_SUPER == 0 || group <= 1 {
            return true;
        }
        [3u64, 5, 7].iter().any(|&base| {
            let mut n = base;
            while n < group {
                n *= base;
            }
            n == group
        })
    }

    fn descriptor_offset(&self, group: u64) -> u64 {
        let sb = &self.superblock;
        let desc_size = sb.desc_size();
        let per_block = self.block_size / desc_size;
        let meta_group = group / per_block;

        if sb.has_incompat(INCOMPAT_META_BG) && meta_group >= sb.first_meta_bg as u64 {
            let first = meta_group * per_block;
            let group_start = sb.first_data_block as u64 + first * sb.blocks_per_group as u64;
            let block = group_start + u64::from(self.group_has_superblock(first));
            block * self.block_size + (group % per_block) * desc_size
        } else {
            (sb.first_data_block as u64 + 1) * self.block_size + group * desc_size
        }
    }

    fn inode_table(&mut self, group: u64) -> Result<u64> {
        if group >= self.superblock.group_count() {
            return Err(RawscopeError::malformed(
                self.version.as_str(),
                format!("group {} out of range", group),
            ));
        }
        let desc_size = self.superblock.desc_size();
        let desc = self.device.read_at(self.descriptor_offset(group), desc_size as usize)?;
        let mut table = le_u32(&desc, 0x08) as u64;
        if desc_size >= 64 {
            table |= (le_u32(&desc, 0x28) as u64) << 32;
        }
        Ok(table)
    }

    /// Read an inode by number
    pub fn read_inode(&mut self, number: u32) -> Result<Inode> {
        if number == 0 || number > self.superblock.inodes_count {
            return Err(RawscopeError::malformed(
                self.version.as_str(),
                format!("inode {} out of range", number),
            ));
        }
        let ipg = self.superblock.inodes_per_group as u64;
        let group = (number as u64 - 1) / ipg;
        let index = (number as u64 - 1) % ipg;
        let table = self.inode_table(group)?;
        let inode_size = self.superblock.inode_size();
        let offset = table * self.block_size + index * inode_size;
        let raw = self.device.read_at(offset, inode_size as usize)?;
        Ok(Inode::parse(number, &raw))
    }

    fn file_map(&mut self, inode: &Inode) -> Result<FileMap> {
        if inode.flags & EXT4_INLINE_DATA_FL != 0 {
            return Ok(FileMap::Inline(inode.block.to_vec()));
        }
        if inode.kind() == NodeKind::Symlink && inode.flags & EXT4_EXTENTS_FL == 0 && inode.size < 60 {
            return Ok(FileMap::Inline(inode.block.to_vec()));
        }
        if inode.flags & EXT4_EXTENTS_FL != 0 {
            let mut extents = Vec::new();
            let root = inode.block;
            self.collect_extents(&root, MAX_EXTENT_DEPTH, &mut extents)?;
            extents.sort_by_key(|e| e.logical);
            return Ok(FileMap::Extents(extents));
        }
        let mut pointers = [0u32; 15];
        for (i, p) in pointers.iter_mut().enumerate() {
            *p = le_u32(&inode.block, i * 4);
        }
        Ok(FileMap::Blocks(pointers))
    }

    fn collect_extents(&mut self, node: &[u8], budget: u16, out: &mut Vec<Extent>) -> Result<()> {
        let fs = self.version.as_str();
        if le_u16(node, 0) != EXTENT_MAGIC {
            return Err(RawscopeError::malformed(fs, format!("extent header magic {:#06x}", le_u16(node, 0))));
        }
        let entries = le_u16(node, 2) as usize;
        let depth = le_u16(node, 6);
        if depth > budget {
            return Err(RawscopeError::malformed(fs, format!("extent tree depth {} too deep", depth)));
        }
        if 12 + entries * 12 > node.len() {
            return Err(RawscopeError::malformed(fs, format!("{} extent entries overflow node", entries)));
        }

        for i in 0..entries {
            let base = 12 + i * 12;
            if depth == 0 {
                let raw_len = le_u16(node, base + 4) as u64;
                let uninit = raw_len > 32768;
                out.push(Extent {
                    logical: le_u32(node, base) as u64,
                    len: if uninit { raw_len - 32768 } else { raw_len },
                    physical: (le_u16(node, base + 6) as u64) << 32 | le_u32(node, base + 8) as u64,
                    uninit,
                });
                if out.len() > MAX_EXTENTS {
                    return Err(RawscopeError::malformed(fs, "extent tree too large"));
                }
            } else {
                let leaf = le_u32(node, base + 4) as u64 | (le_u16(node, base + 8) as u64) << 32;
                let child = self.read_block(leaf)?;
                if le_u16(&child, 6) >= depth {
                    return Err(RawscopeError::malformed(fs, "extent tree depth does not decrease"));
                }
                self.collect_extents(&child, depth - 1, out)?;
            }
        }
        Ok(())
    }

    fn map_indirect(
        &mut self,
        pointers: &[u32; 15],
        logical: u64,
        cache: &mut HashMap<u64, Vec<u8>>,
    ) -> Result<Option<u64>> {
        let per_block = self.block_size / 4;
        if logical < 12 {
            return Ok(Some(pointers[logical as usize] as u64).filter(|&b| b != 0));
        }
        let mut rest = logical - 12;
        let (start, path) = if rest < per_block {
            (pointers[12], vec![rest])
        } else {
            rest -= per_block;
            if rest < per_block * per_block {
                (pointers[13], vec![rest / per_block, rest % per_block])
            } else {
                rest -= per_block * per_block;
                if rest >= per_block * per_block * per_block {
                    return Ok(None);
                }
                (
                    pointers[14],
                    vec![rest / (per_block * per_block), (rest / per_block) % per_block, rest % per_block],
                )
            }
        };

        let mut block = start as u64;
        for index in path {
            if block == 0 {
                return Ok(None);
            }
            if !cache.contains_key(&block) {
                let data = self.read_block(block)?;
                cache.insert(block, data);
            }
            block = cache.get(&block).map(|data| le_u32(data, index as usize * 4)).unwrap_or(0) as u64;
        }
        Ok(Some(block).filter(|&b| b != 0))
    }

    /// Read `len` bytes at `offset` of a file. Holes and uninitialized
    /// extents read as zeros.
    fn read_range(&mut self, inode: &Inode, map: &FileMap, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = (offset + len as u64).min(inode.size);
        if end <= offset {
            return Ok(Vec::new());
        }
        let mut out = vec![0u8; (end - offset) as usize];
        let bs = self.block_size;

        match map {
            FileMap::Inline(data) => {
                if end > data.len() as u64 {
                    return Err(RawscopeError::NotSupported(format!(
                        "inode {} keeps inline data past {} bytes in an extended attribute",
                        inode.number,
                        data.len()
                    )));
                }
                out.copy_from_slice(&data[offset as usize..end as usize]);
            }
            FileMap::Extents(extents) => {
                for extent in extents.iter().filter(|e| !e.uninit) {
                    let ext_start = extent.logical * bs;
                    let ext_end = (extent.logical + extent.len) * bs;
                    let from = ext_start.max(offset);
                    let to = ext_end.min(end);
                    if from >= to {
                        continue;
                    }
                    let skip = from - ext_start;
                    let past_end = || {
                        RawscopeError::malformed(
                            self.version.as_str(),
                            format!("extent of inode {} points past the volume end", inode.number),
                        )
                    };
                    let last_block = extent
                        .physical
                        .checked_add((skip + (to - from)).div_ceil(bs))
                        .ok_or_else(past_end)?;
                    if last_block > self.superblock.blocks_count {
                        return Err(past_end());
                    }
                    let device_offset = extent
                        .physical
                        .checked_mul(bs)
                        .and_then(|o| o.checked_add(skip))
                        .ok_or_else(past_end)?;
                    let data = self.device.read_at(device_offset, (to - from) as usize)?;
                    let at = (from - offset) as usize;
                    out[at..at + data.len()].copy_from_slice(&data);
                }
            }
            FileMap::Blocks(pointers) => {
                let mut cache = HashMap::new();
                let first = offset / bs;
                let last = (end - 1) / bs;
                for logical in first..=last {
                    let Some(physical) = self.map_indirect(pointers, logical, &mut cache)? else {
                        continue;
                    };
                    let block = self.read_block(physical)?;
                    let block_start = logical * bs;
                    let from = block_start.max(offset);
                    let to = (block_start + bs).min(end);
                    let at = (from - offset) as usize;
                    out[at..at + (to - from) as usize]
                        .copy_from_slice(&block[(from - block_start) as usize..(to - block_start) as usize]);
                }
            }
        }
        Ok(out)
    }

    /// Directory contents chunked by block (or the inline area).
    fn dir_chunks(&mut self, dir: &Inode) -> Result<(FileMap, Vec<(u64, usize)>)> {
        let map = self.file_map(dir)?;
        let chunks = match &map {
            // Inline directories start with the parent inode number.
            FileMap::Inline(_) => vec![(4, dir.size.min(60).saturating_sub(4) as usize)],
            _ => {
                let count = dir.size.div_ceil(self.block_size);
                (0..count).map(|i| (i * self.block_size, self.block_size as usize)).collect()
            }
        };
        Ok((map, chunks))
    }

    fn parse_dirents(&self, chunk: &[u8]) -> Result<Vec<RawDirent>> {
        let filetype = self.superblock.has_incompat(INCOMPAT_FILETYPE);
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= chunk.len() {
            let inode = le_u32(chunk, pos);
            let rec_len = le_u16(chunk, pos + 4) as usize;
            let name_len = if filetype {
                chunk[pos + 6] as usize
            } else {
                le_u16(chunk, pos + 6) as usize
            };
            if rec_len < 8 || pos + rec_len > chunk.len() || name_len + 8 > rec_len {
                return Err(RawscopeError::malformed(
                    self.version.as_str(),
                    format!("directory entry at {} has rec_len {} name_len {}", pos, rec_len, name_len),
                ));
            }
            if inode != 0 && name_len > 0 {
                let name = String::from_utf8_lossy(&chunk[pos + 8..pos + 8 + name_len]).into_owned();
                if name != "." && name != ".." {
                    entries.push(RawDirent { inode, name });
                }
            }
            pos += rec_len;
        }
        Ok(entries)
    }

    fn directory_inode(&mut self, number: u32) -> Result<Inode> {
        let inode = self.read_inode(number)?;
        if inode.kind() != NodeKind::Directory {
            return Err(RawscopeError::NotADirectory(format!("inode {}", number)));
        }
        Ok(inode)
    }

    fn entry_for(&mut self, dirent: RawDirent) -> Result<WalkEntry<u32>> {
        let child = self.read_inode(dirent.inode)?;
        Ok(WalkEntry {
            name: dirent.name,
            kind: child.kind(),
            size: child.size,
            node: dirent.inode,
        })
    }
}

impl TreeWalker for ExtReader<'_> {
    type Node = u32;

    fn fs_type(&self) -> FsTag {
        self.version
    }

    fn case_insensitive(&self) -> bool {
        false
    }

    fn root(&mut self) -> Result<u32> {
        Ok(ROOT_INODE)
    }

    fn children(&mut self, dir: &u32, skip: usize, take: usize) -> Result<Page<u32>> {
        let inode = self.directory_inode(*dir)?;
        let (map, chunks) = self.dir_chunks(&inode)?;
        let mut cursor = PageCursor::new(skip, take);
        let mut out = Vec::new();

        'chunks: for (offset, len) in chunks {
            let chunk = match &map {
                FileMap::Inline(data) => data.get(offset as usize..offset as usize + len).unwrap_or(&[]).to_vec(),
                _ => self.read_range(&inode, &map, offset, len)?,
            };
            for dirent in self.parse_dirents(&chunk)? {
                match cursor.step() {
                    CursorStep::Skip => continue,
                    CursorStep::Stop => break 'chunks,
                    CursorStep::Keep => out.push(self.entry_for(dirent)?),
                }
            }
        }
        Ok(cursor.finish(out))
    }

    fn find_child(&mut self, dir: &u32, name: &str) -> Result<Option<WalkEntry<u32>>> {
        let inode = self.directory_inode(*dir)?;
        let (map, chunks) = self.dir_chunks(&inode)?;
        for (offset, len) in chunks {
            let chunk = match &map {
                FileMap::Inline(data) => data.get(offset as usize..offset as usize + len).unwrap_or(&[]).to_vec(),
                _ => self.read_range(&inode, &map, offset, len)?,
            };
            if let Some(dirent) = self.parse_dirents(&chunk)?.into_iter().find(|d| d.name == name) {
                return self.entry_for(dirent).map(Some);
            }
        }
        Ok(None)
    }

    fn read_file(&mut self, node: &u32, _kind: NodeKind, limit: usize) -> Result<Vec<u8>> {
        let inode = self.read_inode(*node)?;
        if inode.flags & EXT4_ENCRYPT_FL != 0 {
            return Err(RawscopeError::NotSupported(format!("inode {} is encrypted", node)));
        }
        let map = self.file_map(&inode)?;
        let len = preview_len(inode.size, limit);
        debug!("Reading {} bytes of inode {}", len, node);
        self.read_range(&inode, &map, 0, len)
    }
}
