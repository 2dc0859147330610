// NTFS Index (B+ tree) support for directories
// Entries come from INDEX_ROOT and the in-use INDX blocks of INDEX_ALLOCATION.

use super::mft::apply_fixups;
use crate::utils::{le_u16, le_u32, le_u64};
use log::trace;
use rawscope_core::{RawscopeError, Result};

pub const INDEX_ENTRY_END: u16 = 0x02; // Last entry in node

pub const FILE_NAME_POSIX: u8 = 0;
pub const FILE_NAME_WIN32: u8 = 1;
pub const FILE_NAME_DOS: u8 = 2;
pub const FILE_NAME_WIN32_AND_DOS: u8 = 3;

const FILE_ATTR_DIRECTORY: u32 = 0x1000_0000;
const MFT_REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Parsed index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub mft_reference: u64,
    /// Sequence number of the record the entry was written for.
    pub sequence: u16,
    pub file_name: String,
    pub namespace: u8,
    pub is_directory: bool,
    pub real_size: u64,
}

/// Decode a `$FILE_NAME` value (also the key of `$I30` index entries).
pub fn parse_file_name(key: &[u8]) -> Option<(String, u8, u32, u64)> {
    let name_len = *key.get(64)? as usize;
    let namespace = *key.get(65)?;
    let bytes = key.get(66..66 + name_len * 2)?;
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    Some((
        String::from_utf16_lossy(&units),
        namespace,
        le_u32(key, 56),
        le_u64(key, 48),
    ))
}

/// Parse entries of one index node. `node` starts at the node header.
fn parse_node(node: &[u8], out: &mut Vec<IndexEntry>) -> Result<()> {
    let entries_offset = le_u32(node, 0) as usize;
    let index_length = le_u32(node, 4) as usize;
    if entries_offset < 16 || index_length > node.len() || entries_offset > index_length {
        return Err(RawscopeError::malformed(
            "NTFS",
            format!("index node header {}+{} exceeds {} bytes", entries_offset, index_length, node.len()),
        ));
    }

    let data = &node[..index_length];
    let mut pos = entries_offset;
    while pos + 16 <= data.len() {
        let length = le_u16(data, pos + 8) as usize;
        let key_length = le_u16(data, pos + 10) as usize;
        let flags = le_u16(data, pos + 12);
        if flags & INDEX_ENTRY_END != 0 {
            break;
        }
        if length < 16 || pos + length > data.len() || 16 + key_length > length {
            return Err(RawscopeError::malformed(
                "NTFS",
                format!("index entry at {} has length {} key {}", pos, length, key_length),
            ));
        }
        let key = &data[pos + 16..pos + 16 + key_length];
        match parse_file_name(key) {
            Some((file_name, namespace, attributes, real_size)) => out.push(IndexEntry {
                mft_reference: le_u64(data, pos) & MFT_REFERENCE_MASK,
                sequence: (le_u64(data, pos) >> 48) as u16,
                file_name,
                namespace,
                is_directory: attributes & FILE_ATTR_DIRECTORY != 0,
                real_size,
            }),
            None => trace!("Index entry at {} has a short key", pos),
        }
        pos += length;
    }
    Ok(())
}

/// Entries held directly in an `$INDEX_ROOT` value.
pub fn parse_index_root(value: &[u8], out: &mut Vec<IndexEntry>) -> Result<()> {
    let node = value
        .get(16..)
        .ok_or_else(|| RawscopeError::malformed("NTFS", "index root too small"))?;
    parse_node(node, out)
}

/// Entries from one INDX block of `$INDEX_ALLOCATION`. Blocks without the
/// INDX magic are unused and yield nothing.
pub fn parse_index_block(mut block: Vec<u8>, out: &mut Vec<IndexEntry>) -> Result<()> {
    if block.get(0..4) != Some(&b"INDX"[..]) {
        trace!("Skipping index block without INDX signature");
        return Ok(());
    }
    apply_fixups(&mut block, b"INDX")?;
    let node = block
        .get(0x18..)
        .ok_or_else(|| RawscopeError::malformed("NTFS", "index block too small"))?;
    parse_node(node, out)
}
