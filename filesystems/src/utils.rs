// Common helpers for decoding on-disk structures

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use uuid::Uuid;

// Field readers return 0 when the field would fall outside the buffer, so a
// truncated structure degrades into a failed sanity check rather than a panic.

pub fn le_u16(buf: &[u8], offset: usize) -> u16 {
    buf.get(offset..offset + 2).map(LittleEndian::read_u16).unwrap_or(0)
}

pub fn le_u32(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4).map(LittleEndian::read_u32).unwrap_or(0)
}

pub fn le_u64(buf: &[u8], offset: usize) -> u64 {
    buf.get(offset..offset + 8).map(LittleEndian::read_u64).unwrap_or(0)
}

pub fn be_u16(buf: &[u8], offset: usize) -> u16 {
    buf.get(offset..offset + 2).map(BigEndian::read_u16).unwrap_or(0)
}

pub fn be_u32(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4).map(BigEndian::read_u32).unwrap_or(0)
}

pub fn be_u64(buf: &[u8], offset: usize) -> u64 {
    buf.get(offset..offset + 8).map(BigEndian::read_u64).unwrap_or(0)
}

pub fn u8_at(buf: &[u8], offset: usize) -> u8 {
    buf.get(offset).copied().unwrap_or(0)
}

/// Decode UTF-16LE, stopping at the first NUL.
pub fn utf16le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Fixed-width text field: NUL-terminated, space padded.
pub fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

/// Big-endian UUID as stored by ext, Btrfs and XFS.
pub fn format_uuid(bytes: &[u8]) -> String {
    match Uuid::from_slice(bytes.get(..16).unwrap_or(&[])) {
        Ok(uuid) if !uuid.is_nil() => uuid.hyphenated().to_string(),
        _ => String::new(),
    }
}

/// Mixed-endian GUID as stored by GPT (first three groups little-endian).
pub fn format_guid(bytes: &[u8]) -> String {
    let mut raw = [0u8; 16];
    if let Some(src) = bytes.get(..16) {
        raw.copy_from_slice(src);
    }
    Uuid::from_bytes_le(raw).hyphenated().to_string().to_uppercase()
}

/// 32-bit volume serial in the `XXXX-XXXX` form FAT and exFAT tools print.
pub fn format_serial32(serial: u32) -> String {
    format!("{:04X}-{:04X}", serial >> 16, serial & 0xFFFF)
}

pub fn is_power_of_two_in(value: u64, min: u64, max: u64) -> bool {
    value.is_power_of_two() && value >= min && value <= max
}
