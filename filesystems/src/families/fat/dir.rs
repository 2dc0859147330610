// FAT directory entries and long filename (VFAT) assembly

use crate::utils::{le_u16, le_u32};

pub const DIR_ENTRY_SIZE: usize = 32;

pub mod attributes {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const LONG_NAME: u8 = READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID;
}

const LAST_LONG_ENTRY: u8 = 0x40;
const DELETED: u8 = 0xE5;
const KANJI_E5: u8 = 0x05;
// Windows NT stores "all lowercase" hints for 8.3 names in byte 12.
const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT: u8 = 0x10;

/// A live 8.3 entry with its resolved display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatDirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u32,
    pub first_cluster: u32,
}

/// What one 32-byte slot turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Slot {
    /// 0x00 in the first byte: nothing follows.
    End,
    Entry(FatDirEntry),
    VolumeLabel(String),
    /// Deleted, dot entries, LFN fragments.
    Skip,
}

/// Checksum an LFN fragment carries for its 8.3 entry.
pub fn short_name_checksum(short_name: &[u8]) -> u8 {
    short_name
        .iter()
        .take(11)
        .fold(0u8, |sum, &byte| ((sum >> 1) | (sum << 7)).wrapping_add(byte))
}

fn oem_text(bytes: &[u8]) -> String {
    // Code page bytes above 0x7F are shown as Latin-1.
    bytes.iter().map(|&b| b as char).collect::<String>().trim_end().to_string()
}

/// Display form of an 8.3 name: "README.TXT", honoring NT case hints.
pub fn short_name(raw: &[u8], nt_flags: u8) -> String {
    let mut base_bytes = raw[0..8].to_vec();
    if base_bytes[0] == KANJI_E5 {
        base_bytes[0] = DELETED;
    }
    let mut base = oem_text(&base_bytes);
    let mut ext = oem_text(&raw[8..11]);
    if nt_flags & NT_LOWER_BASE != 0 {
        base = base.to_lowercase();
    }
    if nt_flags & NT_LOWER_EXT != 0 {
        ext = ext.to_lowercase();
    }
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

/// Collects LFN fragments (stored last-first) until their 8.3 entry arrives.
#[derive(Debug, Default)]
pub struct LfnParser {
    parts: Vec<[u16; 13]>,
    checksum: u8,
    expected: u8,
}

impl LfnParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.parts.clear();
        self.expected = 0;
    }

    fn fragment_chars(entry: &[u8]) -> [u16; 13] {
        let mut chars = [0u16; 13];
        let offsets = (1..11).step_by(2).chain((14..26).step_by(2)).chain((28..32).step_by(2));
        for (slot, offset) in chars.iter_mut().zip(offsets) {
            *slot = le_u16(entry, offset);
        }
        chars
    }

    /// Feed one LFN fragment. Out-of-sequence fragments discard the run.
    pub fn push(&mut self, entry: &[u8]) {
        let order = entry[0];
        let ordinal = order & 0x1F;
        let checksum = entry[13];

        if order & LAST_LONG_ENTRY != 0 {
            self.reset();
            if ordinal == 0 || ordinal > 20 {
                return;
            }
            self.checksum = checksum;
            self.parts = vec![[0u16; 13]; ordinal as usize];
        } else if ordinal == 0 || self.parts.is_empty() || ordinal != self.expected || checksum != self.checksum {
            self.reset();
            return;
        }
        let Some(slot) = self.parts.get_mut(ordinal as usize - 1) else {
            self.reset();
            return;
        };
        *slot = Self::fragment_chars(entry);
        self.expected = ordinal.saturating_sub(1);
    }

    /// The long name for this 8.3 entry, if a complete matching run precedes it.
    pub fn take(&mut self, short_raw: &[u8]) -> Option<String> {
        let complete = !self.parts.is_empty() && self.expected == 0;
        let matches = self.checksum == short_name_checksum(short_raw);
        let units: Vec<u16> = self
            .parts
            .iter()
            .flatten()
            .copied()
            .take_while(|&c| c != 0x0000 && c != 0xFFFF)
            .collect();
        self.reset();
        if complete && matches && !units.is_empty() {
            Some(String::from_utf16_lossy(&units))
        } else {
            None
        }
    }
}

/// Decode one 32-byte slot.
pub fn decode_slot(entry: &[u8], lfn: &mut LfnParser, fat32: bool) -> Slot {
    match entry[0] {
        0x00 => return Slot::End,
        DELETED => {
            lfn.reset();
            return Slot::Skip;
        }
        _ => {}
    }

    let attr = entry[11];
    if attr & 0x3F == attributes::LONG_NAME {
        lfn.push(entry);
        return Slot::Skip;
    }
    if attr & attributes::VOLUME_ID != 0 {
        lfn.reset();
        return Slot::VolumeLabel(oem_text(&entry[0..11]));
    }
    if entry[0] == b'.' && (entry[1] == b' ' || (entry[1] == b'.' && entry[2] == b' ')) {
        lfn.reset();
        return Slot::Skip;
    }

    let name = lfn.take(&entry[0..11]).unwrap_or_else(|| short_name(&entry[0..11], entry[12]));
    let high = if fat32 { (le_u16(entry, 20) as u32) << 16 } else { 0 };
    Slot::Entry(FatDirEntry {
        name,
        is_dir: attr & attributes::DIRECTORY != 0,
        size: le_u32(entry, 28),
        first_cluster: high | le_u16(entry, 26) as u32,
    })
}
