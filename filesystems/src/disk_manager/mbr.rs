// MBR partition table with extended (EBR) chain support

use super::TableEntry;
use crate::device_reader::DeviceReader;
use crate::utils::{le_u32, u8_at};
use log::{debug, warn};
use rawscope_core::{FsTag, Result};
use std::collections::HashSet;

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const MAX_LOGICAL: usize = 128;

pub const PROTECTIVE_GPT: u8 = 0xEE;

/// One 16-byte slot of an MBR or EBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub status: u8,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sectors: u32,
}

impl MbrEntry {
    fn parse(sector: &[u8], slot: usize) -> Option<Self> {
        let base = TABLE_OFFSET + slot * ENTRY_SIZE;
        let entry = Self {
            status: u8_at(sector, base),
            partition_type: u8_at(sector, base + 4),
            start_lba: le_u32(sector, base + 8),
            sectors: le_u32(sector, base + 12),
        };
        if entry.partition_type == 0 || entry.sectors == 0 {
            None
        } else {
            Some(entry)
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, 0x05 | 0x0F | 0x85)
    }
}

pub fn has_boot_signature(sector: &[u8]) -> bool {
    u8_at(sector, 510) == 0x55 && u8_at(sector, 511) == 0xAA
}

/// Primary slots of sector 0, or `None` when the sector is not a plausible
/// MBR (a filesystem boot sector at LBA 0 also ends in 0x55AA, but its
/// bytes at 446.. are boot code, not a table).
pub fn parse_primary(sector: &[u8], disk_sectors: Option<u64>) -> Option<Vec<(u32, MbrEntry)>> {
    if !has_boot_signature(sector) {
        return None;
    }
    let mut entries = Vec::new();
    for slot in 0..4 {
        let status = u8_at(sector, TABLE_OFFSET + slot * ENTRY_SIZE);
        if status != 0x00 && status != 0x80 {
            return None;
        }
        if let Some(entry) = MbrEntry::parse(sector, slot) {
            if entry.start_lba == 0 {
                return None;
            }
            if let Some(total) = disk_sectors {
                // Protective entries may legitimately claim 0xFFFFFFFF sectors.
                if entry.partition_type != PROTECTIVE_GPT && entry.start_lba as u64 >= total {
                    return None;
                }
            }
            entries.push((slot as u32 + 1, entry));
        }
    }
    Some(entries)
}

/// Turn primary slots (and any logical partitions behind an extended
/// partition) into table entries.
pub fn read_mbr(
    reader: &mut DeviceReader,
    primary: &[(u32, MbrEntry)],
    sector_size: u64,
) -> Result<Vec<TableEntry>> {
    let mut entries = Vec::new();
    for (number, entry) in primary {
        if entry.is_extended() {
            entries.extend(read_ebr_chain(reader, entry.start_lba as u64, sector_size));
            continue;
        }
        entries.push(to_table_entry(*number, entry, entry.start_lba as u64, sector_size));
    }
    entries.sort_by_key(|e| e.number);
    Ok(entries)
}

/// Follow the linked list of extended boot records. Logical partitions are
/// numbered from 5. A broken link ends the chain with a warning.
fn read_ebr_chain(reader: &mut DeviceReader, extended_start: u64, sector_size: u64) -> Vec<TableEntry> {
    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    let mut ebr_lba = extended_start;
    let mut number = 5;

    while entries.len() < MAX_LOGICAL {
        if !visited.insert(ebr_lba) {
            warn!("EBR chain loops back to LBA {}; stopping", ebr_lba);
            break;
        }
        let sector = match reader.read_at(ebr_lba * sector_size, 512) {
            Ok(sector) => sector,
            Err(e) => {
                warn!("Unreadable EBR at LBA {}: {}", ebr_lba, e);
                break;
            }
        };
        if !has_boot_signature(&sector) {
            warn!("EBR at LBA {} has no boot signature; stopping", ebr_lba);
            break;
        }

        if let Some(logical) = MbrEntry::parse(&sector, 0) {
            let start = ebr_lba + logical.start_lba as u64;
            debug!("Logical partition {} at LBA {}", number, start);
            entries.push(to_table_entry(number, &logical, start, sector_size));
            number += 1;
        }

        match MbrEntry::parse(&sector, 1) {
            Some(next) if next.is_extended() => ebr_lba = extended_start + next.start_lba as u64,
            _ => break,
        }
    }
    entries
}

fn to_table_entry(number: u32, entry: &MbrEntry, start_lba: u64, sector_size: u64) -> TableEntry {
    let (label, hint) = type_info(entry.partition_type);
    TableEntry {
        number,
        start_bytes: start_lba * sector_size,
        size_bytes: entry.sectors as u64 * sector_size,
        name: String::new(),
        type_label: format!("{} (0x{:02X})", label, entry.partition_type),
        fs_hint: hint,
    }
}

/// Human label and coarse filesystem hint for an MBR type byte.
pub fn type_info(partition_type: u8) -> (&'static str, Option<FsTag>) {
    match partition_type {
        0x01 => ("FAT12", Some(FsTag::Fat12)),
        0x04 => ("FAT16 (<32MB)", Some(FsTag::Fat16)),
        0x05 => ("Extended", None),
        0x06 => ("FAT16 (>32MB)", Some(FsTag::Fat16)),
        0x07 => ("NTFS/HPFS/exFAT", Some(FsTag::Ntfs)),
        0x0B => ("FAT32 (CHS)", Some(FsTag::Fat32)),
        0x0C => ("FAT32 (LBA)", Some(FsTag::Fat32)),
        0x0E => ("FAT16 (LBA)", Some(FsTag::Fat16)),
        0x0F => ("Extended (LBA)", None),
        0x11 => ("Hidden FAT12", Some(FsTag::Fat12)),
        0x14 | 0x16 | 0x1E => ("Hidden FAT16", Some(FsTag::Fat16)),
        0x17 => ("Hidden NTFS", Some(FsTag::Ntfs)),
        0x1B | 0x1C => ("Hidden FAT32", Some(FsTag::Fat32)),
        0x27 => ("Windows RE", Some(FsTag::Ntfs)),
        0x82 => ("Linux swap", None),
        0x83 => ("Linux", Some(FsTag::Ext4)),
        0x85 => ("Linux extended", None),
        0x8E => ("Linux LVM", None),
        0xA5 => ("FreeBSD", None),
        0xAF => ("HFS/HFS+", None),
        0xEE => ("GPT protective", None),
        0xEF => ("EFI System", Some(FsTag::Fat32)),
        0xFD => ("Linux RAID", None),
        _ => ("Unknown", None),
    }
}
