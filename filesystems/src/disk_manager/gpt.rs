// GUID Partition Table reader

use super::TableEntry;
use crate::device_reader::DeviceReader;
use crate::utils::{format_guid, le_u32, le_u64, utf16le_to_string};
use log::{debug, warn};
use rawscope_core::{FsTag, RawscopeError, Result};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const MAX_ENTRY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub sector_size: u64,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: String,
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    /// Parse and CRC-check a header sector.
    pub fn parse(sector: &[u8], sector_size: u64) -> Result<Self> {
        if sector.len() < 92 || &sector[0..8] != GPT_SIGNATURE {
            return Err(RawscopeError::malformed("GPT", "missing EFI PART signature"));
        }
        let header_size = le_u32(sector, 12) as usize;
        if header_size < 92 || header_size > sector.len() {
            return Err(RawscopeError::malformed("GPT", format!("header size {} out of range", header_size)));
        }
        let stored_crc = le_u32(sector, 16);
        let mut copy = sector[..header_size].to_vec();
        copy[16..20].fill(0);
        let computed = crc32fast::hash(&copy);
        if computed != stored_crc {
            return Err(RawscopeError::malformed(
                "GPT",
                format!("header CRC mismatch (stored {:#010x}, computed {:#010x})", stored_crc, computed),
            ));
        }

        let header = Self {
            sector_size,
            current_lba: le_u64(sector, 24),
            backup_lba: le_u64(sector, 32),
            first_usable_lba: le_u64(sector, 40),
            last_usable_lba: le_u64(sector, 48),
            disk_guid: format_guid(&sector[56..72]),
            entries_lba: le_u64(sector, 72),
            num_entries: le_u32(sector, 80),
            entry_size: le_u32(sector, 84),
            entries_crc32: le_u32(sector, 88),
        };

        if header.entry_size < 128 || header.entry_size % 8 != 0 {
            return Err(RawscopeError::malformed(
                "GPT",
                format!("partition entry size {} is invalid", header.entry_size),
            ));
        }
        if header.entries_bytes() > MAX_ENTRY_BYTES {
            return Err(RawscopeError::malformed(
                "GPT",
                format!("{} entries of {} bytes is implausible", header.num_entries, header.entry_size),
            ));
        }
        Ok(header)
    }

    fn entries_bytes(&self) -> usize {
        self.num_entries as usize * self.entry_size as usize
    }
}

/// Locate a valid header: primary at LBA 1 (trying 512 and 4096 byte
/// sectors), then the backup at the last LBA.
pub fn find_header(reader: &mut DeviceReader) -> Result<Option<GptHeader>> {
    for sector_size in [512u64, 4096] {
        let sector = reader.read_at_lossy(sector_size, sector_size as usize)?;
        if &sector[0..8] != GPT_SIGNATURE {
            continue;
        }
        match GptHeader::parse(&sector, sector_size) {
            Ok(header) => return Ok(Some(header)),
            Err(e) => {
                warn!("Primary GPT header unusable: {}", e);
                if let Some(len) = reader.len().filter(|&len| len >= 2 * sector_size) {
                    let last_lba = len / sector_size - 1;
                    let backup = reader.read_at_lossy(last_lba * sector_size, sector_size as usize)?;
                    match GptHeader::parse(&backup, sector_size) {
                        Ok(header) => {
                            warn!("Using backup GPT header at LBA {}", last_lba);
                            return Ok(Some(header));
                        }
                        Err(e) => warn!("Backup GPT header unusable: {}", e),
                    }
                }
                return Ok(None);
            }
        }
    }
    Ok(None)
}

pub fn read_entries(reader: &mut DeviceReader, header: &GptHeader) -> Result<Vec<TableEntry>> {
    let data = reader.read_at(header.entries_lba * header.sector_size, header.entries_bytes())?;
    if crc32fast::hash(&data) != header.entries_crc32 {
        warn!("GPT partition entry array CRC mismatch; listing entries anyway");
    }

    let mut entries = Vec::new();
    for (index, raw) in data.chunks_exact(header.entry_size as usize).enumerate() {
        if raw[0..16].iter().all(|&b| b == 0) {
            continue;
        }
        let type_guid = format_guid(&raw[0..16]);
        let first_lba = le_u64(raw, 32);
        let last_lba = le_u64(raw, 40);
        if last_lba < first_lba {
            warn!("GPT entry {} has end before start; skipping", index + 1);
            continue;
        }
        let (label, hint) = type_info(&type_guid);
        debug!("GPT entry {}: {} at LBA {}", index + 1, label, first_lba);
        entries.push(TableEntry {
            number: index as u32 + 1,
            start_bytes: first_lba * header.sector_size,
            size_bytes: (last_lba - first_lba + 1) * header.sector_size,
            name: utf16le_to_string(&raw[56..128]),
            type_label: label.to_string(),
            fs_hint: hint,
        });
    }
    Ok(entries)
}

/// Human label and coarse filesystem hint for a partition type GUID.
pub fn type_info(type_guid: &str) -> (&str, Option<FsTag>) {
    match type_guid {
        "C12A7328-F81F-11D2-BA4B-00A0C93EC93B" => ("EFI System", Some(FsTag::Fat32)),
        "21686148-6449-6E6F-7468-656564454649" => ("BIOS Boot", None),
        "E3C9E316-0B5C-4DB8-817D-F92DF00215AE" => ("Microsoft Reserved", None),
        "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7" => ("Microsoft Basic Data", Some(FsTag::Ntfs)),
        "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC" => ("Windows Recovery", Some(FsTag::Ntfs)),
        "0FC63DAF-8483-4772-8E79-3D69D8477DE4" => ("Linux Filesystem", Some(FsTag::Ext4)),
        "933AC7E1-2EB4-4F13-B844-0E14E2AEF915" => ("Linux Home", Some(FsTag::Ext4)),
        "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709" => ("Linux Root (x86-64)", Some(FsTag::Ext4)),
        "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F" => ("Linux Swap", None),
        "E6D6D379-F507-44C2-A23C-238F2A3DF928" => ("Linux LVM", None),
        "A19D880F-05FC-4D3B-A006-743F0F84911E" => ("Linux RAID", None),
        "48465300-0000-11AA-AA11-00306543ECAC" => ("Apple HFS/HFS+", None),
        "7C3457EF-0000-11AA-AA11-00306543ECAC" => ("Apple APFS", None),
        "516E7CB4-6ECF-11D6-8FF8-00022D09712B" => ("FreeBSD Data", None),
        other => (other, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_sector(entry_size: u32) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[0..8].copy_from_slice(GPT_SIGNATURE);
        sector[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        sector[12..16].copy_from_slice(&92u32.to_le_bytes());
        sector[24..32].copy_from_slice(&1u64.to_le_bytes());
        sector[72..80].copy_from_slice(&2u64.to_le_bytes());
        sector[80..84].copy_from_slice(&128u32.to_le_bytes());
        sector[84..88].copy_from_slice(&entry_size.to_le_bytes());
        let crc = crc32fast::hash(&sector[..92]);
        sector[16..20].copy_from_slice(&crc.to_le_bytes());
        sector
    }

    #[test]
    fn test_header_crc_checked() {
        let sector = header_sector(128);
        let header = GptHeader::parse(&sector, 512).unwrap();
        assert_eq!(header.entries_lba, 2);
        assert_eq!(header.num_entries, 128);

        let mut corrupted = sector.clone();
        corrupted[40] ^= 0xFF;
        assert!(matches!(
            GptHeader::parse(&corrupted, 512),
            Err(RawscopeError::MalformedStructure(_))
        ));
    }

    #[test]
    fn test_bad_entry_size_rejected() {
        assert!(GptHeader::parse(&header_sector(100), 512).is_err());
    }

    #[test]
    fn test_type_hints() {
        assert_eq!(type_info("0FC63DAF-8483-4772-8E79-3D69D8477DE4").1, Some(FsTag::Ext4));
        assert_eq!(type_info("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7").0, "Microsoft Basic Data");
        let unknown = "11111111-2222-3333-4444-555555555555";
        assert_eq!(type_info(unknown), (unknown, None));
    }
}
