// Partition table reading - MBR (with EBR chains) and GPT

pub mod gpt;
pub mod mbr;

use crate::device_reader::DeviceReader;
use log::{info, warn};
use rawscope_core::{FsTag, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStyle {
    MBR,
    GPT,
    Uninitialized,
}

/// A partition as the on-disk table describes it, before any device node
/// has been assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub number: u32,
    pub start_bytes: u64,
    pub size_bytes: u64,
    pub name: String,
    pub type_label: String,
    pub fs_hint: Option<FsTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub style: PartitionStyle,
    pub entries: Vec<TableEntry>,
}

/// Read whichever partition table the device carries.
///
/// A device with no recognizable table yields an empty `Uninitialized`
/// table and a warning. I/O and permission failures are still errors.
pub fn read_partition_table(reader: &mut DeviceReader) -> Result<PartitionTable> {
    let sector0 = reader.read_at_lossy(0, 512)?;
    let disk_sectors = reader.len().map(|len| len / 512);

    let primary = match mbr::parse_primary(&sector0, disk_sectors) {
        Some(primary) => primary,
        None => {
            // No MBR; a GPT without a protective MBR is still worth a look.
            if let Some(header) = gpt::find_header(reader)? {
                warn!("{}: GPT found without a protective MBR", reader.path());
                return Ok(PartitionTable {
                    style: PartitionStyle::GPT,
                    entries: gpt::read_entries(reader, &header)?,
                });
            }
            warn!("{}: no partition table found", reader.path());
            return Ok(PartitionTable {
                style: PartitionStyle::Uninitialized,
                entries: Vec::new(),
            });
        }
    };

    let protective = primary
        .iter()
        .any(|(_, entry)| entry.partition_type == mbr::PROTECTIVE_GPT);
    if protective {
        match gpt::find_header(reader)? {
            Some(header) => {
                let entries = gpt::read_entries(reader, &header)?;
                info!("{}: GPT with {} partitions", reader.path(), entries.len());
                return Ok(PartitionTable {
                    style: PartitionStyle::GPT,
                    entries,
                });
            }
            None => {
                warn!("{}: protective MBR but no usable GPT header", reader.path());
                return Ok(PartitionTable {
                    style: PartitionStyle::Uninitialized,
                    entries: Vec::new(),
                });
            }
        }
    }

    let entries = mbr::read_mbr(reader, &primary, 512)?;
    info!("{}: MBR with {} partitions", reader.path(), entries.len());
    Ok(PartitionTable {
        style: PartitionStyle::MBR,
        entries,
    })
}
