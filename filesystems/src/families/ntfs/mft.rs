// MFT records, attributes and data runs

use crate::utils::{le_u16, le_u32, le_u64, utf16le_to_string};
use rawscope_core::{RawscopeError, Result};

pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_VOLUME_NAME: u32 = 0x60;
pub const ATTR_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_BITMAP: u32 = 0xB0;
const ATTR_END: u32 = 0xFFFF_FFFF;

pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;

const RECORD_IN_USE: u16 = 0x0001;
const RECORD_IS_DIRECTORY: u16 = 0x0002;

fn malformed(reason: String) -> RawscopeError {
    RawscopeError::malformed("NTFS", reason)
}

/// Undo the update sequence array: the last two bytes of every stride were
/// swapped for a check value when the record was written.
pub fn apply_fixups(record: &mut [u8], magic: &[u8; 4]) -> Result<()> {
    if record.get(0..4) != Some(&magic[..]) {
        return Err(malformed(format!(
            "expected {} record, found {:02x?}",
            String::from_utf8_lossy(magic),
            record.get(0..4).unwrap_or(&[])
        )));
    }
    let usa_offset = le_u16(record, 4) as usize;
    let usa_count = le_u16(record, 6) as usize;
    if usa_count < 2 || usa_offset + usa_count * 2 > record.len() {
        return Err(malformed(format!("update sequence {}x{} out of bounds", usa_offset, usa_count)));
    }
    let stride = record.len() / (usa_count - 1);
    if stride < 256 {
        return Err(malformed(format!("update sequence stride {} too small", stride)));
    }
    let check = le_u16(record, usa_offset);
    for i in 1..usa_count {
        let end = i * stride;
        if le_u16(record, end - 2) != check {
            return Err(malformed(format!("torn write: fixup mismatch in stride {}", i)));
        }
        let replacement = [record[usa_offset + i * 2], record[usa_offset + i * 2 + 1]];
        record[end - 2..end].copy_from_slice(&replacement);
    }
    Ok(())
}

/// One contiguous piece of a non-resident attribute. `lcn` is `None` for
/// sparse runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub vcn: u64,
    pub length: u64,
    pub lcn: Option<u64>,
}

/// Decode a mapping-pairs array.
pub fn decode_runs(mut data: &[u8], start_vcn: u64) -> Result<Vec<DataRun>> {
    let mut runs = Vec::new();
    let mut vcn = start_vcn;
    let mut lcn: i64 = 0;
    while let Some((&header, rest)) = data.split_first() {
        if header == 0 {
            break;
        }
        let len_size = (header & 0x0F) as usize;
        let off_size = (header >> 4) as usize;
        if len_size == 0 || len_size > 8 || off_size > 8 || rest.len() < len_size + off_size {
            return Err(malformed(format!("data run header {:#04x} invalid", header)));
        }
        let mut length = 0u64;
        for (i, &b) in rest[..len_size].iter().enumerate() {
            length |= (b as u64) << (i * 8);
        }
        let target = if off_size == 0 {
            None
        } else {
            let mut delta = 0i64;
            for (i, &b) in rest[len_size..len_size + off_size].iter().enumerate() {
                delta |= (b as i64) << (i * 8);
            }
            // Sign-extend from the top byte.
            let shift = 64 - off_size * 8;
            if shift > 0 {
                delta = (delta << shift) >> shift;
            }
            lcn = lcn.checked_add(delta).filter(|&l| l >= 0).ok_or_else(|| malformed("data run LCN underflow".into()))?;
            Some(lcn as u64)
        };
        // VCNs are signed 64-bit on disk.
        let next = vcn
            .checked_add(length)
            .filter(|&v| v <= i64::MAX as u64)
            .ok_or_else(|| malformed(format!("data run of {} clusters at VCN {} overflows", length, vcn)))?;
        runs.push(DataRun { vcn, length, lcn: target });
        vcn = next;
        data = &rest[len_size + off_size..];
    }
    Ok(runs)
}

#[derive(Debug, Clone)]
pub enum AttrBody {
    Resident(Vec<u8>),
    NonResident {
        runs: Vec<DataRun>,
        start_vcn: u64,
        allocated_size: u64,
        real_size: u64,
        initialized_size: u64,
    },
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub type_code: u32,
    pub name: String,
    pub flags: u16,
    pub body: AttrBody,
}

impl Attribute {
    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & ATTR_FLAG_ENCRYPTED != 0
    }

    /// Logical size of the attribute value.
    pub fn value_size(&self) -> u64 {
        match &self.body {
            AttrBody::Resident(value) => value.len() as u64,
            AttrBody::NonResident { real_size, .. } => *real_size,
        }
    }

    pub fn resident_value(&self) -> Option<&[u8]> {
        match &self.body {
            AttrBody::Resident(value) => Some(value),
            AttrBody::NonResident { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MftRecord {
    pub number: u64,
    pub flags: u16,
    /// Bumped each time the record is reused; references carry a copy.
    pub sequence: u16,
    pub attributes: Vec<Attribute>,
}

impl MftRecord {
    /// Parse a record buffer; fixups are applied in place.
    pub fn parse(number: u64, mut raw: Vec<u8>) -> Result<Self> {
        apply_fixups(&mut raw, b"FILE")?;
        let flags = le_u16(&raw, 0x16);
        let first_attr = le_u16(&raw, 0x14) as usize;
        let used = (le_u32(&raw, 0x18) as usize).min(raw.len());

        let mut attributes = Vec::new();
        let mut pos = first_attr;
        while pos + 8 <= used {
            let type_code = le_u32(&raw, pos);
            if type_code == ATTR_END {
                break;
            }
            let len = le_u32(&raw, pos + 4) as usize;
            if len < 16 || pos + len > used {
                return Err(malformed(format!("record {} attribute at {} has length {}", number, pos, len)));
            }
            attributes.push(Self::parse_attribute(number, &raw[pos..pos + len])?);
            pos += len;
        }

        Ok(Self {
            number,
            flags,
            sequence: le_u16(&raw, 0x10),
            attributes,
        })
    }

    fn parse_attribute(number: u64, a: &[u8]) -> Result<Attribute> {
        let type_code = le_u32(a, 0);
        let non_resident = a[8] != 0;
        let name_len = a[9] as usize;
        let name_off = le_u16(a, 10) as usize;
        let name = if name_len > 0 {
            let bytes = a
                .get(name_off..name_off + name_len * 2)
                .ok_or_else(|| malformed(format!("record {} attribute name out of bounds", number)))?;
            utf16le_to_string(bytes)
        } else {
            String::new()
        };

        let body = if non_resident {
            let start_vcn = le_u64(a, 16);
            let runs_off = le_u16(a, 32) as usize;
            let runs = a
                .get(runs_off..)
                .ok_or_else(|| malformed(format!("record {} run list out of bounds", number)))?;
            AttrBody::NonResident {
                runs: decode_runs(runs, start_vcn)?,
                start_vcn,
                allocated_size: le_u64(a, 40),
                real_size: le_u64(a, 48),
                initialized_size: le_u64(a, 56),
            }
        } else {
            let value_len = le_u32(a, 16) as usize;
            let value_off = le_u16(a, 20) as usize;
            let value = a
                .get(value_off..value_off + value_len)
                .ok_or_else(|| malformed(format!("record {} resident value out of bounds", number)))?;
            AttrBody::Resident(value.to_vec())
        };

        Ok(Attribute {
            type_code,
            name,
            flags: le_u16(a, 12),
            body,
        })
    }

    pub fn in_use(&self) -> bool {
        self.flags & RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_IS_DIRECTORY != 0
    }

    pub fn find(&self, type_code: u32, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.type_code == type_code && a.name == name)
    }

    pub fn has(&self, type_code: u32) -> bool {
        self.attributes.iter().any(|a| a.type_code == type_code)
    }
}
