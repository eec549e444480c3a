//! Entry Header
//!
//! Fixed 16-byte header at the start of every entry, little-endian.

use super::{DELETED_VALUE_SIZE, MIN_ALIGNMENT_BYTES};

/// Header size: Magic (4) + Checksum (4) + AlignUnits (1) + KeyLen (1) + ValueSize (2) + TxId (4)
pub const HEADER_SIZE: usize = 16;

pub(crate) const MAGIC_OFFSET: usize = 0;
pub(crate) const CHECKSUM_OFFSET: usize = 4;
const ALIGNMENT_UNITS_OFFSET: usize = 8;
const KEY_LENGTH_OFFSET: usize = 9;
const VALUE_SIZE_OFFSET: usize = 10;
const TRANSACTION_ID_OFFSET: usize = 12;

/// In-memory copy of an entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub magic: u32,
    pub checksum: u32,
    /// Alignment in 16-byte units, minus one
    pub alignment_units: u8,
    pub key_length_bytes: u8,
    /// `DELETED_VALUE_SIZE` marks a tombstone
    pub value_size_bytes: u16,
    pub transaction_id: u32,
}

impl EntryHeader {
    /// Serialize the header exactly as it is stored on flash
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[ALIGNMENT_UNITS_OFFSET] = self.alignment_units;
        bytes[KEY_LENGTH_OFFSET] = self.key_length_bytes;
        bytes[VALUE_SIZE_OFFSET..VALUE_SIZE_OFFSET + 2]
            .copy_from_slice(&self.value_size_bytes.to_le_bytes());
        bytes[TRANSACTION_ID_OFFSET..TRANSACTION_ID_OFFSET + 4]
            .copy_from_slice(&self.transaction_id.to_le_bytes());
        bytes
    }

    /// Serialize with the checksum field zeroed, as it is hashed
    pub fn to_bytes_for_checksum(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = self.to_bytes();
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: read_u32(bytes, MAGIC_OFFSET),
            checksum: read_u32(bytes, CHECKSUM_OFFSET),
            alignment_units: bytes[ALIGNMENT_UNITS_OFFSET],
            key_length_bytes: bytes[KEY_LENGTH_OFFSET],
            value_size_bytes: u16::from_le_bytes([
                bytes[VALUE_SIZE_OFFSET],
                bytes[VALUE_SIZE_OFFSET + 1],
            ]),
            transaction_id: read_u32(bytes, TRANSACTION_ID_OFFSET),
        }
    }

    pub fn deleted(&self) -> bool {
        self.value_size_bytes == DELETED_VALUE_SIZE
    }

    /// Value length in bytes; zero for a tombstone
    pub fn value_size(&self) -> usize {
        if self.deleted() {
            0
        } else {
            self.value_size_bytes as usize
        }
    }

    pub fn alignment_bytes(&self) -> usize {
        alignment_bytes_from_units(self.alignment_units)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Encode a write alignment as 16-byte units (rounding up)
pub fn alignment_units(alignment_bytes: usize) -> u8 {
    let units = alignment_bytes.max(1).div_ceil(MIN_ALIGNMENT_BYTES);
    (units - 1) as u8
}

pub fn alignment_bytes_from_units(units: u8) -> usize {
    (units as usize + 1) * MIN_ALIGNMENT_BYTES
}
