//! Entry Module
//!
//! One key-value record on flash: encoding, checksums and value access.
//!
//! ## On-Flash Format
//! ```text
//! ┌───────────┬──────────────┬──────────┬──────────┬────────────┬─────────┐
//! │ Magic (4) │ Checksum (4) │ Align(1) │ KeyLen(1)│ ValSize(2) │ TxId(4) │
//! ├───────────┴──────────────┴──────────┴──────────┴────────────┴─────────┤
//! │ Key (KeyLen bytes)                                                    │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │ Value (ValSize bytes, none for a tombstone)                           │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │ Zero padding up to (Align + 1) * 16 bytes                             │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum covers header (with the checksum field zeroed), key, value and
//! padding. Entries are never modified in place: an update appends a new entry
//! and the old one becomes garbage.
//!
//! Flash content is always streamed through small fixed buffers, never through
//! buffers proportional to the key or value size.

mod format;
mod header;
mod key;

pub use format::{EntryFormat, EntryFormats};
pub use header::{alignment_bytes_from_units, alignment_units, EntryHeader, HEADER_SIZE};
pub use key::{hash, EntryState, KeyDescriptor};

use tracing::{debug, error};

use crate::checksum::{ChecksumAlgorithm, ChecksumState};
use crate::error::{KvsError, Result};
use crate::flash::{align_up, AlignedWriter, Address, FlashPartition};
use header::{CHECKSUM_OFFSET, MAGIC_OFFSET};

// =============================================================================
// Format Constants
// =============================================================================

/// Longest key that can be stored
pub const MAX_KEY_LENGTH: usize = 0b11_1111;

/// Entries start on, and are padded to, multiples of this
pub const MIN_ALIGNMENT_BYTES: usize = 16;

/// Value size sentinel marking a tombstone
pub const DELETED_VALUE_SIZE: u16 = 0xFFFF;

/// Largest storable value
pub const MAX_VALUE_SIZE: usize = DELETED_VALUE_SIZE as usize - 1;

/// Stack buffer for reading keys
pub type KeyBuffer = [u8; MAX_KEY_LENGTH];

const STREAM_BUFFER_SIZE: usize = 2 * MIN_ALIGNMENT_BYTES;

/// A single entry on flash
#[derive(Debug, Clone)]
pub struct Entry {
    address: Address,
    format: EntryFormat,
    header: EntryHeader,
}

impl Entry {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Read the header of the entry at `address`.
    ///
    /// Returns:
    /// - `NotFound` — the magic bytes are erased, nothing was written here
    /// - `DataLoss` — key length out of range or unknown magic
    pub fn read<F: FlashPartition + ?Sized>(
        partition: &F,
        address: Address,
        formats: &EntryFormats,
    ) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        partition.read(address, &mut bytes)?;

        if partition.appears_erased(&bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4]) {
            return Err(KvsError::NotFound);
        }

        let header = EntryHeader::from_bytes(&bytes);

        if header.key_length_bytes as usize > MAX_KEY_LENGTH {
            return Err(KvsError::DataLoss(format!(
                "entry at {:#x} has key length {}",
                address, header.key_length_bytes
            )));
        }

        let format = match formats.find(header.magic) {
            Some(format) => format.clone(),
            None => {
                error!(
                    address,
                    magic = %format_args!("{:#010x}", header.magic),
                    "Found corrupt magic"
                );
                return Err(KvsError::DataLoss(format!(
                    "unknown magic {:#010x} at {:#x}",
                    header.magic, address
                )));
            }
        };

        Ok(Self {
            address,
            format,
            header,
        })
    }

    /// Read only the key of the entry at `address` into `out`
    pub fn read_key_at<F: FlashPartition + ?Sized>(
        partition: &F,
        address: Address,
        key_length: usize,
        out: &mut [u8],
    ) -> Result<usize> {
        if key_length == 0 || key_length > MAX_KEY_LENGTH {
            return Err(KvsError::DataLoss(format!(
                "invalid key length {} at {:#x}",
                key_length, address
            )));
        }
        if out.len() < key_length {
            return Err(KvsError::ResourceExhausted(format!(
                "key buffer of {} bytes for a {} byte key",
                out.len(),
                key_length
            )));
        }
        partition.read(address + HEADER_SIZE as Address, &mut out[..key_length])?;
        Ok(key_length)
    }

    /// Build an entry for writing. The checksum is computed immediately.
    ///
    /// Key and value lengths are validated by the caller; see `MAX_KEY_LENGTH`
    /// and `MAX_VALUE_SIZE`.
    pub fn new<F: FlashPartition + ?Sized>(
        partition: &F,
        address: Address,
        format: &EntryFormat,
        key: &[u8],
        value: &[u8],
        value_size_bytes: u16,
        transaction_id: u32,
    ) -> Self {
        debug_assert!(
            (1..=MAX_KEY_LENGTH).contains(&key.len()),
            "key length {} outside 1..={}",
            key.len(),
            MAX_KEY_LENGTH
        );
        debug_assert!(
            value.len() <= MAX_VALUE_SIZE,
            "value of {} bytes exceeds {}",
            value.len(),
            MAX_VALUE_SIZE
        );

        let header = EntryHeader {
            magic: format.magic,
            checksum: 0,
            alignment_units: alignment_units(partition.alignment_bytes()),
            key_length_bytes: key.len() as u8,
            value_size_bytes,
            transaction_id,
        };

        let mut entry = Self {
            address,
            format: format.clone(),
            header,
        };

        if let Some(algo) = entry.format.checksum.clone() {
            let digest = entry.calculate_checksum(algo.as_ref(), key, value);
            entry.header.checksum = checksum_field(&digest);
        }
        entry
    }

    /// Entry holding `value`
    pub fn valid<F: FlashPartition + ?Sized>(
        partition: &F,
        address: Address,
        format: &EntryFormat,
        key: &[u8],
        value: &[u8],
        transaction_id: u32,
    ) -> Self {
        Self::new(
            partition,
            address,
            format,
            key,
            value,
            value.len() as u16,
            transaction_id,
        )
    }

    /// Tombstone for `key`
    pub fn tombstone<F: FlashPartition + ?Sized>(
        partition: &F,
        address: Address,
        format: &EntryFormat,
        key: &[u8],
        transaction_id: u32,
    ) -> Self {
        Self::new(
            partition,
            address,
            format,
            key,
            &[],
            DELETED_VALUE_SIZE,
            transaction_id,
        )
    }

    /// Size an entry for `key`/`value` would occupy on this partition
    pub fn size_for<F: FlashPartition + ?Sized>(partition: &F, key: &[u8], value: &[u8]) -> usize {
        let alignment = alignment_bytes_from_units(alignment_units(partition.alignment_bytes()));
        align_up(HEADER_SIZE + key.len() + value.len(), alignment)
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Write header, key and value as one padded, aligned write
    pub fn write<F: FlashPartition + ?Sized>(
        &self,
        partition: &mut F,
        key: &[u8],
        value: &[u8],
    ) -> Result<usize> {
        let mut writer = AlignedWriter::new(self.address, self.alignment_bytes());
        writer.write(partition, &self.header.to_bytes())?;
        writer.write(partition, key)?;
        writer.write(partition, value)?;
        writer.flush(partition)
    }

    /// Re-stamp format, alignment and transaction id, then recompute the
    /// checksum from the key and value already on flash.
    pub fn update<F: FlashPartition + ?Sized>(
        &mut self,
        partition: &F,
        new_format: &EntryFormat,
        new_transaction_id: u32,
    ) -> Result<()> {
        self.format = new_format.clone();
        self.header.magic = new_format.magic;
        self.header.alignment_units = alignment_units(partition.alignment_bytes());
        self.header.transaction_id = new_transaction_id;
        self.calculate_checksum_from_flash(partition)
    }

    /// Write this entry's header followed by the original key and value bytes
    /// streamed from the current address. Returns the bytes written.
    pub fn copy<F: FlashPartition + ?Sized>(&self, partition: &mut F, new_address: Address) -> Result<usize> {
        debug!(
            from = self.address,
            to = new_address,
            transaction_id = self.header.transaction_id,
            "Copying entry"
        );

        let mut writer = AlignedWriter::new(new_address, self.alignment_bytes());
        writer.write(partition, &self.header.to_bytes())?;

        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        let mut read_address = self.address + HEADER_SIZE as Address;
        let mut remaining = self.key_length() + self.value_size();
        while remaining > 0 {
            let n = remaining.min(buffer.len());
            partition.read(read_address, &mut buffer[..n])?;
            writer.write(partition, &buffer[..n])?;
            read_address += n as Address;
            remaining -= n;
        }

        writer.flush(partition)
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Read this entry's key into `out`
    pub fn read_key<F: FlashPartition + ?Sized>(&self, partition: &F, out: &mut KeyBuffer) -> Result<usize> {
        Self::read_key_at(partition, self.address, self.key_length(), out)
    }

    /// Read the value starting at `offset` into `buffer`.
    ///
    /// Returns:
    /// - `Ok(n)` — the rest of the value was read
    /// - `OutOfRange` — `offset` is past the end of the value
    /// - `BufferTooSmall` — `buffer` was filled but more bytes remain
    pub fn read_value<F: FlashPartition + ?Sized>(
        &self,
        partition: &F,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<usize> {
        let value_size = self.value_size();
        if offset > value_size {
            return Err(KvsError::OutOfRange(format!(
                "offset {} past value of {} bytes",
                offset, value_size
            )));
        }

        let remaining = value_size - offset;
        let read_size = buffer.len().min(remaining);
        let address = self.value_address() + offset as Address;
        partition.read(address, &mut buffer[..read_size])?;

        if read_size != remaining {
            return Err(KvsError::BufferTooSmall {
                copied: read_size,
                value_size,
            });
        }
        Ok(read_size)
    }

    /// Compare `value` with the stored value; `NotFound` if they differ
    pub fn value_matches<F: FlashPartition + ?Sized>(&self, partition: &F, value: &[u8]) -> Result<()> {
        if self.value_size() != value.len() {
            return Err(KvsError::NotFound);
        }

        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        let mut address = self.value_address();
        for chunk in value.chunks(STREAM_BUFFER_SIZE) {
            let stored = &mut buffer[..chunk.len()];
            partition.read(address, stored)?;
            if stored != chunk {
                return Err(KvsError::NotFound);
            }
            address += chunk.len() as Address;
        }
        Ok(())
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Verify the stored checksum against a key and value held in RAM
    pub fn verify_checksum(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let algo = match &self.format.checksum {
            Some(algo) => algo,
            None => return self.verify_no_checksum(),
        };

        let digest = self.calculate_checksum(algo.as_ref(), key, value);
        if algo.matches(&digest, &self.header.checksum.to_le_bytes()) {
            Ok(())
        } else {
            Err(KvsError::DataLoss(format!(
                "checksum mismatch for entry at {:#x}",
                self.address
            )))
        }
    }

    /// Re-read the whole entry from flash and verify its checksum
    pub fn verify_checksum_in_flash<F: FlashPartition + ?Sized>(&self, partition: &F) -> Result<()> {
        let mut bytes_to_read = self.size();
        if self.address as usize + bytes_to_read > partition.size_bytes() {
            return Err(KvsError::DataLoss(format!(
                "entry at {:#x} of {} bytes runs past the partition",
                self.address, bytes_to_read
            )));
        }

        let mut buffer = [0u8; 2 * HEADER_SIZE];
        let mut read_address = self.address;
        let mut read_size = buffer.len().min(bytes_to_read);
        partition.read(read_address, &mut buffer[..read_size])?;

        let checksum_bytes = &buffer[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4];
        let stored = u32::from_le_bytes([
            checksum_bytes[0],
            checksum_bytes[1],
            checksum_bytes[2],
            checksum_bytes[3],
        ]);
        if stored != self.header.checksum {
            error!(
                address = self.address,
                expected = %format_args!("{:#010x}", self.header.checksum),
                actual = %format_args!("{:#010x}", stored),
                "Checksum in flash does not match entry header"
            );
            return Err(KvsError::DataLoss(format!(
                "checksum at {:#x} changed on flash",
                self.address
            )));
        }

        let algo = match &self.format.checksum {
            Some(algo) => algo,
            None => return self.verify_no_checksum(),
        };

        // Hash as if the checksum field were zero; flash itself is untouched.
        buffer[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);

        let mut state = algo.begin();
        loop {
            state.update(&buffer[..read_size]);
            bytes_to_read -= read_size;
            if bytes_to_read == 0 {
                break;
            }
            read_address += read_size as Address;
            read_size = buffer.len().min(bytes_to_read);
            partition.read(read_address, &mut buffer[..read_size])?;
        }

        let digest = state.finish();
        if algo.matches(&digest, &self.header.checksum.to_le_bytes()) {
            Ok(())
        } else {
            error!(address = self.address, "Entry checksum verification failed");
            Err(KvsError::DataLoss(format!(
                "checksum mismatch for entry at {:#x}",
                self.address
            )))
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn format(&self) -> &EntryFormat {
        &self.format
    }

    pub fn magic(&self) -> u32 {
        self.header.magic
    }

    pub fn checksum(&self) -> u32 {
        self.header.checksum
    }

    pub fn transaction_id(&self) -> u32 {
        self.header.transaction_id
    }

    pub fn key_length(&self) -> usize {
        self.header.key_length_bytes as usize
    }

    /// Value length; zero for a tombstone
    pub fn value_size(&self) -> usize {
        self.header.value_size()
    }

    pub fn deleted(&self) -> bool {
        self.header.deleted()
    }

    pub fn alignment_bytes(&self) -> usize {
        self.header.alignment_bytes()
    }

    /// Header + key + value, without padding
    pub fn content_size(&self) -> usize {
        HEADER_SIZE + self.key_length() + self.value_size()
    }

    /// Total size on flash including padding
    pub fn size(&self) -> usize {
        align_up(self.content_size(), self.alignment_bytes())
    }

    pub fn next_address(&self) -> Address {
        self.address + self.size() as Address
    }

    pub fn descriptor(&self, key: &[u8]) -> KeyDescriptor {
        self.descriptor_for_hash(hash(key))
    }

    pub fn descriptor_for_hash(&self, key_hash: u32) -> KeyDescriptor {
        let state = if self.deleted() {
            EntryState::Deleted
        } else {
            EntryState::Valid
        };
        KeyDescriptor::new(key_hash, self.header.transaction_id, state)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn value_address(&self) -> Address {
        self.address + (HEADER_SIZE + self.key_length()) as Address
    }

    fn verify_no_checksum(&self) -> Result<()> {
        if self.header.checksum == 0 {
            Ok(())
        } else {
            Err(KvsError::DataLoss(format!(
                "entry at {:#x} expects no checksum but stores {:#010x}",
                self.address, self.header.checksum
            )))
        }
    }

    fn calculate_checksum(&self, algo: &dyn ChecksumAlgorithm, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut state = algo.begin();
        state.update(&self.header.to_bytes_for_checksum());
        state.update(key);
        state.update(value);
        self.add_padding_bytes_to_checksum(state.as_mut());
        state.finish()
    }

    fn calculate_checksum_from_flash<F: FlashPartition + ?Sized>(&mut self, partition: &F) -> Result<()> {
        self.header.checksum = 0;

        let algo = match self.format.checksum.clone() {
            Some(algo) => algo,
            None => return Ok(()),
        };

        let mut state = algo.begin();
        state.update(&self.header.to_bytes());

        // Padding is not read: the alignment may have just changed.
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        let mut address = self.address + HEADER_SIZE as Address;
        let end = self.address + self.content_size() as Address;
        while address < end {
            let n = ((end - address) as usize).min(buffer.len());
            partition.read(address, &mut buffer[..n])?;
            state.update(&buffer[..n]);
            address += n as Address;
        }

        self.add_padding_bytes_to_checksum(state.as_mut());
        let digest = state.finish();
        self.header.checksum = checksum_field(&digest);
        Ok(())
    }

    fn add_padding_bytes_to_checksum(&self, state: &mut dyn ChecksumState) {
        const PADDING: [u8; MIN_ALIGNMENT_BYTES] = [0u8; MIN_ALIGNMENT_BYTES];
        let mut padding = self.size() - self.content_size();
        while padding > 0 {
            let n = padding.min(PADDING.len());
            state.update(&PADDING[..n]);
            padding -= n;
        }
    }
}

/// Left-justify a digest into the 4-byte header field
fn checksum_field(digest: &[u8]) -> u32 {
    let mut field = [0u8; 4];
    let n = digest.len().min(field.len());
    field[..n].copy_from_slice(&digest[..n]);
    u32::from_le_bytes(field)
}
