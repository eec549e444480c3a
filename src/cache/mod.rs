//! EntryCache Module
//!
//! In-memory index from key hash to descriptor and flash addresses.
//!
//! ## Memory Layout
//! ```text
//! descriptors: [ d0 ][ d1 ][ d2 ] ...                 (max_entries)
//! addresses:   [ d0.0 d0.1 ][ d1.0 d1.1 ][ d2.0 ... ] (max_entries * redundancy)
//! ```
//! Both arrays are sized once at construction. Keys are never kept in RAM:
//! a lookup hashes the key, finds the descriptor, then reads the key back
//! from flash to rule out hash collisions.
//!
//! Damaged copies found during a lookup are skipped and their sector is
//! marked corrupt. A lookup only fails with `DataLoss` when no copy survives.

mod metadata;

pub use metadata::{AddressList, EntryMetadata, EntryMetadataMut, Lookup};

use tracing::{debug, error, warn};

use crate::entry::{hash, Entry, EntryFormats, KeyBuffer, KeyDescriptor, MAX_KEY_LENGTH};
use crate::error::{KvsError, Result};
use crate::flash::{Address, FlashPartition};
use crate::sectors::Sectors;

/// Index of every key known to the store
#[derive(Debug, Clone)]
pub struct EntryCache {
    descriptors: Vec<KeyDescriptor>,
    addresses: Vec<Option<Address>>,
    max_entries: usize,
    redundancy: usize,
}

impl EntryCache {
    /// Create an empty cache for `max_entries` keys with `redundancy` copies each
    pub fn new(max_entries: usize, redundancy: usize) -> Self {
        let redundancy = redundancy.max(1);
        Self {
            descriptors: Vec::with_capacity(max_entries),
            addresses: vec![None; max_entries * redundancy],
            max_entries,
            redundancy,
        }
    }

    pub fn reset(&mut self) {
        self.descriptors.clear();
        self.addresses.fill(None);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find the cached entry for `key`.
    ///
    /// Returns:
    /// - `Ok(metadata)` — at least one copy holds `key`
    /// - `NotFound` — no key with this hash is cached
    /// - `AlreadyExists` — a different key shares this key's hash
    /// - `DataLoss` — every copy is unreadable
    pub fn find<'a, F: FlashPartition + ?Sized>(
        &'a self,
        partition: &F,
        sectors: &mut Sectors,
        formats: &EntryFormats,
        key: &[u8],
    ) -> Lookup<'a> {
        let key_hash = hash(key);
        let mut error_count = 0;

        let Some(index) = self.find_index(key_hash) else {
            return Lookup {
                outcome: Err(KvsError::NotFound),
                error_count,
            };
        };

        let metadata = self.metadata(index);
        for address in metadata.addresses().iter() {
            let mut key_buffer: KeyBuffer = [0u8; MAX_KEY_LENGTH];

            // First attempt trusts the header; the second re-verifies the whole entry.
            let read = match read_stored_key(partition, formats, address, &mut key_buffer, false) {
                Ok(len) if hash(&key_buffer[..len]) == key_hash => Ok(len),
                _ => {
                    error_count += 1;
                    warn!(address, key_hash, "Key mismatch at cached address; verifying entry in flash");
                    read_stored_key(partition, formats, address, &mut key_buffer, true)
                }
            };

            match read {
                Ok(len) if hash(&key_buffer[..len]) == key_hash => {
                    let outcome = if &key_buffer[..len] == key {
                        Ok(metadata)
                    } else {
                        debug!(key_hash, "Different key with the same hash");
                        Err(KvsError::AlreadyExists)
                    };
                    return Lookup {
                        outcome,
                        error_count,
                    };
                }
                _ => {
                    error!(address, key_hash, "Entry copy is corrupt; marking sector");
                    sectors.from_address_mut(address).mark_corrupt();
                }
            }
        }

        Lookup {
            outcome: Err(KvsError::DataLoss(format!(
                "no readable copy of key with hash {:#010x}",
                key_hash
            ))),
            error_count,
        }
    }

    /// Position of the descriptor with this hash
    pub fn find_index(&self, key_hash: u32) -> Option<usize> {
        self.descriptors.iter().position(|d| d.key_hash == key_hash)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Append a descriptor for a key not yet in the cache
    pub fn add_new(&mut self, descriptor: KeyDescriptor, address: Address) -> Result<EntryMetadata<'_>> {
        if self.full() {
            return Err(KvsError::ResourceExhausted(format!(
                "entry cache holds its maximum of {} keys",
                self.max_entries
            )));
        }
        let index = self.descriptors.len();
        self.descriptors.push(descriptor);
        self.slots_mut(index).fill(None);
        self.slots_mut(index)[0] = Some(address);
        Ok(self.metadata(index))
    }

    /// Record an entry found on flash, keeping whichever copy is freshest.
    ///
    /// Returns:
    /// - `ResourceExhausted` — a new key and the cache is full
    /// - `DataLoss` — another key already holds this transaction id, or a second
    ///   copy in a sector that already holds one
    pub fn add_new_or_update_existing(
        &mut self,
        descriptor: KeyDescriptor,
        address: Address,
        sector_size_bytes: usize,
    ) -> Result<()> {
        // Every write gets its own transaction id, so a different key with the
        // same id means one of the two headers is damaged.
        if let Some(other) = self.descriptors.iter().find(|d| {
            d.transaction_id == descriptor.transaction_id && d.key_hash != descriptor.key_hash
        }) {
            error!(
                transaction_id = descriptor.transaction_id,
                key_hash = %format_args!("{:#010x}", descriptor.key_hash),
                other_hash = %format_args!("{:#010x}", other.key_hash),
                "Entries for different keys share a transaction id"
            );
            return Err(KvsError::DataLoss(format!(
                "transaction {} recorded for two different keys",
                descriptor.transaction_id
            )));
        }

        let Some(index) = self.find_index(descriptor.key_hash) else {
            self.add_new(descriptor, address)?;
            return Ok(());
        };

        let existing = self.descriptors[index];

        if existing.transaction_id > descriptor.transaction_id {
            debug!(
                key_hash = descriptor.key_hash,
                stale = descriptor.transaction_id,
                current = existing.transaction_id,
                "Ignoring stale entry"
            );
            return Ok(());
        }

        if existing.transaction_id < descriptor.transaction_id {
            self.metadata_mut(index).reset(descriptor, address);
            return Ok(());
        }

        // Same transaction: another copy of the same write.
        let new_sector = address as usize / sector_size_bytes;
        let same_sector = self
            .metadata(index)
            .addresses()
            .iter()
            .any(|existing| existing as usize / sector_size_bytes == new_sector);
        if same_sector {
            error!(
                address,
                sector = new_sector,
                "Redundant copy in the same sector as another copy"
            );
            return Err(KvsError::DataLoss(format!(
                "two copies of key {:#010x} in sector {}",
                descriptor.key_hash, new_sector
            )));
        }

        self.metadata_mut(index).add_new_address(address);
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove the descriptor at `index` by moving the last one into its place.
    ///
    /// Returns `index`, where iteration should continue.
    pub fn remove_entry(&mut self, index: usize) -> usize {
        let last = self.descriptors.len() - 1;
        self.descriptors.swap_remove(index);
        if index != last {
            let r = self.redundancy;
            self.addresses
                .copy_within(last * r..(last + 1) * r, index * r);
        }
        self.slots_mut(last).fill(None);
        index
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn metadata(&self, index: usize) -> EntryMetadata<'_> {
        EntryMetadata::new(index, &self.descriptors[index], self.slots(index))
    }

    pub fn metadata_mut(&mut self, index: usize) -> EntryMetadataMut<'_> {
        let r = self.redundancy;
        let slots = &mut self.addresses[index * r..(index + 1) * r];
        EntryMetadataMut::new(&mut self.descriptors[index], slots)
    }

    pub fn iter(&self) -> impl Iterator<Item = EntryMetadata<'_>> {
        (0..self.descriptors.len()).map(move |index| self.metadata(index))
    }

    pub fn full(&self) -> bool {
        self.descriptors.len() >= self.max_entries
    }

    /// Keys tracked, including deleted ones
    pub fn total_entries(&self) -> usize {
        self.descriptors.len()
    }

    /// Keys that currently hold a value
    pub fn present_entries(&self) -> usize {
        self.descriptors.iter().filter(|d| !d.deleted()).count()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    fn slots(&self, index: usize) -> &[Option<Address>] {
        let r = self.redundancy;
        &self.addresses[index * r..(index + 1) * r]
    }

    fn slots_mut(&mut self, index: usize) -> &mut [Option<Address>] {
        let r = self.redundancy;
        &mut self.addresses[index * r..(index + 1) * r]
    }
}

/// Read the key stored at `address`, optionally verifying the entry first
fn read_stored_key<F: FlashPartition + ?Sized>(
    partition: &F,
    formats: &EntryFormats,
    address: Address,
    out: &mut KeyBuffer,
    verify: bool,
) -> Result<usize> {
    let entry = Entry::read(partition, address, formats)?;
    if verify {
        entry.verify_checksum_in_flash(partition)?;
    }
    entry.read_key(partition, out)
}
