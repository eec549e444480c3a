//! Write path: put, delete and the entry append machinery

use tracing::{debug, error, warn};

use super::KeyValueStore;
use crate::config::{ErrorRecovery, GcOnWrite};
use crate::entry::{Entry, EntryState, MAX_VALUE_SIZE};
use crate::error::{KvsError, Result};
use crate::flash::{Address, FlashPartition};

impl<F: FlashPartition> KeyValueStore<F> {
    /// Store `value` under `key`, replacing any previous value
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_write_operation(key)?;

        if value.len() > MAX_VALUE_SIZE {
            return Err(KvsError::InvalidArgument(format!(
                "value of {} bytes exceeds the maximum of {}",
                value.len(),
                MAX_VALUE_SIZE
            )));
        }
        let entry_size = Entry::size_for(&self.partition, key, value);
        if entry_size > self.partition.sector_size_bytes() {
            debug!(
                key_length = key.len(),
                value_length = value.len(),
                "Entry cannot fit in one sector"
            );
            return Err(KvsError::InvalidArgument(format!(
                "entry of {} bytes does not fit in a {} byte sector",
                entry_size,
                self.partition.sector_size_bytes()
            )));
        }

        let result = match self.find_entry(key) {
            Ok(index) => self.write_entry_for_existing_key(index, EntryState::Valid, key, value),
            Err(KvsError::NotFound) => self.write_entry_for_new_key(key, value),
            Err(e) => Err(e),
        };
        self.recover_if_immediate();
        result
    }

    /// Remove `key` by writing a tombstone
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_write_operation(key)?;

        let result = self
            .find_existing(key)
            .and_then(|index| self.write_entry_for_existing_key(index, EntryState::Deleted, key, &[]));
        self.recover_if_immediate();
        result
    }

    // =========================================================================
    // Entry Writing
    // =========================================================================

    fn write_entry_for_existing_key(
        &mut self,
        index: usize,
        new_state: EntryState,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        // The prior entry's size is needed for sector accounting.
        let prior_entry = self.read_entry(index)?;
        self.write_entry(key, value, new_state, Some((index, prior_entry)))
    }

    fn write_entry_for_new_key(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.cache.full() {
            warn!(
                max_entries = self.cache.max_entries(),
                "Entry cache is full; cannot add a new key"
            );
            return Err(KvsError::ResourceExhausted(format!(
                "store already holds its maximum of {} keys",
                self.cache.max_entries()
            )));
        }
        self.write_entry(key, value, EntryState::Valid, None)
    }

    fn write_entry(
        &mut self,
        key: &[u8],
        value: &[u8],
        new_state: EntryState,
        prior: Option<(usize, Entry)>,
    ) -> Result<()> {
        // Only a byte comparison proves equality; checksums only prove difference.
        if let Some((index, prior_entry)) = &prior {
            if prior_entry.value_size() == value.len()
                && self.cache.metadata(*index).state() == new_state
                && prior_entry.value_matches(&self.partition, value).is_ok()
            {
                debug!(
                    key_hash = %format_args!("{:#010x}", self.cache.metadata(*index).hash()),
                    "Write with matching value skipped"
                );
                return Ok(());
            }
        }

        let entry_size = Entry::size_for(&self.partition, key, value);
        let reserved = self.get_addresses_for_write(entry_size)?;

        let mut entry = self.create_entry(reserved[0], key, value, new_state)?;
        self.append_entry(&entry, key, value)?;

        // Once the first copy is on flash the prior entry is stale.
        let index = match prior {
            Some((index, prior_entry)) => {
                self.update_key_descriptor(&entry, entry.address(), index, prior_entry.size());
                index
            }
            None => self.cache.add_new(entry.descriptor(key), entry.address())?.index(),
        };

        for &address in &reserved[1..] {
            entry.set_address(address);
            self.append_entry(&entry, key, value)?;
            self.cache.metadata_mut(index).add_new_address(address);
        }
        Ok(())
    }

    /// Point the cached key at `new_address` and retire the prior copies' bytes
    pub(super) fn update_key_descriptor(
        &mut self,
        entry: &Entry,
        new_address: Address,
        index: usize,
        prior_size: usize,
    ) {
        let metadata = self.cache.metadata(index);
        let key_hash = metadata.hash();
        for address in metadata.addresses().to_vec() {
            self.sectors
                .from_address_mut(address)
                .remove_valid_bytes(prior_size);
        }
        self.cache
            .metadata_mut(index)
            .reset(entry.descriptor_for_hash(key_hash), new_address);
    }

    /// Next transaction id. Ids are burned even when the write later fails,
    /// so an id is never reused for different content.
    pub(super) fn next_transaction_id(&mut self) -> Result<u32> {
        if self.last_transaction_id == u32::MAX {
            error!("Transaction ids exhausted");
            return Err(KvsError::ResourceExhausted(
                "transaction id counter is at its maximum".to_string(),
            ));
        }
        self.last_transaction_id += 1;
        Ok(self.last_transaction_id)
    }

    fn create_entry(&mut self, address: Address, key: &[u8], value: &[u8], state: EntryState) -> Result<Entry> {
        let transaction_id = self.next_transaction_id()?;
        let format = self.formats.primary();
        Ok(match state {
            EntryState::Valid => Entry::valid(&self.partition, address, format, key, value, transaction_id),
            EntryState::Deleted => Entry::tombstone(&self.partition, address, format, key, transaction_id),
        })
    }

    fn append_entry(&mut self, entry: &Entry, key: &[u8], value: &[u8]) -> Result<()> {
        let sector = self.sectors.index_of(entry.address());

        let written = match entry.write(&mut self.partition, key, value) {
            Ok(written) => written,
            Err(e) => {
                error!(
                    address = entry.address(),
                    size = entry.size(),
                    error = %e,
                    "Failed to write entry"
                );
                return Err(self.mark_sector_corrupt(sector, e));
            }
        };

        if self.config.verify_on_write {
            if let Err(e) = entry.verify_checksum_in_flash(&self.partition) {
                return Err(self.mark_sector_corrupt(sector, e));
            }
        }

        let descriptor = self.sectors.get_mut(sector);
        descriptor.remove_writable_bytes(written);
        descriptor.add_valid_bytes(written);
        Ok(())
    }

    /// Copy an existing entry to `new_address` in `sector`
    pub(super) fn copy_entry_to_sector(&mut self, entry: &Entry, sector: usize, new_address: Address) -> Result<()> {
        let written = match entry.copy(&mut self.partition, new_address) {
            Ok(written) => written,
            Err(e) => return Err(self.mark_sector_corrupt(sector, e)),
        };
        self.sectors.get_mut(sector).remove_writable_bytes(written);

        if self.config.verify_on_write {
            let verified = Entry::read(&self.partition, new_address, &self.formats)
                .and_then(|copy| copy.verify_checksum_in_flash(&self.partition));
            if let Err(e) = verified {
                error!(address = new_address, error = %e, "Copied entry failed verification");
                return Err(e);
            }
        }

        self.sectors.get_mut(sector).add_valid_bytes(written);
        Ok(())
    }

    fn mark_sector_corrupt(&mut self, sector: usize, cause: KvsError) -> KvsError {
        error!(sector, error = %cause, "Marking sector corrupt");
        self.sectors.get_mut(sector).mark_corrupt();
        self.error_detected = true;
        cause
    }

    // =========================================================================
    // Space Reservation
    // =========================================================================

    /// Reserve one address per copy, each in a different sector
    pub(super) fn get_addresses_for_write(&mut self, write_size: usize) -> Result<Vec<Address>> {
        let mut reserved = Vec::with_capacity(self.redundancy());
        for _ in 0..self.redundancy() {
            let sector = self.get_sector_for_write(write_size, &reserved)?;
            let address = self.sectors.next_writable_address(sector);
            debug!(sector, address, "Found space for entry");
            reserved.push(address);
        }
        Ok(reserved)
    }

    /// Find a sector for `entry_size` bytes, garbage collecting as policy allows
    pub(super) fn get_sector_for_write(&mut self, entry_size: usize, reserved: &[Address]) -> Result<usize> {
        let mut result = self.sectors.find_space(entry_size, reserved);
        let mut do_auto_gc = self.config.gc_on_write != GcOnWrite::Disabled;

        // Lazy recovery runs before the first collection a write triggers.
        if result.is_err()
            && do_auto_gc
            && reserved.is_empty()
            && self.error_detected
            && self.config.recovery == ErrorRecovery::Lazy
        {
            if let Err(e) = self.fix_errors() {
                warn!(error = %e, "Repair before garbage collection failed");
            }
            result = self.sectors.find_space(entry_size, reserved);
        }

        let mut gc_sector_count = 0;
        while matches!(result, Err(KvsError::ResourceExhausted(_))) && do_auto_gc {
            if self.config.gc_on_write == GcOnWrite::OneSector {
                do_auto_gc = false;
            }

            match self.garbage_collect(reserved) {
                Ok(()) => {}
                Err(KvsError::NotFound) => {
                    return Err(KvsError::ResourceExhausted(
                        "partition is full and nothing is reclaimable".to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }

            result = self.sectors.find_space(entry_size, reserved);
            gc_sector_count += 1;

            // Room for every sector plus a couple of rounds moving other keys aside.
            if gc_sector_count > self.partition.sector_count() + 2 {
                error!(gc_sector_count, "Garbage collected more sectors than exist");
                return Err(KvsError::ResourceExhausted(
                    "garbage collection did not free enough space".to_string(),
                ));
            }
        }

        if result.is_err() {
            warn!(entry_size, "Unable to find sector to write entry");
        }
        result
    }
}
