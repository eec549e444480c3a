//! Store initialization: rebuilding the index from flash
//!
//! ## Scan
//! ```text
//! for each sector:
//!   ┌────────┬────────┬──────────┬────────┬─────────────┐
//!   │ entry  │ entry  │ garbage  │ entry  │ 0xFF 0xFF … │
//!   └────────┴────────┴──────────┴────────┴─────────────┘
//!     load ──► load ──► scan for ──► load ──► erased: stop
//!                       known magic
//! ```
//! A sector with garbage is marked corrupt: its valid entries stay readable
//! but nothing new is written there until it is garbage collected.

use tracing::{debug, info, warn};

use super::{KeyValueStore, StoreState};
use crate::config::ErrorRecovery;
use crate::entry::{
    alignment_bytes_from_units, alignment_units, Entry, MAX_KEY_LENGTH, MIN_ALIGNMENT_BYTES,
};
use crate::error::{KvsError, Result};
use crate::flash::{align_up, Address, FlashPartition};

impl<F: FlashPartition> KeyValueStore<F> {
    /// Load the index from flash and repair what the recovery policy allows.
    ///
    /// Returns `DataLoss` if corruption was found and could not be repaired;
    /// the store then accepts reads but not writes.
    pub fn init(&mut self) -> Result<()> {
        self.state = StoreState::NotInitialized;
        self.error_detected = false;
        self.last_transaction_id = 0;

        let sector_count = self.partition.sector_count();
        let sector_size = self.partition.sector_size_bytes();

        // Step 1: Check the partition can hold a store
        if sector_count < 2 {
            return Err(KvsError::FailedPrecondition(format!(
                "store needs at least 2 sectors, partition has {}",
                sector_count
            )));
        }
        if self.config.redundancy == 0 || self.config.redundancy >= sector_count {
            return Err(KvsError::FailedPrecondition(format!(
                "redundancy {} needs between 1 and {} copies on {} sectors",
                self.config.redundancy,
                sector_count - 1,
                sector_count
            )));
        }

        let alignment = self.partition.alignment_bytes();
        let entry_alignment = alignment_bytes_from_units(alignment_units(alignment));
        if alignment == 0 || entry_alignment % alignment != 0 || sector_size % entry_alignment != 0 {
            return Err(KvsError::FailedPrecondition(format!(
                "write alignment of {} bytes does not divide the {} byte entry alignment \
                 and {} byte sectors",
                alignment, entry_alignment, sector_size
            )));
        }

        info!(sector_count, sector_size, alignment, "Initializing key-value store");

        // Step 2: Rebuild the cache and sector accounting
        let metadata_result = self.initialize_metadata();

        // Step 3: Repair what was found, if policy allows
        if !self.error_detected {
            self.state = StoreState::Ready;
        } else {
            self.state = StoreState::NeedsMaintenance;

            if self.config.recovery != ErrorRecovery::Manual {
                let pre_fix_redundancy_errors = self.counters.missing_redundant_entries_recovered;
                match self.fix_errors() {
                    Ok(()) => {
                        if matches!(metadata_result, Err(KvsError::OutOfRange(_))) {
                            // A redundancy increase is not a repair.
                            self.counters.missing_redundant_entries_recovered = pre_fix_redundancy_errors;
                            info!(redundancy = self.redundancy(), "Redundancy level updated");
                        } else {
                            warn!("Corruption detected and fully repaired");
                        }
                        self.state = StoreState::Ready;
                    }
                    Err(e) if e.is_resource_exhausted() => {
                        warn!("Unable to maintain required free sector");
                    }
                    Err(e) => {
                        warn!(error = %e, "Corruption detected and unable to repair");
                    }
                }
            } else {
                warn!("Corruption detected; no repair attempted under manual recovery");
            }
        }

        info!(
            keys = self.cache.present_entries(),
            total_entries = self.cache.total_entries(),
            last_transaction_id = self.last_transaction_id,
            state = ?self.state,
            "Key-value store initialized"
        );

        if self.error_detected {
            return Err(KvsError::DataLoss(
                "corruption found during init was not repaired".to_string(),
            ));
        }
        Ok(())
    }

    /// Scan every sector into the cache, then account valid bytes per sector.
    ///
    /// Returns `OutOfRange` when the only problem is that every key has fewer
    /// copies than configured, i.e. redundancy was raised.
    fn initialize_metadata(&mut self) -> Result<()> {
        let sector_size = self.partition.sector_size_bytes();

        self.sectors.reset();
        self.cache.reset();

        let mut total_corrupt_bytes = 0usize;
        let mut corrupt_entries = 0usize;
        let mut empty_sector_found = false;
        let mut entry_copies_missing = 0usize;

        for index in 0..self.sectors.len() {
            let base = self.sectors.base_address(index);
            let mut entry_address = base;
            let mut sector_corrupt_bytes = 0usize;

            while self.sectors.address_in_sector(index, entry_address) {
                match self.load_entry(index, entry_address) {
                    Ok(next) => entry_address = next,
                    // Erased flash: the rest of the sector is free.
                    Err(KvsError::NotFound) => break,
                    Err(e) => {
                        warn!(
                            address = entry_address,
                            error = %e,
                            "Unreadable entry; scanning for the next one"
                        );
                        self.error_detected = true;
                        corrupt_entries += 1;

                        match self.scan_for_entry(index, entry_address + MIN_ALIGNMENT_BYTES as Address) {
                            Some(next) => {
                                sector_corrupt_bytes += (next - entry_address) as usize;
                                entry_address = next;
                            }
                            None => {
                                sector_corrupt_bytes += sector_size - (entry_address - base) as usize;
                                entry_address = base + sector_size as Address;
                                break;
                            }
                        }
                    }
                }
            }

            let used = ((entry_address - base) as usize).min(sector_size);
            let sector = self.sectors.get_mut(index);
            sector.set_writable_bytes(sector_size - used);

            if sector_corrupt_bytes > 0 {
                // Keep valid entries readable but stop new writes landing here.
                sector.mark_corrupt();
                self.error_detected = true;
                total_corrupt_bytes += sector_corrupt_bytes;
            }

            if sector.empty(sector_size) {
                empty_sector_found = true;
            }
        }

        // Count valid bytes per sector, drop copies that no longer read, and
        // find the newest entry to resume the sector rotation from.
        let mut newest_address: Option<Address> = None;
        for index in 0..self.cache.total_entries() {
            let addresses = self.cache.metadata(index).addresses().to_vec();
            if addresses.len() < self.redundancy() {
                entry_copies_missing += 1;
            }

            for address in addresses {
                match Entry::read(&self.partition, address, &self.formats) {
                    Ok(entry) => self.sectors.from_address_mut(address).add_valid_bytes(entry.size()),
                    Err(e) => {
                        warn!(address, error = %e, "Dropping unreadable copy");
                        corrupt_entries += 1;
                        self.cache.metadata_mut(index).remove_address(address);
                        let sector = self.sectors.from_address_mut(address);
                        if !sector.corrupt() {
                            sector.mark_corrupt();
                            self.error_detected = true;
                        }
                    }
                }
            }

            let metadata = self.cache.metadata(index);
            if metadata.transaction_id() > self.last_transaction_id {
                self.last_transaction_id = metadata.transaction_id();
                newest_address = metadata.addresses().iter().last().or(newest_address);
            }
        }

        if let Some(address) = newest_address {
            self.sectors.set_last_new_sector(address);
        }

        if !empty_sector_found {
            warn!("No empty sector found");
            self.error_detected = true;
        }

        if entry_copies_missing > 0 {
            let other_errors = self.error_detected;
            self.error_detected = true;

            if !other_errors && entry_copies_missing == self.cache.total_entries() {
                info!(
                    redundancy = self.redundancy(),
                    "Store configuration changed to a higher redundancy"
                );
                return Err(KvsError::OutOfRange(
                    "every key is missing redundant copies".to_string(),
                ));
            }
        }

        if self.error_detected {
            warn!(
                corrupt_entries,
                total_corrupt_bytes,
                entry_copies_missing,
                "Corruption found during init"
            );
            return Err(KvsError::DataLoss(format!(
                "{} corrupt entries, {} corrupt bytes",
                corrupt_entries, total_corrupt_bytes
            )));
        }
        Ok(())
    }

    /// Validate the entry at `address` and add it to the cache.
    /// Returns the address just past it.
    fn load_entry(&mut self, sector: usize, address: Address) -> Result<Address> {
        let entry = Entry::read(&self.partition, address, &self.formats)?;

        // Reading the key and verifying the checksum reads the whole entry.
        let mut key_buffer = [0u8; MAX_KEY_LENGTH];
        let key_length = entry.read_key(&self.partition, &mut key_buffer)?;
        entry.verify_checksum_in_flash(&self.partition)?;

        let next_address = entry.next_address();
        if !self.sectors.address_in_sector(sector, next_address - 1) {
            return Err(KvsError::DataLoss(format!(
                "entry at {:#x} crosses the end of its sector",
                address
            )));
        }

        self.cache.add_new_or_update_existing(
            entry.descriptor(&key_buffer[..key_length]),
            address,
            self.partition.sector_size_bytes(),
        )?;
        Ok(next_address)
    }

    /// Find the next aligned address in `sector` holding a known magic
    fn scan_for_entry(&self, sector: usize, start_address: Address) -> Option<Address> {
        let mut address = align_up(start_address as usize, MIN_ALIGNMENT_BYTES) as Address;

        while self.sectors.address_in_sector(sector, address) {
            let mut magic = [0u8; 4];
            if self.partition.read(address, &mut magic).is_ok()
                && self.formats.known_magic(u32::from_le_bytes(magic))
            {
                debug!(address, "Found entry magic while scanning");
                return Some(address);
            }
            address += MIN_ALIGNMENT_BYTES as Address;
        }
        None
    }
}
