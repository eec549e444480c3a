//! Garbage collection, repair and maintenance
//!
//! ## Garbage Collecting a Sector
//! ```text
//!   victim sector                       destination sectors
//! ┌──────┬───────┬──────┬───────┐     ┌──────┬──────┬──────────┐
//! │ live │ stale │ live │ stale │ ──► │ live │ live │   free   │
//! └──────┴───────┴──────┴───────┘     └──────┴──────┴──────────┘
//!           then erase the victim: every byte is writable again
//! ```

use tracing::{debug, error, info, warn};

use super::{KeyValueStore, StoreState};
use crate::config::ErrorRecovery;
use crate::entry::Entry;
use crate::error::{KvsError, Result};
use crate::flash::{Address, FlashPartition};

/// Share of the partition in use above which full maintenance collects every sector
const GC_USAGE_THRESHOLD_PERCENTAGE: usize = 70;

impl<F: FlashPartition> KeyValueStore<F> {
    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Repair if policy allows, then garbage collect one sector.
    ///
    /// Returns `NotFound` if no sector needed collecting.
    pub fn partial_maintenance(&mut self) -> Result<()> {
        self.check_initialized()?;
        self.check_for_errors();

        if self.error_detected && self.config.recovery != ErrorRecovery::Manual {
            self.fix_errors()?;
        }
        self.garbage_collect(&[])
    }

    /// Repair, move entries to the primary format, and collect sectors that
    /// hold only stale entries (every reclaimable sector when usage is high).
    pub fn full_maintenance(&mut self) -> Result<()> {
        self.full_maintenance_helper(false)
    }

    /// Like `full_maintenance`, but collect every sector with reclaimable bytes
    /// and forget deleted keys, freeing their cache slots
    pub fn heavy_maintenance(&mut self) -> Result<()> {
        self.full_maintenance_helper(true)
    }

    fn full_maintenance_helper(&mut self, heavy: bool) -> Result<()> {
        self.check_initialized()?;

        info!(heavy, "Beginning full maintenance");
        self.check_for_errors();

        // Step 1: Repair errors, regardless of the recovery policy
        if self.error_detected {
            self.fix_errors()?;
        }

        // Step 2: Move every entry to the primary format
        let update_result = self.update_entries_to_primary_format();
        let entries_updated = match &update_result {
            Ok(count) => *count,
            Err(e) => {
                error!(error = %e, "Failed to update all entries to the primary format");
                0
            }
        };

        // Step 3: Garbage collect, starting after the newest sector
        let threshold_bytes = self.partition.size_bytes() * GC_USAGE_THRESHOLD_PERCENTAGE / 100;
        let over_usage_threshold = self.storage_stats().in_use_bytes > threshold_bytes;
        let force_gc = heavy || over_usage_threshold || entries_updated > 0;
        let mut gc_result = self.garbage_collect_reclaimable_sectors(force_gc);

        // Step 4: Drop deleted keys. Every older copy of them is erased by now,
        // so their tombstones can go too.
        if heavy && gc_result.is_ok() && update_result.is_ok() && self.remove_deleted_keys() > 0 {
            gc_result = self.garbage_collect_reclaimable_sectors(true);
        }

        let overall = update_result.map(|_| ()).and(gc_result);
        match &overall {
            Ok(()) => info!("Full maintenance complete"),
            Err(_) => error!("Full maintenance finished with errors"),
        }
        overall
    }

    /// Collect every sector with reclaimable bytes, or only those without valid
    /// bytes unless `force_gc`. Stops at the first failure.
    fn garbage_collect_reclaimable_sectors(&mut self, force_gc: bool) -> Result<()> {
        let sector_size = self.partition.sector_size_bytes();
        let count = self.sectors.len();
        let start = self.sectors.last_new() + 1;

        for j in 0..count {
            let index = (start + j) % count;
            let sector = self.sectors.get(index);
            if sector.recoverable_bytes(sector_size) > 0 && (force_gc || sector.valid_bytes() == 0) {
                if let Err(e) = self.garbage_collect_sector(index, &[]) {
                    error!(sector = index, error = %e, "Failed to garbage collect all sectors");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Forget every deleted key, turning its tombstones into reclaimable bytes.
    /// Returns the number of keys removed.
    fn remove_deleted_keys(&mut self) -> usize {
        let mut removed = 0;
        let mut index = 0;

        while index < self.cache.total_entries() {
            if !self.cache.metadata(index).deleted() {
                index += 1;
                continue;
            }

            for address in self.cache.metadata(index).addresses().to_vec() {
                match Entry::read(&self.partition, address, &self.formats) {
                    Ok(tombstone) => self
                        .sectors
                        .from_address_mut(address)
                        .remove_valid_bytes(tombstone.size()),
                    Err(e) => warn!(address, error = %e, "Unreadable tombstone"),
                }
            }

            debug!(
                key_hash = %format_args!("{:#010x}", self.cache.metadata(index).hash()),
                "Removing deleted key"
            );
            index = self.cache.remove_entry(index);
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Removed deleted keys");
        }
        removed
    }

    /// Re-stamp every entry not written with the primary format and write it
    /// anew. Returns the number of entries updated.
    fn update_entries_to_primary_format(&mut self) -> Result<usize> {
        let mut entries_updated = 0;

        for index in 0..self.cache.total_entries() {
            let primary = self.formats.primary().clone();
            if self.read_entry(index)?.magic() == primary.magic {
                continue;
            }

            // The new checksum is computed from flash, so the source must verify first.
            let mut entry = self.read_verified_entry(index)?;

            debug!(
                key_hash = %format_args!("{:#010x}", self.cache.metadata(index).hash()),
                from = %format_args!("{:#010x}", entry.magic()),
                to = %format_args!("{:#010x}", primary.magic),
                "Updating entry to primary format"
            );
            entries_updated += 1;

            let prior_size = entry.size();
            let transaction_id = self.next_transaction_id()?;
            entry.update(&self.partition, &primary, transaction_id)?;

            let reserved = self.get_addresses_for_write(entry.size())?;

            // Reserving space may have relocated the source copy.
            let current = self.read_entry(index)?;
            entry.set_address(current.address());

            let first_sector = self.sectors.index_of(reserved[0]);
            self.copy_entry_to_sector(&entry, first_sector, reserved[0])?;
            self.update_key_descriptor(&entry, reserved[0], index, prior_size);

            for &address in &reserved[1..] {
                let sector = self.sectors.index_of(address);
                self.copy_entry_to_sector(&entry, sector, address)?;
                self.cache.metadata_mut(index).add_new_address(address);
            }
        }

        Ok(entries_updated)
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    /// Garbage collect the best candidate sector. `NotFound` if there is none.
    pub(super) fn garbage_collect(&mut self, reserved: &[Address]) -> Result<()> {
        debug!(reserved = ?reserved, "Garbage collecting a single sector");

        // Step 1: Find the sector to garbage collect
        let Some(sector) = self.sectors.find_sector_to_garbage_collect(reserved) else {
            return Err(KvsError::NotFound);
        };

        // Step 2: Garbage collect the selected sector
        self.garbage_collect_sector(sector, reserved)
    }

    /// Relocate every live copy out of `sector`, then erase it
    pub(super) fn garbage_collect_sector(&mut self, sector: usize, reserved: &[Address]) -> Result<()> {
        debug!(sector, "Garbage collecting sector");
        let sector_size = self.partition.sector_size_bytes();

        // Step 1: Move valid entries to other sectors
        if self.sectors.get(sector).valid_bytes() != 0 {
            for index in 0..self.cache.total_entries() {
                self.relocate_key_addresses_in_sector(sector, index, reserved)?;
            }
        }

        let remaining = self.sectors.get(sector).valid_bytes();
        if remaining != 0 {
            error!(
                sector,
                remaining, "Failed to relocate valid entries from sector being garbage collected"
            );
            return Err(KvsError::Internal(format!(
                "{} valid bytes remain in sector {}",
                remaining, sector
            )));
        }

        // Step 2: Erase the sector; it is unusable until the erase completes
        if !self.sectors.get(sector).empty(sector_size) {
            self.sectors.get_mut(sector).mark_corrupt();
            self.counters.sector_erase_count += 1;
            self.partition.erase(self.sectors.base_address(sector), 1)?;
            self.sectors.get_mut(sector).set_writable_bytes(sector_size);
        }

        debug!(sector, "Garbage collection of sector complete");
        Ok(())
    }

    fn relocate_key_addresses_in_sector(&mut self, sector: usize, index: usize, reserved: &[Address]) -> Result<()> {
        let addresses = self.cache.metadata(index).addresses().to_vec();
        for address in addresses {
            if self.sectors.address_in_sector(sector, address) {
                debug!(
                    key_hash = %format_args!("{:#010x}", self.cache.metadata(index).hash()),
                    sector,
                    "Relocating entry"
                );
                self.relocate_entry(index, address, reserved)?;
            }
        }
        Ok(())
    }

    /// Move the copy at `address` to a sector not holding another copy
    fn relocate_entry(&mut self, index: usize, address: Address, reserved: &[Address]) -> Result<()> {
        let entry = self.read_verified_entry(index)?;

        // Any sector but one already holding this key; the reserved empty
        // sector is allowed since this collection frees a sector.
        let addresses = self.cache.metadata(index).addresses().to_vec();
        let new_sector = self
            .sectors
            .find_space_during_garbage_collection(entry.size(), &addresses, reserved)?;
        let new_address = self.sectors.next_writable_address(new_sector);

        self.copy_entry_to_sector(&entry, new_sector, new_address)?;

        self.sectors.from_address_mut(address).remove_valid_bytes(entry.size());
        self.cache.metadata_mut(index).replace_address(address, new_address);
        Ok(())
    }

    // =========================================================================
    // Repair
    // =========================================================================

    /// Flag errors that are visible from in-memory state alone
    fn check_for_errors(&mut self) {
        if self.sectors.iter().any(|sector| sector.corrupt()) {
            self.error_detected = true;
            return;
        }

        let redundancy = self.redundancy();
        if redundancy > 1
            && self
                .cache
                .iter()
                .any(|metadata| metadata.addresses().len() < redundancy)
        {
            self.error_detected = true;
        }
    }

    /// Run every repair step. Clears the error flag when all succeed.
    pub(super) fn fix_errors(&mut self) -> Result<()> {
        if !self.error_detected {
            return Ok(());
        }
        info!("Repairing detected errors");

        // Step 1: Garbage collect corrupt sectors
        let mut overall = self.repair_corrupt_sectors();

        // Step 2: Keep one sector empty
        let free_sector = self.ensure_free_sector_exists();
        if overall.is_ok() {
            overall = free_sector;
        }

        // Step 3: Restore missing redundant copies
        let redundancy = self.ensure_entry_redundancy();
        if overall.is_ok() {
            overall = redundancy;
        }

        if overall.is_ok() {
            self.error_detected = false;
            self.state = StoreState::Ready;
        }
        overall
    }

    /// Garbage collect each corrupt sector. A second pass retries sectors that
    /// failed, since a later sector may have freed the space they needed.
    fn repair_corrupt_sectors(&mut self) -> Result<()> {
        let mut repair_result = Ok(());

        for _ in 0..2 {
            repair_result = Ok(());

            for sector in 0..self.sectors.len() {
                if !self.sectors.get(sector).corrupt() {
                    continue;
                }
                match self.garbage_collect_sector(sector, &[]) {
                    Ok(()) => self.counters.corrupt_sectors_recovered += 1,
                    Err(e) => {
                        if repair_result.is_ok() {
                            repair_result = Err(e);
                        }
                    }
                }
            }

            if repair_result.is_ok() {
                return Ok(());
            }
        }
        repair_result
    }

    fn ensure_free_sector_exists(&mut self) -> Result<()> {
        let sector_size = self.partition.sector_size_bytes();
        if self.sectors.iter().any(|sector| sector.empty(sector_size)) {
            return Ok(());
        }

        debug!("Garbage collecting to create a free sector");
        match self.garbage_collect(&[]) {
            Err(KvsError::NotFound) => Err(KvsError::ResourceExhausted(
                "no sector can be freed".to_string(),
            )),
            other => other,
        }
    }

    fn ensure_entry_redundancy(&mut self) -> Result<()> {
        let redundancy = self.redundancy();
        if redundancy == 1 {
            return Ok(());
        }

        let mut repair_result = Ok(());
        for index in 0..self.cache.total_entries() {
            if self.cache.metadata(index).addresses().len() >= redundancy {
                continue;
            }
            match self.add_redundant_entries(index) {
                Ok(()) => self.counters.missing_redundant_entries_recovered += 1,
                Err(e) => {
                    if repair_result.is_ok() {
                        repair_result = Err(e);
                    }
                }
            }
        }
        repair_result
    }

    /// Copy a verified copy of the key until it has `redundancy` copies
    fn add_redundant_entries(&mut self, index: usize) -> Result<()> {
        let entry = self.read_verified_entry(index)?;

        while self.cache.metadata(index).addresses().len() < self.redundancy() {
            let addresses = self.cache.metadata(index).addresses().to_vec();
            let sector = self.get_sector_for_write(entry.size(), &addresses)?;
            let new_address = self.sectors.next_writable_address(sector);
            self.copy_entry_to_sector(&entry, sector, new_address)?;
            self.cache.metadata_mut(index).add_new_address(new_address);
        }
        Ok(())
    }

    /// First copy of a cached key that passes a full checksum check.
    /// Copies that fail mark their sector corrupt.
    fn read_verified_entry(&mut self, index: usize) -> Result<Entry> {
        let addresses = self.cache.metadata(index).addresses().to_vec();
        let mut last_error = KvsError::DataLoss("key has no stored copies".to_string());

        for address in addresses {
            let verified = Entry::read(&self.partition, address, &self.formats)
                .and_then(|entry| entry.verify_checksum_in_flash(&self.partition).map(|()| entry));
            match verified {
                Ok(entry) => return Ok(entry),
                Err(e) => {
                    warn!(address, error = %e, "Copy failed verification; marking sector corrupt");
                    self.error_detected = true;
                    self.sectors.from_address_mut(address).mark_corrupt();
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
