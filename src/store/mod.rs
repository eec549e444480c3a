//! Store Module
//!
//! The key-value store that drives the entry cache, the sector allocator
//! and the entry codec over one flash partition.
//!
//! ## Responsibilities
//! - Rebuild the in-memory index from flash on `init`
//! - Serve reads through the cache, tolerating damaged redundant copies
//! - Append new entries, keeping `redundancy` copies in distinct sectors
//! - Reclaim space by garbage collecting sectors
//! - Repair corrupt sectors and missing copies according to `ErrorRecovery`
//!
//! ## Write Flow
//! ```text
//! put(key, value)
//!   │
//!   ├─► EntryCache::find ──► unchanged value? ──► done
//!   │
//!   ├─► Sectors::find_space (× redundancy) ──► full? ──► garbage collect, retry
//!   │
//!   ├─► Entry::write copy 0 ──► cache now points at the new entry
//!   │
//!   └─► Entry::write copies 1..redundancy
//! ```
//!
//! A single logical writer is assumed. Wrap the store in a
//! [`SharedStore`](crate::SharedStore) to share it between threads.

mod init;
mod maintenance;
mod stats;
mod write;

pub use stats::StorageStats;

use tracing::{error, warn};

use crate::cache::EntryCache;
use crate::config::{Config, ErrorRecovery};
use crate::entry::{Entry, EntryFormats, MAX_KEY_LENGTH};
use crate::error::{KvsError, Result};
use crate::flash::FlashPartition;
use crate::sectors::Sectors;
use stats::Counters;

/// Lifecycle of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// `init` has not completed
    NotInitialized,
    /// Errors were found that have not been repaired; reads only
    NeedsMaintenance,
    Ready,
}

/// Flash-backed key-value store
pub struct KeyValueStore<F: FlashPartition> {
    partition: F,
    formats: EntryFormats,
    config: Config,
    sectors: Sectors,
    cache: EntryCache,
    state: StoreState,
    last_transaction_id: u32,
    error_detected: bool,
    counters: Counters,
}

impl<F: FlashPartition> KeyValueStore<F> {
    /// Create a store over `partition`. Call [`init`](Self::init) before use.
    pub fn new(partition: F, formats: EntryFormats, config: Config) -> Self {
        let sectors = Sectors::new(partition.sector_count(), partition.sector_size_bytes());
        let cache = EntryCache::new(config.max_entries, config.redundancy);
        Self {
            partition,
            formats,
            config,
            sectors,
            cache,
            state: StoreState::NotInitialized,
            last_transaction_id: 0,
            error_detected: false,
            counters: Counters::default(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the value of `key` into `buffer`; returns the number of bytes read.
    ///
    /// `BufferTooSmall` means `buffer` holds the first part of the value.
    pub fn get(&mut self, key: &[u8], buffer: &mut [u8]) -> Result<usize> {
        self.get_at(key, buffer, 0)
    }

    /// Read the value of `key` starting at `offset`
    pub fn get_at(&mut self, key: &[u8], buffer: &mut [u8], offset: usize) -> Result<usize> {
        self.check_read_operation(key)?;
        let result = self.find_existing(key).and_then(|index| {
            let entry = self.read_entry(index)?;
            self.read_value(&entry, key, buffer, offset)
        });
        self.recover_if_immediate();
        result
    }

    /// Read the whole value of `key`
    pub fn get_value(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let size = self.value_size(key)?;
        let mut value = vec![0u8; size];
        let read = self.get(key, &mut value)?;
        value.truncate(read);
        Ok(value)
    }

    /// Size of the value stored for `key`
    pub fn value_size(&mut self, key: &[u8]) -> Result<usize> {
        self.check_read_operation(key)?;
        let result = self
            .find_existing(key)
            .and_then(|index| self.read_entry(index))
            .map(|entry| entry.value_size());
        self.recover_if_immediate();
        result
    }

    /// Keys of every live entry, in cache order
    pub fn keys(&mut self) -> Result<Vec<Vec<u8>>> {
        self.check_initialized()?;
        let mut keys = Vec::with_capacity(self.cache.present_entries());
        for index in 0..self.cache.total_entries() {
            if self.cache.metadata(index).deleted() {
                continue;
            }
            let entry = self.read_entry(index)?;
            let mut key_buffer = [0u8; MAX_KEY_LENGTH];
            let len = entry.read_key(&self.partition, &mut key_buffer)?;
            keys.push(key_buffer[..len].to_vec());
        }
        Ok(keys)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of live keys
    pub fn size(&self) -> usize {
        self.cache.present_entries()
    }

    /// Keys tracked, including tombstones
    pub fn total_entries(&self) -> usize {
        self.cache.total_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_size(&self) -> usize {
        self.cache.max_entries()
    }

    pub fn redundancy(&self) -> usize {
        self.cache.redundancy()
    }

    /// Last transaction id handed out
    pub fn transaction_count(&self) -> u32 {
        self.last_transaction_id
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn initialized(&self) -> bool {
        self.state == StoreState::Ready
    }

    /// True if corruption was seen and has not been repaired yet
    pub fn error_detected(&self) -> bool {
        self.error_detected
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn formats(&self) -> &EntryFormats {
        &self.formats
    }

    pub fn sectors(&self) -> &Sectors {
        &self.sectors
    }

    pub fn cache(&self) -> &EntryCache {
        &self.cache
    }

    pub fn partition(&self) -> &F {
        &self.partition
    }

    /// Direct access to the partition. Writing through it bypasses the store.
    pub fn partition_mut(&mut self) -> &mut F {
        &mut self.partition
    }

    pub fn into_partition(self) -> F {
        self.partition
    }

    /// Current usage of the partition
    pub fn storage_stats(&self) -> StorageStats {
        let sector_size = self.partition.sector_size_bytes();
        let mut stats = StorageStats {
            sector_erase_count: self.counters.sector_erase_count,
            corrupt_sectors_recovered: self.counters.corrupt_sectors_recovered,
            missing_redundant_entries_recovered: self.counters.missing_redundant_entries_recovered,
            ..StorageStats::default()
        };

        let mut found_empty_sector = false;
        for sector in self.sectors.iter() {
            stats.in_use_bytes += sector.valid_bytes();
            stats.reclaimable_bytes += sector.recoverable_bytes(sector_size);

            // The first empty sector is held back for garbage collection.
            if !found_empty_sector && sector.empty(sector_size) {
                found_empty_sector = true;
                continue;
            }
            stats.writable_bytes += sector.writable_bytes();
        }
        stats
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_initialized(&self) -> Result<()> {
        if self.state == StoreState::NotInitialized {
            return Err(KvsError::FailedPrecondition(
                "store is not initialized".to_string(),
            ));
        }
        Ok(())
    }

    fn check_read_operation(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.check_initialized()
    }

    fn check_write_operation(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        match self.state {
            StoreState::Ready => Ok(()),
            StoreState::NeedsMaintenance => Err(KvsError::FailedPrecondition(
                "store needs maintenance before it accepts writes".to_string(),
            )),
            StoreState::NotInitialized => Err(KvsError::FailedPrecondition(
                "store is not initialized".to_string(),
            )),
        }
    }

    /// Cache index of `key`, counting damaged copies as detected errors
    fn find_entry(&mut self, key: &[u8]) -> Result<usize> {
        let lookup = self
            .cache
            .find(&self.partition, &mut self.sectors, &self.formats, key);
        if lookup.error_count > 0 {
            self.error_detected = true;
        }
        lookup.outcome.map(|metadata| metadata.index())
    }

    /// Like `find_entry`, but deleted keys and hash collisions are `NotFound`
    fn find_existing(&mut self, key: &[u8]) -> Result<usize> {
        match self.find_entry(key) {
            Ok(index) if self.cache.metadata(index).deleted() => Err(KvsError::NotFound),
            Err(KvsError::AlreadyExists) => Err(KvsError::NotFound),
            other => other,
        }
    }

    /// Read the header of the first readable copy of a cached key
    fn read_entry(&mut self, index: usize) -> Result<Entry> {
        let addresses = self.cache.metadata(index).addresses().to_vec();
        let mut last_error = KvsError::DataLoss("key has no stored copies".to_string());

        for address in addresses {
            match Entry::read(&self.partition, address, &self.formats) {
                Ok(entry) => return Ok(entry),
                Err(e) => {
                    warn!(address, error = %e, "Unreadable copy; marking sector corrupt");
                    self.error_detected = true;
                    self.sectors.from_address_mut(address).mark_corrupt();
                    last_error = e;
                }
            }
        }

        error!(
            key_hash = %format_args!("{:#010x}", self.cache.metadata(index).hash()),
            "No valid copies of key; data has been lost"
        );
        Err(last_error)
    }

    fn read_value(&self, entry: &Entry, key: &[u8], buffer: &mut [u8], offset: usize) -> Result<usize> {
        let read = entry.read_value(&self.partition, buffer, offset)?;

        if self.config.verify_on_read && offset == 0 {
            if let Err(e) = entry.verify_checksum(key, &buffer[..read]) {
                error!(address = entry.address(), "Value failed checksum verification");
                buffer[..read].fill(0);
                return Err(e);
            }
        }
        Ok(read)
    }

    fn recover_if_immediate(&mut self) {
        if self.error_detected && self.config.recovery == ErrorRecovery::Immediate {
            if let Err(e) = self.fix_errors() {
                warn!(error = %e, "Immediate repair failed");
            }
        }
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(KvsError::InvalidArgument(format!(
            "key length {} outside 1..={}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}
