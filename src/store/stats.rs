//! Storage statistics

use serde::Serialize;

/// Snapshot of partition usage and repair history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Free bytes available to new entries, not counting the reserved empty sector
    pub writable_bytes: usize,
    /// Bytes held by live entries
    pub in_use_bytes: usize,
    /// Bytes held by stale entries
    pub reclaimable_bytes: usize,
    pub sector_erase_count: usize,
    pub corrupt_sectors_recovered: usize,
    pub missing_redundant_entries_recovered: usize,
}

/// Running counters kept by the store
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub sector_erase_count: usize,
    pub corrupt_sectors_recovered: usize,
    pub missing_redundant_entries_recovered: usize,
}
