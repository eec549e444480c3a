//! Per-sector space accounting

use serde::Serialize;
use tracing::error;

/// Space bookkeeping for one erase sector.
///
/// ```text
/// ┌────────────────────────────────────────────┬─────────────────┐
/// │  written: valid entries + stale entries    │  writable tail  │
/// └────────────────────────────────────────────┴─────────────────┘
/// recoverable = sector_size - valid - writable
/// ```
///
/// Writes only ever append at the tail, so `writable_bytes` shrinks until the
/// sector is erased. A corrupt sector reports no writable bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectorDescriptor {
    tail_free_bytes: usize,
    valid_bytes: usize,
    corrupt: bool,
}

impl SectorDescriptor {
    /// An erased sector
    pub fn new(sector_size_bytes: usize) -> Self {
        Self {
            tail_free_bytes: sector_size_bytes,
            valid_bytes: 0,
            corrupt: false,
        }
    }

    /// Bytes left at the tail; zero for a corrupt sector
    pub fn writable_bytes(&self) -> usize {
        if self.corrupt {
            0
        } else {
            self.tail_free_bytes
        }
    }

    /// Set the free tail explicitly. Clears the corrupt flag.
    pub fn set_writable_bytes(&mut self, writable_bytes: usize) {
        self.tail_free_bytes = writable_bytes;
        self.corrupt = false;
    }

    pub fn mark_corrupt(&mut self) {
        self.corrupt = true;
    }

    pub fn corrupt(&self) -> bool {
        self.corrupt
    }

    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    pub fn add_valid_bytes(&mut self, bytes: usize) {
        self.valid_bytes += bytes;
    }

    pub fn remove_valid_bytes(&mut self, bytes: usize) {
        if bytes > self.valid_bytes {
            error!(
                valid_bytes = self.valid_bytes,
                requested = bytes,
                "Removing more valid bytes than the sector holds"
            );
            self.valid_bytes = 0;
        } else {
            self.valid_bytes -= bytes;
        }
    }

    pub fn remove_writable_bytes(&mut self, bytes: usize) {
        if bytes > self.writable_bytes() {
            error!(
                writable_bytes = self.writable_bytes(),
                requested = bytes,
                "Removing more writable bytes than the sector has free"
            );
            self.tail_free_bytes = 0;
        } else {
            self.tail_free_bytes -= bytes;
        }
    }

    pub fn has_space(&self, required_space: usize) -> bool {
        self.writable_bytes() >= required_space
    }

    /// True if nothing has been written since the last erase
    pub fn empty(&self, sector_size_bytes: usize) -> bool {
        self.writable_bytes() == sector_size_bytes
    }

    /// Bytes held by stale entries, reclaimable by garbage collection
    pub fn recoverable_bytes(&self, sector_size_bytes: usize) -> usize {
        sector_size_bytes
            .saturating_sub(self.valid_bytes)
            .saturating_sub(self.writable_bytes())
    }
}
