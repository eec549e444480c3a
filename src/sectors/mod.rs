//! Sectors Module
//!
//! Tracks free, valid and recoverable space per erase sector and decides
//! where the next entry goes and which sector garbage collection reclaims.
//!
//! ## Responsibilities
//! - Own one [`SectorDescriptor`] per sector of the partition
//! - Map addresses to sectors and back
//! - Pick a sector with room for a new entry (`find_space`)
//! - Pick a sector to reclaim (`find_sector_to_garbage_collect`)
//!
//! ## Wear Leveling
//! Every search starts at the sector after the last one that was newly
//! opened, so writes rotate through the partition instead of hammering the
//! lowest addresses. One sector is always kept empty on the normal write path
//! so garbage collection has somewhere to relocate into.

mod descriptor;

pub use descriptor::SectorDescriptor;

use tracing::{debug, trace};

use crate::error::{KvsError, Result};
use crate::flash::Address;

/// Which caller a space search serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FindMode {
    AppendEntry,
    GarbageCollect,
}

/// Descriptors for every sector of a partition
#[derive(Debug, Clone)]
pub struct Sectors {
    descriptors: Vec<SectorDescriptor>,
    sector_size_bytes: usize,
    /// Sector most recently chosen while empty
    last_new: usize,
}

impl Sectors {
    pub fn new(sector_count: usize, sector_size_bytes: usize) -> Self {
        Self {
            descriptors: vec![SectorDescriptor::new(sector_size_bytes); sector_count],
            sector_size_bytes,
            last_new: 0,
        }
    }

    /// Mark every sector erased and restart the rotation at sector 0
    pub fn reset(&mut self) {
        self.descriptors
            .iter_mut()
            .for_each(|d| *d = SectorDescriptor::new(self.sector_size_bytes));
        self.last_new = 0;
    }

    // =========================================================================
    // Address Mapping
    // =========================================================================

    /// Index of the sector containing `address`
    pub fn index_of(&self, address: Address) -> usize {
        address as usize / self.sector_size_bytes
    }

    pub fn from_address(&self, address: Address) -> &SectorDescriptor {
        &self.descriptors[self.index_of(address)]
    }

    pub fn from_address_mut(&mut self, address: Address) -> &mut SectorDescriptor {
        let index = self.index_of(address);
        &mut self.descriptors[index]
    }

    pub fn base_address(&self, index: usize) -> Address {
        (index * self.sector_size_bytes) as Address
    }

    /// First unwritten address at the sector's tail
    pub fn next_writable_address(&self, index: usize) -> Address {
        let written = self.sector_size_bytes - self.descriptors[index].writable_bytes();
        self.base_address(index) + written as Address
    }

    pub fn address_in_sector(&self, index: usize, address: Address) -> bool {
        self.index_of(address) == index
    }

    pub fn set_last_new_sector(&mut self, address: Address) {
        self.last_new = self.index_of(address);
    }

    pub fn last_new(&self) -> usize {
        self.last_new
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn get(&self, index: usize) -> &SectorDescriptor {
        &self.descriptors[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut SectorDescriptor {
        &mut self.descriptors[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectorDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn sector_size_bytes(&self) -> usize {
        self.sector_size_bytes
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Find a sector with at least `size` writable bytes for a new entry.
    ///
    /// Sectors containing any of `reserved_addresses` are skipped.
    pub fn find_space(&mut self, size: usize, reserved_addresses: &[Address]) -> Result<usize> {
        self.find(FindMode::AppendEntry, size, &[], reserved_addresses)
    }

    /// Like `find_space`, for relocating an entry during garbage collection.
    ///
    /// Sectors containing any of `addresses_to_skip` (the entry's current
    /// copies) are skipped as well, and the last empty sector may be used.
    pub fn find_space_during_garbage_collection(
        &mut self,
        size: usize,
        addresses_to_skip: &[Address],
        reserved_addresses: &[Address],
    ) -> Result<usize> {
        self.find(
            FindMode::GarbageCollect,
            size,
            addresses_to_skip,
            reserved_addresses,
        )
    }

    fn find(
        &mut self,
        mode: FindMode,
        size: usize,
        addresses_to_skip: &[Address],
        reserved_addresses: &[Address],
    ) -> Result<usize> {
        let sector_size = self.sector_size_bytes;

        let mut first_clean: Option<usize> = None;
        let mut clean_count = 0usize;
        let mut first_empty: Option<usize> = None;
        let mut at_least_two_empty = mode == FindMode::GarbageCollect;
        let mut least_reclaimable: Option<usize> = None;

        for index in self.rotation() {
            if self.holds_any(index, addresses_to_skip) || self.holds_any(index, reserved_addresses) {
                continue;
            }

            let sector = &self.descriptors[index];

            if sector.empty(sector_size) {
                if first_empty.is_none() {
                    first_empty = Some(index);
                } else {
                    at_least_two_empty = true;
                }
                continue;
            }

            if !sector.has_space(size) {
                continue;
            }

            // Partially written sector with no stale bytes in it.
            if sector.recoverable_bytes(sector_size) == 0 {
                if mode == FindMode::AppendEntry {
                    trace!(sector = index, size, "Found partial sector with space");
                    return Ok(index);
                }
                first_clean.get_or_insert(index);
                clean_count += 1;
            }

            let better = match least_reclaimable {
                None => true,
                Some(best) => {
                    sector.recoverable_bytes(sector_size)
                        < self.descriptors[best].recoverable_bytes(sector_size)
                }
            };
            if better {
                least_reclaimable = Some(index);
            }
        }

        if let Some(index) = first_clean.filter(|_| clean_count >= 2) {
            trace!(sector = index, size, "Found partial sector for relocation");
            return Ok(index);
        }

        if let Some(index) = first_empty.filter(|_| at_least_two_empty) {
            debug!(sector = index, size, "Opening empty sector");
            self.last_new = index;
            return Ok(index);
        }

        if let Some(index) = least_reclaimable {
            trace!(sector = index, size, "Using least reclaimable sector");
            return Ok(index);
        }

        debug!(size, "No sector has space for entry");
        Err(KvsError::ResourceExhausted(format!(
            "no sector has {} writable bytes",
            size
        )))
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    /// Pick the sector garbage collection should reclaim next.
    ///
    /// In order of preference:
    /// 1. the first sector holding only stale entries
    /// 2. the sector with the most recoverable bytes
    /// 3. the sector with the most valid bytes, to spread entries out
    ///
    /// Returns `None` when every sector is empty.
    pub fn find_sector_to_garbage_collect(&self, reserved_addresses: &[Address]) -> Option<usize> {
        let sector_size = self.sector_size_bytes;
        let candidates: Vec<usize> = self
            .rotation()
            .filter(|&index| !self.holds_any(index, reserved_addresses))
            .collect();

        // Step 1: Fully stale sector, nothing to relocate
        if let Some(&index) = candidates.iter().find(|&&index| {
            let sector = &self.descriptors[index];
            sector.valid_bytes() == 0 && sector.recoverable_bytes(sector_size) > 0
        }) {
            debug!(sector = index, "Found sector with only stale entries");
            return Some(index);
        }

        // Step 2: Most recoverable bytes
        let most_recoverable = max_by_first(&candidates, |index| {
            self.descriptors[index].recoverable_bytes(sector_size)
        });
        if most_recoverable.is_some() {
            return most_recoverable;
        }

        // Step 3: Most valid bytes
        let most_valid = max_by_first(&candidates, |index| self.descriptors[index].valid_bytes());
        if most_valid.is_some() {
            debug!(sector = ?most_valid, "No recoverable sector; redistributing valid entries");
        }
        most_valid
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Sector indices starting after `last_new`, wrapping around once
    fn rotation(&self) -> impl Iterator<Item = usize> {
        let count = self.descriptors.len();
        let start = self.last_new + 1;
        (0..count).map(move |j| (start + j) % count)
    }

    fn holds_any(&self, index: usize, addresses: &[Address]) -> bool {
        addresses
            .iter()
            .any(|&address| self.address_in_sector(index, address))
    }
}

/// First index with the largest non-zero score
fn max_by_first(candidates: &[usize], score: impl Fn(usize) -> usize) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for &index in candidates {
        let value = score(index);
        if value > 0 && best.map_or(true, |(_, top)| value > top) {
            best = Some((index, value));
        }
    }
    best.map(|(index, _)| index)
}
