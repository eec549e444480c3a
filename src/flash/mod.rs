//! Flash Module
//!
//! The flash partition the storage core runs on.
//!
//! ## Responsibilities
//! - Block erase / read / aligned write primitives (`FlashPartition`)
//! - Buffered aligned writes with zero padding (`AlignedWriter`)
//! - A RAM-backed partition with fault injection (`InMemoryFlash`)
//! - A partition image kept in a host file (`FileFlash`)
//!
//! ## Address Space
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────┐
//! │   Sector 0   │   Sector 1   │ ... │  Sector N-1  │
//! └──────────────┴──────────────┴─────┴──────────────┘
//! 0              S              2S                  N*S
//! address = sector_index * sector_size_bytes + offset
//! ```

mod aligned;
mod file;
mod memory;

pub use aligned::{align_up, AlignedWriter, WRITE_BUFFER_SIZE};
pub use file::FileFlash;
pub use memory::InMemoryFlash;

use crate::error::{KvsError, Result};

/// Logical address within a partition
pub type Address = u32;

/// Erased-memory pattern of NOR flash
pub const DEFAULT_ERASED_CONTENT: u8 = 0xFF;

/// A region of flash divided into equally sized erase sectors.
///
/// Implementations must:
/// - return `OutOfRange` for any access beyond `size_bytes()`
/// - require `write` address and length to be multiples of `alignment_bytes()`
///   (a violated alignment is a programming error and panics)
/// - never modify bytes outside the requested range
pub trait FlashPartition {
    /// Size of the smallest erasable unit
    fn sector_size_bytes(&self) -> usize;

    fn sector_count(&self) -> usize;

    /// Write granularity
    fn alignment_bytes(&self) -> usize;

    /// Byte value of unwritten flash
    fn erased_memory_content(&self) -> u8 {
        DEFAULT_ERASED_CONTENT
    }

    fn size_bytes(&self) -> usize {
        self.sector_size_bytes() * self.sector_count()
    }

    /// Fill `buf` with the bytes starting at `address`
    fn read(&self, address: Address, buf: &mut [u8]) -> Result<()>;

    /// Program `data` at `address`; returns the number of bytes written
    fn write(&mut self, address: Address, data: &[u8]) -> Result<usize>;

    /// Erase `num_sectors` sectors starting at the sector-aligned `address`
    fn erase(&mut self, address: Address, num_sectors: usize) -> Result<()>;

    /// True if every byte equals the erased pattern
    fn appears_erased(&self, data: &[u8]) -> bool {
        let erased = self.erased_memory_content();
        data.iter().all(|&b| b == erased)
    }
}

impl<F: FlashPartition + ?Sized> FlashPartition for &mut F {
    fn sector_size_bytes(&self) -> usize {
        (**self).sector_size_bytes()
    }

    fn sector_count(&self) -> usize {
        (**self).sector_count()
    }

    fn alignment_bytes(&self) -> usize {
        (**self).alignment_bytes()
    }

    fn erased_memory_content(&self) -> u8 {
        (**self).erased_memory_content()
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }

    fn write(&mut self, address: Address, data: &[u8]) -> Result<usize> {
        (**self).write(address, data)
    }

    fn erase(&mut self, address: Address, num_sectors: usize) -> Result<()> {
        (**self).erase(address, num_sectors)
    }
}

// =============================================================================
// Shared Checks (used by the partition implementations)
// =============================================================================

/// Bounds check for an access of `len` bytes at `address`
pub(crate) fn check_bounds(size_bytes: usize, address: Address, len: usize) -> Result<()> {
    let end = address as usize + len;
    if end > size_bytes {
        return Err(KvsError::OutOfRange(format!(
            "access of {} bytes at {:#x} exceeds partition of {} bytes",
            len, address, size_bytes
        )));
    }
    Ok(())
}

/// Alignment contract for writes
pub(crate) fn assert_write_aligned(alignment: usize, address: Address, len: usize) {
    assert_eq!(
        address as usize % alignment,
        0,
        "flash write address {:#x} is not {}-byte aligned",
        address,
        alignment
    );
    assert_eq!(
        len % alignment,
        0,
        "flash write length {} is not a multiple of {}",
        len,
        alignment
    );
}

/// Validate an erase request and return the byte range it covers
pub(crate) fn erase_range(
    sector_size: usize,
    size_bytes: usize,
    address: Address,
    num_sectors: usize,
) -> Result<std::ops::Range<usize>> {
    if address as usize % sector_size != 0 {
        return Err(KvsError::InvalidArgument(format!(
            "erase address {:#x} is not sector aligned",
            address
        )));
    }
    let len = num_sectors * sector_size;
    check_bounds(size_bytes, address, len)?;
    let start = address as usize;
    Ok(start..start + len)
}
