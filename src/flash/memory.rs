//! In-memory flash
//!
//! A RAM-backed partition that behaves like NOR flash: erased bytes read as
//! `0xFF`, programmed bytes cannot be programmed again until erased. Read and
//! write faults can be injected over address ranges for corruption testing.

use std::ops::Range;

use tracing::error;

use super::{assert_write_aligned, check_bounds, erase_range, Address, FlashPartition};
use crate::error::{KvsError, Result};

/// RAM-backed flash partition
#[derive(Debug, Clone)]
pub struct InMemoryFlash {
    buffer: Vec<u8>,
    sector_size: usize,
    sector_count: usize,
    alignment: usize,
    erased: u8,
    read_faults: Vec<Range<Address>>,
    write_faults: Vec<Range<Address>>,
}

impl InMemoryFlash {
    /// Create an erased partition
    pub fn new(sector_size: usize, sector_count: usize, alignment: usize) -> Self {
        Self::with_erased_content(sector_size, sector_count, alignment, super::DEFAULT_ERASED_CONTENT)
    }

    /// Create an erased partition whose unwritten bytes read as `erased`
    pub fn with_erased_content(
        sector_size: usize,
        sector_count: usize,
        alignment: usize,
        erased: u8,
    ) -> Self {
        Self {
            buffer: vec![erased; sector_size * sector_count],
            sector_size,
            sector_count,
            alignment,
            erased,
            read_faults: Vec::new(),
            write_faults: Vec::new(),
        }
    }

    /// Raw partition content
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Raw partition content, bypassing the programming rules
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Fail every read that overlaps `range`
    pub fn inject_read_error(&mut self, range: Range<Address>) {
        self.read_faults.push(range);
    }

    /// Fail every write that overlaps `range`
    pub fn inject_write_error(&mut self, range: Range<Address>) {
        self.write_faults.push(range);
    }

    pub fn clear_faults(&mut self) {
        self.read_faults.clear();
        self.write_faults.clear();
    }

    fn overlaps(faults: &[Range<Address>], address: Address, len: usize) -> bool {
        let end = address + len as Address;
        faults.iter().any(|f| f.start < end && address < f.end)
    }
}

impl FlashPartition for InMemoryFlash {
    fn sector_size_bytes(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> usize {
        self.sector_count
    }

    fn alignment_bytes(&self) -> usize {
        self.alignment
    }

    fn erased_memory_content(&self) -> u8 {
        self.erased
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.buffer.len(), address, buf.len())?;
        if Self::overlaps(&self.read_faults, address, buf.len()) {
            return Err(KvsError::Flash(format!(
                "injected read error at {:#x}",
                address
            )));
        }
        let start = address as usize;
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> Result<usize> {
        check_bounds(self.buffer.len(), address, data.len())?;
        assert_write_aligned(self.alignment, address, data.len());
        if Self::overlaps(&self.write_faults, address, data.len()) {
            return Err(KvsError::Flash(format!(
                "injected write error at {:#x}",
                address
            )));
        }

        let erased = self.erased;
        let start = address as usize;
        let target = &mut self.buffer[start..start + data.len()];
        if let Some(offset) = target.iter().position(|&b| b != erased) {
            error!(
                address = start + offset,
                "Writing to previously written address"
            );
            return Err(KvsError::Flash(format!(
                "write over programmed byte at {:#x}",
                start + offset
            )));
        }
        target.copy_from_slice(data);
        Ok(data.len())
    }

    fn erase(&mut self, address: Address, num_sectors: usize) -> Result<()> {
        let range = erase_range(self.sector_size, self.buffer.len(), address, num_sectors)?;
        self.buffer[range].fill(self.erased);
        Ok(())
    }
}
