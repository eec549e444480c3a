//! Aligned Writer
//!
//! Collects arbitrarily sized pieces into one stream of aligned flash writes.

use super::{Address, FlashPartition};
use crate::error::Result;

/// Size of the staging buffer before rounding up to the alignment
pub const WRITE_BUFFER_SIZE: usize = 32;

/// Round `value` up to the next multiple of `alignment`
pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Buffers writes and emits them to flash in aligned chunks.
///
/// The writer does not hold the partition; every call takes it, so a copy can
/// read from one region of a partition and write to another through the same
/// `&mut` borrow. The final chunk is zero-padded to the alignment by `flush`.
pub struct AlignedWriter {
    alignment: usize,
    buffer: Vec<u8>,
    filled: usize,
    address: Address,
    bytes_written: usize,
}

impl AlignedWriter {
    pub fn new(address: Address, alignment: usize) -> Self {
        let chunk = align_up(WRITE_BUFFER_SIZE, alignment);
        Self {
            alignment,
            buffer: vec![0u8; chunk],
            filled: 0,
            address,
            bytes_written: 0,
        }
    }

    /// Append bytes, writing out every full chunk
    pub fn write<F: FlashPartition + ?Sized>(&mut self, flash: &mut F, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = self.buffer.len() - self.filled;
            let n = room.min(data.len());
            self.buffer[self.filled..self.filled + n].copy_from_slice(&data[..n]);
            self.filled += n;
            data = &data[n..];

            if self.filled == self.buffer.len() {
                let len = self.filled;
                self.write_out(flash, len)?;
            }
        }
        Ok(())
    }

    /// Pad the remainder with zeros, write it, and return the total bytes written
    pub fn flush<F: FlashPartition + ?Sized>(mut self, flash: &mut F) -> Result<usize> {
        if self.filled > 0 {
            let padded = align_up(self.filled, self.alignment);
            self.buffer[self.filled..padded].fill(0);
            self.write_out(flash, padded)?;
        }
        Ok(self.bytes_written)
    }

    fn write_out<F: FlashPartition + ?Sized>(&mut self, flash: &mut F, len: usize) -> Result<()> {
        flash.write(self.address, &self.buffer[..len])?;
        self.address += len as Address;
        self.bytes_written += len;
        self.filled = 0;
        Ok(())
    }
}
