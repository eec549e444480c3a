//! File-backed flash
//!
//! Keeps a partition image in a host file so a store survives process
//! restarts during host-side development and testing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{assert_write_aligned, check_bounds, erase_range, Address, FlashPartition};
use crate::error::{KvsError, Result};

/// Flash partition stored in a file
#[derive(Debug)]
pub struct FileFlash {
    path: PathBuf,
    file: File,
    sector_size: usize,
    sector_count: usize,
    alignment: usize,
    erased: u8,
}

impl FileFlash {
    /// Create (or truncate) an image of `sector_count` erased sectors
    pub fn create(
        path: &Path,
        sector_size: usize,
        sector_count: usize,
        alignment: usize,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let erased = super::DEFAULT_ERASED_CONTENT;
        let blank = vec![erased; sector_size];
        for _ in 0..sector_count {
            file.write_all(&blank)?;
        }
        file.sync_all()?;

        debug!(path = %path.display(), sector_size, sector_count, "Created flash image");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            sector_size,
            sector_count,
            alignment,
            erased,
        })
    }

    /// Open an existing image; the sector count comes from the file length
    pub fn open(path: &Path, sector_size: usize, alignment: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;

        if sector_size == 0 || len % sector_size != 0 {
            return Err(KvsError::FailedPrecondition(format!(
                "flash image of {} bytes is not a whole number of {}-byte sectors",
                len, sector_size
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            sector_size,
            sector_count: len / sector_size,
            alignment,
            erased: super::DEFAULT_ERASED_CONTENT,
        })
    }

    /// Path of the image file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force the image to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn read_at(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(address as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, address: Address, data: &[u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(address as u64))?;
        file.write_all(data)?;
        Ok(())
    }
}

impl FlashPartition for FileFlash {
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
        check_bounds(self.size_bytes(), address, buf.len())?;
        self.read_at(address, buf)
    }

    fn write(&mut self, address: Address, data: &[u8]) -> Result<usize> {
        check_bounds(self.size_bytes(), address, data.len())?;
        assert_write_aligned(self.alignment, address, data.len());

        let mut current = vec![0u8; data.len()];
        self.read_at(address, &mut current)?;
        if let Some(offset) = current.iter().position(|&b| b != self.erased) {
            return Err(KvsError::Flash(format!(
                "write over programmed byte at {:#x}",
                address as usize + offset
            )));
        }

        self.write_at(address, data)?;
        Ok(data.len())
    }

    fn erase(&mut self, address: Address, num_sectors: usize) -> Result<()> {
        let range = erase_range(self.sector_size, self.size_bytes(), address, num_sectors)?;
        let blank = vec![self.erased; range.len()];
        self.write_at(address, &blank)?;
        self.file.sync_data()?;
        Ok(())
    }
}
