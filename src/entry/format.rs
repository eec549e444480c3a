//! Entry formats
//!
//! A format pairs a magic number with a checksum algorithm. A store writes
//! with its primary format and reads any registered one, which lets the
//! checksum scheme change across firmware versions.

use std::fmt;
use std::sync::Arc;

use crate::checksum::ChecksumAlgorithm;
use crate::error::{KvsError, Result};

/// Magic number + checksum algorithm
#[derive(Clone)]
pub struct EntryFormat {
    pub magic: u32,
    pub checksum: Option<Arc<dyn ChecksumAlgorithm>>,
}

impl EntryFormat {
    pub fn new(magic: u32, checksum: Option<Arc<dyn ChecksumAlgorithm>>) -> Self {
        Self { magic, checksum }
    }

    /// Format that stores no checksum (the header field must stay zero)
    pub fn unchecked(magic: u32) -> Self {
        Self {
            magic,
            checksum: None,
        }
    }
}

impl fmt::Debug for EntryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryFormat")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("checksum", &self.checksum.as_ref().map(|c| c.name()))
            .finish()
    }
}

/// Registry of formats; the first one is primary
#[derive(Debug, Clone)]
pub struct EntryFormats {
    formats: Vec<EntryFormat>,
}

impl EntryFormats {
    pub fn new(formats: Vec<EntryFormat>) -> Result<Self> {
        if formats.is_empty() {
            return Err(KvsError::InvalidArgument(
                "at least one entry format is required".to_string(),
            ));
        }
        for (i, format) in formats.iter().enumerate() {
            if formats[..i].iter().any(|f| f.magic == format.magic) {
                return Err(KvsError::InvalidArgument(format!(
                    "duplicate entry format magic {:#010x}",
                    format.magic
                )));
            }
        }
        Ok(Self { formats })
    }

    /// Registry with one format
    pub fn single(format: EntryFormat) -> Self {
        Self {
            formats: vec![format],
        }
    }

    /// Format used for new writes
    pub fn primary(&self) -> &EntryFormat {
        &self.formats[0]
    }

    pub fn find(&self, magic: u32) -> Option<&EntryFormat> {
        self.formats.iter().find(|f| f.magic == magic)
    }

    pub fn known_magic(&self, magic: u32) -> bool {
        self.find(magic).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryFormat> {
        self.formats.iter()
    }
}
