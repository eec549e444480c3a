//! Checksum algorithms
//!
//! An [`EntryFormat`](crate::entry::EntryFormat) pairs a magic number with one
//! of these. Algorithms are stateless descriptions; every computation gets a
//! fresh [`ChecksumState`] from [`ChecksumAlgorithm::begin`], so one algorithm
//! can be shared by every entry of a format.

use std::fmt;

/// A checksum algorithm usable by an entry format
pub trait ChecksumAlgorithm: fmt::Debug + Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Size of the native digest in bytes
    fn size_bytes(&self) -> usize;

    /// Start a new computation
    fn begin(&self) -> Box<dyn ChecksumState>;

    /// Compare a finished digest against a stored checksum field.
    ///
    /// The field may be narrower than the digest; only the leading bytes that
    /// fit are compared.
    fn matches(&self, digest: &[u8], stored: &[u8]) -> bool {
        let len = digest.len().min(stored.len());
        digest[..len] == stored[..len]
    }
}

/// In-progress checksum computation
pub trait ChecksumState {
    fn update(&mut self, data: &[u8]);

    /// Consume the state and return the digest, little-endian for integer digests
    fn finish(self: Box<Self>) -> Vec<u8>;
}

// =============================================================================
// CRC32
// =============================================================================

/// CRC-32 (IEEE), backed by crc32fast
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32;

impl ChecksumAlgorithm for Crc32 {
    fn name(&self) -> &'static str {
        "crc32"
    }

    fn size_bytes(&self) -> usize {
        4
    }

    fn begin(&self) -> Box<dyn ChecksumState> {
        Box::new(Crc32State(crc32fast::Hasher::new()))
    }
}

struct Crc32State(crc32fast::Hasher);

impl ChecksumState for Crc32State {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_le_bytes().to_vec()
    }
}
