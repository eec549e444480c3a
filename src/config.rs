//! Configuration for flashkvs
//!
//! Centralized store options with sensible defaults.

use serde::{Deserialize, Serialize};

/// Main configuration for a KeyValueStore instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Capacity
    // -------------------------------------------------------------------------
    /// Maximum number of distinct keys (live or deleted) tracked in RAM.
    /// The entry cache is sized once from this and never grows.
    pub max_entries: usize,

    /// Number of physical copies kept for every key, each in its own sector.
    pub redundancy: usize,

    // -------------------------------------------------------------------------
    // Maintenance Policy
    // -------------------------------------------------------------------------
    /// How much garbage collection a write may trigger when no sector has room.
    pub gc_on_write: GcOnWrite,

    /// When detected corruption gets repaired.
    pub recovery: ErrorRecovery,

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------
    /// Verify the checksum of a value read in full by `get`.
    pub verify_on_read: bool,

    /// Re-read and verify every entry right after it is written.
    pub verify_on_write: bool,
}

/// Garbage collection allowed during a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcOnWrite {
    /// Never collect during a write; a full partition fails the write.
    Disabled,

    /// Collect at most one sector per write.
    OneSector,

    /// Keep collecting until the entry fits (bounded by the sector count).
    AsManySectorsNeeded,
}

/// Error recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorRecovery {
    /// Repair as soon as an error is detected.
    Immediate,

    /// Repair during init and the next garbage collection or maintenance call.
    Lazy,

    /// Repair only from an explicit maintenance call.
    Manual,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 256,
            redundancy: 1,
            gc_on_write: GcOnWrite::AsManySectorsNeeded,
            recovery: ErrorRecovery::Lazy,
            verify_on_read: true,
            verify_on_write: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the maximum number of tracked keys
    pub fn max_entries(mut self, count: usize) -> Self {
        self.config.max_entries = count;
        self
    }

    /// Set the number of copies kept per key
    pub fn redundancy(mut self, copies: usize) -> Self {
        self.config.redundancy = copies;
        self
    }

    /// Set the garbage collection policy for writes
    pub fn gc_on_write(mut self, policy: GcOnWrite) -> Self {
        self.config.gc_on_write = policy;
        self
    }

    /// Set the error recovery policy
    pub fn recovery(mut self, recovery: ErrorRecovery) -> Self {
        self.config.recovery = recovery;
        self
    }

    pub fn verify_on_read(mut self, verify: bool) -> Self {
        self.config.verify_on_read = verify;
        self
    }

    pub fn verify_on_write(mut self, verify: bool) -> Self {
        self.config.verify_on_write = verify;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
