//! # flashkvs
//!
//! A key-value store for NOR flash partitions with:
//! - Checksummed, append-only entries with configurable formats
//! - Redundant copies of every key in distinct sectors
//! - Wear-leveled sector allocation and garbage collection
//! - Recovery from corrupt entries and sectors on init and maintenance
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     KeyValueStore                           │
//! │        (put / get / delete / maintenance / init)            │
//! └───────┬─────────────────────┬───────────────────┬───────────┘
//!         │                     │                   │
//!         ▼                     ▼                   ▼
//!  ┌─────────────┐       ┌─────────────┐     ┌─────────────┐
//!  │ EntryCache  │       │   Sectors   │     │    Entry    │
//!  │ hash → addr │       │ space / GC  │     │ codec + crc │
//!  └─────────────┘       └─────────────┘     └──────┬──────┘
//!                                                   │
//!                                                   ▼
//!                                           ┌─────────────┐
//!                                           │  Partition  │
//!                                           │ (NOR flash) │
//!                                           └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod checksum;
pub mod flash;
pub mod entry;
pub mod cache;
pub mod sectors;
pub mod store;
pub mod shared;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{KvsError, Result};
pub use config::{Config, ErrorRecovery, GcOnWrite};
pub use entry::{Entry, EntryFormat, EntryFormats};
pub use flash::{FileFlash, FlashPartition, InMemoryFlash};
pub use shared::SharedStore;
pub use store::{KeyValueStore, StorageStats, StoreState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of flashkvs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
