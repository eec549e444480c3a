//! Tests for corruption handling and repair
//!
//! These tests verify:
//! - Corrupt entries found during init are skipped and their sector repaired
//! - ErrorRecovery policies (Immediate, Lazy, Manual)
//! - Missing redundant copies are restored
//! - Raising the redundancy level of an existing store
//! - Flash write failures mark the sector corrupt

#[path = "../common/mod.rs"]
mod common;

use common::*;
use flashkvs::flash::{FlashPartition, InMemoryFlash};
use flashkvs::{Config, ErrorRecovery, KeyValueStore, KvsError, StoreState};

// =============================================================================
// Helper Functions
// =============================================================================

fn config(recovery: ErrorRecovery, redundancy: usize) -> Config {
    Config::builder()
        .recovery(recovery)
        .redundancy(redundancy)
        .build()
}

/// Partition holding k1, k2 and k3, with one bit of k2's value flipped
fn flash_with_corrupt_k2() -> InMemoryFlash {
    let mut store = default_store();
    store.put(b"k1", b"value 1").unwrap();
    store.put(b"k2", b"value 2").unwrap();
    store.put(b"k3", b"value 3").unwrap();

    let address = addresses_of(&store, b"k2")[0];
    let mut flash = store.into_partition();
    flip_bit(&mut flash, address as usize + 16 + 2 + 1, 0);
    flash
}

/// Store over `flash` with init run but its result left to the caller
fn reinit(flash: InMemoryFlash, config: Config) -> (KeyValueStore<InMemoryFlash>, flashkvs::Result<()>) {
    init_tracing();
    let mut store = KeyValueStore::new(flash, formats(), config);
    let result = store.init();
    (store, result)
}

// =============================================================================
// Init-Time Recovery Tests
// =============================================================================

#[test]
fn test_corrupt_entry_repaired_on_init() {
    let (mut store, result) = reinit(flash_with_corrupt_k2(), config(ErrorRecovery::Lazy, 1));

    result.unwrap();
    assert_eq!(store.state(), StoreState::Ready);
    assert!(!store.error_detected());

    assert_eq!(store.get_value(b"k1").unwrap(), b"value 1");
    assert!(matches!(store.get_value(b"k2"), Err(KvsError::NotFound)));
    assert_eq!(store.get_value(b"k3").unwrap(), b"value 3");

    let stats = store.storage_stats();
    assert_eq!(stats.corrupt_sectors_recovered, 1);
    assert_eq!(stats.sector_erase_count, 1);
    assert_eq!(stats.reclaimable_bytes, 0);

    store.put(b"k2", b"rewritten").unwrap();
    assert_eq!(store.get_value(b"k2").unwrap(), b"rewritten");
}

#[test]
fn test_manual_recovery_waits_for_maintenance() {
    let (mut store, result) = reinit(flash_with_corrupt_k2(), config(ErrorRecovery::Manual, 1));

    assert!(matches!(result, Err(KvsError::DataLoss(_))));
    assert_eq!(store.state(), StoreState::NeedsMaintenance);
    assert!(store.error_detected());

    // Reads work, writes wait for maintenance.
    assert_eq!(store.get_value(b"k1").unwrap(), b"value 1");
    assert!(matches!(store.put(b"k4", b"v"), Err(KvsError::FailedPrecondition(_))));
    assert!(matches!(store.delete(b"k1"), Err(KvsError::FailedPrecondition(_))));

    store.full_maintenance().unwrap();

    assert_eq!(store.state(), StoreState::Ready);
    assert!(!store.error_detected());
    assert_eq!(store.storage_stats().corrupt_sectors_recovered, 1);
    store.put(b"k4", b"v").unwrap();
    assert_eq!(store.get_value(b"k3").unwrap(), b"value 3");
}

#[test]
fn test_garbage_before_entry_is_skipped() {
    let mut flash = flash(512, 4);
    flash.write(512, &[0u8; 16]).unwrap();
    write_entry(&mut flash, 528, b"survivor", b"still here", 1);

    let (mut store, result) = reinit(flash, Config::default());

    result.unwrap();
    assert_eq!(store.get_value(b"survivor").unwrap(), b"still here");
    assert_eq!(store.storage_stats().corrupt_sectors_recovered, 1);
    assert_eq!(store.transaction_count(), 1);
}

#[test]
fn test_missing_empty_sector_is_restored() {
    // Twelve generations of one key fill every sector of a 3 x 128 partition.
    let mut flash = flash(128, 3);
    for txid in 1..=12u32 {
        let address = (txid - 1) * 32;
        write_entry(&mut flash, address, b"a", format!("value-{:06}", txid).as_bytes(), txid);
    }

    let (mut store, result) = reinit(flash, Config::default());

    result.unwrap();
    assert_eq!(store.get_value(b"a").unwrap(), b"value-000012");
    assert_eq!(store.transaction_count(), 12);
    assert!(store.sectors().iter().any(|s| s.empty(128)));
    assert_eq!(store.storage_stats().sector_erase_count, 1);
}

#[test]
fn test_entry_from_older_transaction_is_ignored() {
    let mut flash = flash(512, 4);
    write_entry(&mut flash, 512, b"key", b"newer", 9);
    write_entry(&mut flash, 1024, b"key", b"older", 4);

    let (mut store, result) = reinit(flash, Config::default());

    result.unwrap();
    assert_eq!(store.get_value(b"key").unwrap(), b"newer");
    assert_eq!(store.transaction_count(), 9);
    assert_eq!(store.storage_stats().reclaimable_bytes, 32);
}

// =============================================================================
// Redundancy Tests
// =============================================================================

#[test]
fn test_corrupt_copy_is_replaced() {
    let mut store = open_store(flash(512, 4), config(ErrorRecovery::Lazy, 2));
    store.put(b"k1", b"value 1").unwrap();
    assert_eq!(addresses_of(&store, b"k1"), vec![512, 1024]);

    let mut flash = store.into_partition();
    flip_bit(&mut flash, 512 + 16 + 2 + 1, 0);

    let (mut store, result) = reinit(flash, config(ErrorRecovery::Lazy, 2));

    result.unwrap();
    let stats = store.storage_stats();
    assert_eq!(stats.corrupt_sectors_recovered, 1);
    assert_eq!(stats.missing_redundant_entries_recovered, 1);

    let addresses = addresses_of(&store, b"k1");
    assert_eq!(addresses.len(), 2);
    assert!(!addresses.contains(&512));
    assert_eq!(store.get_value(b"k1").unwrap(), b"value 1");
}

#[test]
fn test_redundancy_increase() {
    let mut store = default_store();
    store.put(b"k1", b"value 1").unwrap();
    store.put(b"k2", b"value 2").unwrap();

    let (mut store, result) = reinit(store.into_partition(), config(ErrorRecovery::Lazy, 2));

    result.unwrap();
    assert_eq!(store.state(), StoreState::Ready);
    // Adding copies for a new redundancy level is not a repair.
    assert_eq!(store.storage_stats().missing_redundant_entries_recovered, 0);

    for key in [b"k1", b"k2"] {
        let addresses = addresses_of(&store, key);
        assert_eq!(addresses.len(), 2);
        assert_ne!(
            sector_of(store.partition(), addresses[0]),
            sector_of(store.partition(), addresses[1])
        );
    }
    assert_eq!(store.get_value(b"k2").unwrap(), b"value 2");
}

#[test]
fn test_redundancy_increase_needs_repair_under_manual_recovery() {
    let mut store = default_store();
    store.put(b"k1", b"value 1").unwrap();

    let (mut store, result) = reinit(store.into_partition(), config(ErrorRecovery::Manual, 2));

    assert!(matches!(result, Err(KvsError::DataLoss(_))));
    assert_eq!(store.state(), StoreState::NeedsMaintenance);

    store.full_maintenance().unwrap();
    assert_eq!(addresses_of(&store, b"k1").len(), 2);
    assert_eq!(store.state(), StoreState::Ready);
}

// =============================================================================
// Runtime Recovery Tests
// =============================================================================

#[test]
fn test_damaged_key_falls_back_to_second_copy() {
    let mut store = open_store(flash(512, 4), config(ErrorRecovery::Lazy, 2));
    store.put(b"k1", b"value 1").unwrap();

    flip_bit(store.partition_mut(), 512 + 16, 1);

    assert_eq!(store.get_value(b"k1").unwrap(), b"value 1");
    assert!(store.error_detected());
    assert!(store.sectors().get(1).corrupt());

    // Lazy repair happens on maintenance.
    store.partial_maintenance().unwrap();
    assert!(!store.error_detected());
    assert_eq!(store.storage_stats().corrupt_sectors_recovered, 1);
    assert_eq!(addresses_of(&store, b"k1").len(), 2);
    assert_eq!(store.get_value(b"k1").unwrap(), b"value 1");
}

#[test]
fn test_immediate_recovery_repairs_after_read() {
    let mut store = open_store(flash(512, 4), config(ErrorRecovery::Immediate, 2));
    store.put(b"k1", b"value 1").unwrap();

    flip_bit(store.partition_mut(), 512 + 16, 1);

    assert_eq!(store.get_value(b"k1").unwrap(), b"value 1");
    assert!(!store.error_detected());
    assert!(!store.sectors().get(1).corrupt());

    let stats = store.storage_stats();
    assert_eq!(stats.corrupt_sectors_recovered, 1);
    let addresses = addresses_of(&store, b"k1");
    assert_eq!(addresses.len(), 2);
    assert!(!addresses.contains(&512));
}

#[test]
fn test_every_copy_damaged_is_data_loss() {
    let mut store = default_store();
    store.put(b"k1", b"value 1").unwrap();
    let address = addresses_of(&store, b"k1")[0];

    flip_bit(store.partition_mut(), address as usize + 16, 1);

    assert!(matches!(store.get_value(b"k1"), Err(KvsError::DataLoss(_))));
    assert!(store.error_detected());
}

#[test]
fn test_write_failure_marks_sector_corrupt() {
    let mut store = default_store();
    store.partition_mut().inject_write_error(512..1024);

    assert!(matches!(store.put(b"k1", b"value 1"), Err(KvsError::Flash(_))));
    assert!(store.sectors().get(1).corrupt());
    assert!(store.error_detected());

    // The next write avoids the corrupt sector.
    store.put(b"k1", b"value 1").unwrap();
    assert_ne!(sector_of(store.partition(), addresses_of(&store, b"k1")[0]), 1);

    store.partition_mut().clear_faults();
    store.partial_maintenance().unwrap();

    assert!(!store.error_detected());
    assert!(!store.sectors().get(1).corrupt());
    assert_eq!(store.storage_stats().corrupt_sectors_recovered, 1);
    assert_eq!(store.get_value(b"k1").unwrap(), b"value 1");
}
