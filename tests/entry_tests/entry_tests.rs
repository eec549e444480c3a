//! Tests for Entry
//!
//! These tests verify:
//! - Bit-exact header layout and padding
//! - Reading headers, keys and values back from flash
//! - Checksum coverage of header, key, value and padding
//! - Tombstones, format updates and copies
//! - The key hash

#[path = "../common/mod.rs"]
mod common;

use common::*;
use flashkvs::entry::{
    alignment_units, hash, Entry, EntryFormat, EntryFormats, EntryState, HEADER_SIZE, MAX_KEY_LENGTH,
};
use flashkvs::flash::InMemoryFlash;
use flashkvs::KvsError;

// =============================================================================
// Helper Functions
// =============================================================================

fn partition() -> InMemoryFlash {
    flash(256, 4)
}

fn read_back(flash: &InMemoryFlash, address: u32) -> flashkvs::Result<Entry> {
    Entry::read(flash, address, &formats())
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_header_layout() {
    let mut flash = partition();
    let entry = write_entry(&mut flash, 0, b"key1", b"value", 0x0102_0304);

    let bytes = &flash.bytes()[..HEADER_SIZE];
    assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
    assert_eq!(&bytes[4..8], &entry.checksum().to_le_bytes());
    assert_eq!(bytes[8], 0); // 16-byte alignment
    assert_eq!(bytes[9], 4);
    assert_eq!(&bytes[10..12], &5u16.to_le_bytes());
    assert_eq!(&bytes[12..16], &0x0102_0304u32.to_le_bytes());
}

#[test]
fn test_key_value_and_padding_layout() {
    let mut flash = partition();
    write_entry(&mut flash, 0, b"key1", b"value", 1);

    let bytes = flash.bytes();
    assert_eq!(&bytes[16..20], b"key1");
    assert_eq!(&bytes[20..25], b"value");
    assert!(bytes[25..32].iter().all(|&b| b == 0));
    assert!(bytes[32..48].iter().all(|&b| b == 0xFF));
}

#[test]
fn test_size_includes_padding() {
    let flash = partition();
    let entry = Entry::valid(&flash, 0, &crc_format(MAGIC), b"key1", b"value", 1);

    assert_eq!(entry.content_size(), 25);
    assert_eq!(entry.size(), 32);
    assert_eq!(entry.next_address(), 32);
    assert_eq!(Entry::size_for(&flash, b"key1", b"value"), 32);
}

#[test]
fn test_alignment_units_encoding() {
    assert_eq!(alignment_units(1), 0);
    assert_eq!(alignment_units(16), 0);
    assert_eq!(alignment_units(32), 1);
    assert_eq!(alignment_units(48), 2);
    assert_eq!(alignment_units(20), 1);
}

#[test]
fn test_wide_alignment_partition() {
    let mut flash = InMemoryFlash::new(512, 2, 32);
    let entry = Entry::valid(&flash, 0, &crc_format(MAGIC), b"k", b"v", 1);
    assert_eq!(entry.alignment_bytes(), 32);
    assert_eq!(entry.size(), 32);

    assert_eq!(entry.write(&mut flash, b"k", b"v").unwrap(), 32);
    let read = Entry::read(&flash, 0, &formats()).unwrap();
    assert_eq!(read.alignment_bytes(), 32);
    read.verify_checksum_in_flash(&flash).unwrap();
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "key length")]
fn test_new_entry_rejects_oversized_key() {
    let key = [b'k'; MAX_KEY_LENGTH + 1];
    Entry::valid(&partition(), 0, &crc_format(MAGIC), &key, b"v", 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "key length")]
fn test_new_entry_rejects_empty_key() {
    Entry::tombstone(&partition(), 0, &crc_format(MAGIC), b"", 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "exceeds")]
fn test_new_entry_rejects_oversized_value() {
    let value = vec![0u8; flashkvs::entry::MAX_VALUE_SIZE + 1];
    Entry::valid(&partition(), 0, &crc_format(MAGIC), b"k", &value, 1);
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_round_trip() {
    let mut flash = partition();
    write_entry(&mut flash, 64, b"temperature", b"21.5C", 7);

    let entry = read_back(&flash, 64).unwrap();
    assert_eq!(entry.address(), 64);
    assert_eq!(entry.transaction_id(), 7);
    assert_eq!(entry.key_length(), 11);
    assert_eq!(entry.value_size(), 5);
    assert!(!entry.deleted());

    let mut key = [0u8; MAX_KEY_LENGTH];
    let len = entry.read_key(&flash, &mut key).unwrap();
    assert_eq!(&key[..len], b"temperature");

    let mut value = [0u8; 16];
    let len = entry.read_value(&flash, &mut value, 0).unwrap();
    assert_eq!(&value[..len], b"21.5C");

    entry.verify_checksum_in_flash(&flash).unwrap();
    entry.verify_checksum(b"temperature", b"21.5C").unwrap();
}

#[test]
fn test_round_trip_large_value() {
    let mut flash = partition();
    let value: Vec<u8> = (0..200u8).collect();
    write_entry(&mut flash, 0, b"blob", &value, 1);

    let entry = read_back(&flash, 0).unwrap();
    let mut out = vec![0u8; 200];
    assert_eq!(entry.read_value(&flash, &mut out, 0).unwrap(), 200);
    assert_eq!(out, value);
    entry.verify_checksum_in_flash(&flash).unwrap();
}

#[test]
fn test_read_erased_is_not_found() {
    let flash = partition();
    assert!(matches!(read_back(&flash, 0), Err(KvsError::NotFound)));
}

#[test]
fn test_read_unknown_magic_is_data_loss() {
    let mut flash = partition();
    let entry = Entry::valid(&flash, 0, &crc_format(OLD_MAGIC), b"k", b"v", 1);
    entry.write(&mut flash, b"k", b"v").unwrap();

    assert!(matches!(read_back(&flash, 0), Err(KvsError::DataLoss(_))));
}

#[test]
fn test_read_oversized_key_length_is_data_loss() {
    let mut flash = partition();
    write_entry(&mut flash, 0, b"k", b"v", 1);
    flash.bytes_mut()[9] = 64;

    assert!(matches!(read_back(&flash, 0), Err(KvsError::DataLoss(_))));
}

#[test]
fn test_read_key_rejects_bad_lengths() {
    let mut flash = partition();
    write_entry(&mut flash, 0, b"k", b"v", 1);
    let mut key = [0u8; MAX_KEY_LENGTH];

    assert!(matches!(
        Entry::read_key_at(&flash, 0, 0, &mut key),
        Err(KvsError::DataLoss(_))
    ));
    assert!(matches!(
        Entry::read_key_at(&flash, 0, MAX_KEY_LENGTH + 1, &mut key),
        Err(KvsError::DataLoss(_))
    ));
    assert_eq!(Entry::read_key_at(&flash, 0, 1, &mut key).unwrap(), 1);
    assert_eq!(key[0], b'k');
}

#[test]
fn test_read_value_partial_and_offset() {
    let mut flash = partition();
    write_entry(&mut flash, 0, b"k", b"0123456789", 1);
    let entry = read_back(&flash, 0).unwrap();

    let mut small = [0u8; 4];
    match entry.read_value(&flash, &mut small, 0) {
        Err(KvsError::BufferTooSmall { copied, value_size }) => {
            assert_eq!(copied, 4);
            assert_eq!(value_size, 10);
        }
        other => panic!("expected short read, got {:?}", other),
    }
    assert_eq!(&small, b"0123");

    let mut rest = [0u8; 16];
    assert_eq!(entry.read_value(&flash, &mut rest, 6).unwrap(), 4);
    assert_eq!(&rest[..4], b"6789");

    assert_eq!(entry.read_value(&flash, &mut rest, 10).unwrap(), 0);
    assert!(matches!(
        entry.read_value(&flash, &mut rest, 11),
        Err(KvsError::OutOfRange(_))
    ));
}

#[test]
fn test_value_matches() {
    let mut flash = partition();
    let value: Vec<u8> = (0..100u8).collect();
    write_entry(&mut flash, 0, b"k", &value, 1);
    let entry = read_back(&flash, 0).unwrap();

    entry.value_matches(&flash, &value).unwrap();

    let mut changed = value.clone();
    changed[70] ^= 1;
    assert!(matches!(entry.value_matches(&flash, &changed), Err(KvsError::NotFound)));
    assert!(matches!(entry.value_matches(&flash, &value[..99]), Err(KvsError::NotFound)));
}

// =============================================================================
// Checksum Tests
// =============================================================================

#[test]
fn test_verify_checksum_detects_wrong_value() {
    let mut flash = partition();
    write_entry(&mut flash, 0, b"k", b"value", 1);
    let entry = read_back(&flash, 0).unwrap();

    assert!(matches!(
        entry.verify_checksum(b"k", b"valuE"),
        Err(KvsError::DataLoss(_))
    ));
}

#[test]
fn test_every_bit_flip_is_detected() {
    let mut pristine = partition();
    let entry = write_entry(&mut pristine, 0, b"key1", b"value", 3);

    // Header, key, value and padding.
    for address in 0..entry.size() {
        for bit in 0..8 {
            let mut flash = pristine.clone();
            flip_bit(&mut flash, address, bit);

            let result = read_back(&flash, 0).and_then(|e| e.verify_checksum_in_flash(&flash));
            assert!(
                matches!(result, Err(KvsError::DataLoss(_))),
                "flip of bit {} at byte {} went unnoticed: {:?}",
                bit,
                address,
                result
            );
        }
    }
}

#[test]
fn test_verify_in_flash_leaves_flash_untouched() {
    let mut flash = partition();
    write_entry(&mut flash, 0, b"key1", b"value", 3);
    let before = flash.bytes().to_vec();

    let entry = read_back(&flash, 0).unwrap();
    entry.verify_checksum_in_flash(&flash).unwrap();
    entry.verify_checksum_in_flash(&flash).unwrap();

    assert_eq!(flash.bytes(), &before[..]);
}

#[test]
fn test_unchecked_format_stores_zero() {
    let formats = EntryFormats::single(EntryFormat::unchecked(MAGIC));
    let mut flash = partition();
    let entry = Entry::valid(&flash, 0, formats.primary(), b"k", b"v", 1);
    assert_eq!(entry.checksum(), 0);
    entry.write(&mut flash, b"k", b"v").unwrap();

    let read = Entry::read(&flash, 0, &formats).unwrap();
    read.verify_checksum_in_flash(&flash).unwrap();
    read.verify_checksum(b"k", b"v").unwrap();
}

#[test]
fn test_unchecked_format_rejects_nonzero_checksum() {
    let formats = EntryFormats::single(EntryFormat::unchecked(MAGIC));
    let mut flash = partition();
    Entry::valid(&flash, 0, formats.primary(), b"k", b"v", 1)
        .write(&mut flash, b"k", b"v")
        .unwrap();
    flash.bytes_mut()[4] = 0x5A;

    let read = Entry::read(&flash, 0, &formats).unwrap();
    assert!(matches!(read.verify_checksum_in_flash(&flash), Err(KvsError::DataLoss(_))));
    assert!(matches!(read.verify_checksum(b"k", b"v"), Err(KvsError::DataLoss(_))));
}

// =============================================================================
// Tombstone Tests
// =============================================================================

#[test]
fn test_tombstone() {
    let mut flash = partition();
    let tombstone = Entry::tombstone(&flash, 0, &crc_format(MAGIC), b"gone", 9);
    assert!(tombstone.deleted());
    assert_eq!(tombstone.value_size(), 0);
    assert_eq!(tombstone.size(), 32);

    tombstone.write(&mut flash, b"gone", &[]).unwrap();
    assert_eq!(&flash.bytes()[10..12], &[0xFF, 0xFF]);

    let read = read_back(&flash, 0).unwrap();
    assert!(read.deleted());
    read.verify_checksum_in_flash(&flash).unwrap();

    let descriptor = read.descriptor(b"gone");
    assert_eq!(descriptor.state, EntryState::Deleted);
    assert_eq!(descriptor.key_hash, hash(b"gone"));
    assert_eq!(descriptor.transaction_id, 9);
}

// =============================================================================
// Update and Copy Tests
// =============================================================================

#[test]
fn test_copy_to_new_address() {
    let mut flash = partition();
    let value: Vec<u8> = (0..90u8).collect();
    write_entry(&mut flash, 0, b"moving", &value, 4);
    let entry = read_back(&flash, 0).unwrap();

    let written = entry.copy(&mut flash, 256).unwrap();
    assert_eq!(written, entry.size());

    let copy = read_back(&flash, 256).unwrap();
    assert_eq!(copy.transaction_id(), 4);
    copy.verify_checksum_in_flash(&flash).unwrap();

    let mut out = vec![0u8; 90];
    copy.read_value(&flash, &mut out, 0).unwrap();
    assert_eq!(out, value);
}

#[test]
fn test_update_to_new_format() {
    let mut flash = partition();
    let old = crc_format(OLD_MAGIC);
    Entry::valid(&flash, 0, &old, b"k", b"payload", 1)
        .write(&mut flash, b"k", b"payload")
        .unwrap();

    let formats = EntryFormats::new(vec![crc_format(MAGIC), old]).unwrap();
    let mut entry = Entry::read(&flash, 0, &formats).unwrap();
    assert_eq!(entry.magic(), OLD_MAGIC);

    entry.update(&flash, formats.primary(), 2).unwrap();
    assert_eq!(entry.magic(), MAGIC);
    assert_eq!(entry.transaction_id(), 2);
    entry.verify_checksum(b"k", b"payload").unwrap();

    entry.copy(&mut flash, 256).unwrap();
    let migrated = Entry::read(&flash, 256, &formats).unwrap();
    assert_eq!(migrated.magic(), MAGIC);
    assert_eq!(migrated.transaction_id(), 2);
    migrated.verify_checksum_in_flash(&flash).unwrap();
}

#[test]
fn test_formats_reject_duplicates() {
    assert!(matches!(
        EntryFormats::new(vec![crc_format(MAGIC), crc_format(MAGIC)]),
        Err(KvsError::InvalidArgument(_))
    ));
    assert!(matches!(EntryFormats::new(Vec::new()), Err(KvsError::InvalidArgument(_))));
}

// =============================================================================
// Hash Tests
// =============================================================================

#[test]
fn test_hash_values() {
    assert_eq!(hash(b""), 0);
    assert_eq!(hash(b"a"), 0x0061_17df);
    assert_ne!(hash(b"ab"), hash(b"ba"));
}

#[test]
fn test_hash_collision_pair() {
    assert_eq!(hash(b"PPPPP"), hash(b"H0oOX"));
    assert_eq!(hash(b"PPPPP"), 0xd992_3bb0);
}
