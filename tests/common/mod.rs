//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use flashkvs::checksum::Crc32;
use flashkvs::entry::{hash, Entry, EntryFormat, EntryFormats};
use flashkvs::flash::{Address, FlashPartition, InMemoryFlash};
use flashkvs::{Config, KeyValueStore};
use tracing_subscriber::EnvFilter;

pub const MAGIC: u32 = 0x600d_f00d;
pub const OLD_MAGIC: u32 = 0x0bad_c0de;

/// Route tracing output through the test harness (RUST_LOG=flashkvs=debug)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn crc_format(magic: u32) -> EntryFormat {
    EntryFormat::new(magic, Some(Arc::new(Crc32)))
}

pub fn formats() -> EntryFormats {
    EntryFormats::single(crc_format(MAGIC))
}

/// Erased in-memory partition with 16-byte writes
pub fn flash(sector_size: usize, sector_count: usize) -> InMemoryFlash {
    InMemoryFlash::new(sector_size, sector_count, 16)
}

/// Store over `flash`, already initialized
pub fn open_store(flash: InMemoryFlash, config: Config) -> KeyValueStore<InMemoryFlash> {
    init_tracing();
    let mut store = KeyValueStore::new(flash, formats(), config);
    store.init().unwrap();
    store
}

/// Fresh 4 x 512 byte store with default options
pub fn default_store() -> KeyValueStore<InMemoryFlash> {
    open_store(flash(512, 4), Config::default())
}

/// Write one valid entry straight to flash, bypassing any store
pub fn write_entry(
    flash: &mut InMemoryFlash,
    address: Address,
    key: &[u8],
    value: &[u8],
    transaction_id: u32,
) -> Entry {
    let entry = Entry::valid(&*flash, address, &crc_format(MAGIC), key, value, transaction_id);
    entry.write(flash, key, value).unwrap();
    entry
}

/// Addresses of every cached copy of `key`
pub fn addresses_of(store: &KeyValueStore<InMemoryFlash>, key: &[u8]) -> Vec<Address> {
    let cache = store.cache();
    let index = cache.find_index(hash(key)).expect("key is cached");
    cache.metadata(index).addresses().to_vec()
}

/// Flip one bit of the partition content
pub fn flip_bit(flash: &mut InMemoryFlash, address: usize, bit: u8) {
    flash.bytes_mut()[address] ^= 1 << bit;
}

/// Sector index holding `address`
pub fn sector_of(flash: &impl FlashPartition, address: Address) -> usize {
    address as usize / flash.sector_size_bytes()
}
