//! Shared store handle
//!
//! The store assumes one logical writer. `SharedStore` provides that by
//! putting the whole store behind a single mutex; every clone of the handle
//! serializes on it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::flash::FlashPartition;
use crate::store::KeyValueStore;

/// Cloneable, thread-safe handle to a [`KeyValueStore`]
pub struct SharedStore<F: FlashPartition> {
    inner: Arc<Mutex<KeyValueStore<F>>>,
}

impl<F: FlashPartition> Clone for SharedStore<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: FlashPartition> SharedStore<F> {
    pub fn new(store: KeyValueStore<F>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().put(key, value)
    }

    pub fn get_value(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.inner.lock().get_value(key)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.lock().delete(key)
    }

    /// Run `f` with exclusive access to the store
    pub fn with<R>(&self, f: impl FnOnce(&mut KeyValueStore<F>) -> R) -> R {
        let mut store = self.inner.lock();
        f(&mut store)
    }
}
