//! Views over one cached key: its descriptor and its address slots

use tracing::debug;

use crate::entry::{EntryState, KeyDescriptor};
use crate::error::Result;
use crate::flash::Address;

/// The filled address slots of one key. Filled slots always form a prefix.
#[derive(Debug, Clone, Copy)]
pub struct AddressList<'a> {
    slots: &'a [Option<Address>],
}

impl<'a> AddressList<'a> {
    pub(crate) fn new(slots: &'a [Option<Address>]) -> Self {
        Self { slots }
    }

    pub fn iter(&self) -> impl Iterator<Item = Address> + 'a {
        self.slots.iter().map_while(|slot| *slot)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }

    pub fn first(&self) -> Option<Address> {
        self.slots.first().copied().flatten()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.iter().any(|a| a == address)
    }

    pub fn to_vec(&self) -> Vec<Address> {
        self.iter().collect()
    }
}

/// Read-only view of one cached key
#[derive(Debug, Clone, Copy)]
pub struct EntryMetadata<'a> {
    index: usize,
    descriptor: &'a KeyDescriptor,
    addresses: AddressList<'a>,
}

impl<'a> EntryMetadata<'a> {
    pub(crate) fn new(index: usize, descriptor: &'a KeyDescriptor, slots: &'a [Option<Address>]) -> Self {
        Self {
            index,
            descriptor,
            addresses: AddressList::new(slots),
        }
    }

    /// Position in the cache, valid until the next removal
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &'a KeyDescriptor {
        self.descriptor
    }

    pub fn hash(&self) -> u32 {
        self.descriptor.key_hash
    }

    pub fn transaction_id(&self) -> u32 {
        self.descriptor.transaction_id
    }

    pub fn state(&self) -> EntryState {
        self.descriptor.state
    }

    pub fn deleted(&self) -> bool {
        self.descriptor.deleted()
    }

    pub fn addresses(&self) -> AddressList<'a> {
        self.addresses
    }

    pub fn first_address(&self) -> Option<Address> {
        self.addresses.first()
    }
}

/// Mutable view of one cached key
#[derive(Debug)]
pub struct EntryMetadataMut<'a> {
    descriptor: &'a mut KeyDescriptor,
    slots: &'a mut [Option<Address>],
}

impl<'a> EntryMetadataMut<'a> {
    pub(crate) fn new(descriptor: &'a mut KeyDescriptor, slots: &'a mut [Option<Address>]) -> Self {
        Self { descriptor, slots }
    }

    pub fn descriptor(&self) -> &KeyDescriptor {
        self.descriptor
    }

    pub fn addresses(&self) -> AddressList<'_> {
        AddressList::new(self.slots)
    }

    /// Record another copy. Ignored once every redundancy slot is filled.
    pub fn add_new_address(&mut self, address: Address) {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(address),
            None => debug!(
                key_hash = self.descriptor.key_hash,
                address, "All redundancy slots in use; address not added"
            ),
        }
    }

    /// Forget one copy, keeping the remaining slots packed
    pub fn remove_address(&mut self, address: Address) {
        let Some(position) = self.slots.iter().position(|slot| *slot == Some(address)) else {
            return;
        };
        self.slots[position..].rotate_left(1);
        if let Some(last) = self.slots.last_mut() {
            *last = None;
        }
    }

    /// Replace one copy's address, e.g. after relocating it
    pub fn replace_address(&mut self, old: Address, new: Address) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| **slot == Some(old)) {
            *slot = Some(new);
        }
    }

    /// Point this key at a single, newer entry
    pub fn reset(&mut self, descriptor: KeyDescriptor, address: Address) {
        *self.descriptor = descriptor;
        self.slots.fill(None);
        self.slots[0] = Some(address);
    }
}

/// Outcome of a cache lookup plus the number of damaged copies skipped on the way
#[derive(Debug)]
pub struct Lookup<'a> {
    pub outcome: Result<EntryMetadata<'a>>,
    pub error_count: usize,
}
