//! Key hashing and key descriptors

/// Hash used to index keys in RAM. Keys themselves are never kept in memory.
pub fn hash(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    let mut coefficient: u32 = 65599;
    for &ch in key {
        hash = hash.wrapping_add(coefficient.wrapping_mul(ch as u32));
        coefficient = coefficient.wrapping_mul(65599);
    }
    hash
}

/// Whether a key currently holds a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Valid,
    /// Tombstone
    Deleted,
}

/// In-memory record of one logical key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub key_hash: u32,
    pub transaction_id: u32,
    pub state: EntryState,
}

impl KeyDescriptor {
    pub fn new(key_hash: u32, transaction_id: u32, state: EntryState) -> Self {
        Self {
            key_hash,
            transaction_id,
            state,
        }
    }

    pub fn deleted(&self) -> bool {
        self.state == EntryState::Deleted
    }
}
