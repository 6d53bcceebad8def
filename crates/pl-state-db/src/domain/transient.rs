//! Transient storage: per-transaction key/value store, discarded when a new
//! transaction context begins. Writes are journaled like regular storage so
//! reverts restore previous values.

use super::entities::{Address, StorageKey, StorageValue};
use primitive_types::H256;
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct TransientStorage {
    slots: HashMap<Address, HashMap<StorageKey, StorageValue>>,
}

impl TransientStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address, key: &StorageKey) -> StorageValue {
        self.slots
            .get(address)
            .and_then(|s| s.get(key))
            .copied()
            .unwrap_or_else(H256::zero)
    }

    /// Store a value; zero values clear the slot.
    pub fn set(&mut self, address: Address, key: StorageKey, value: StorageValue) {
        if value.is_zero() {
            if let Some(slots) = self.slots.get_mut(&address) {
                slots.remove(&key);
                if slots.is_empty() {
                    self.slots.remove(&address);
                }
            }
        } else {
            self.slots.entry(address).or_default().insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::H160;

    #[test]
    fn test_unset_slot_reads_zero() {
        let store = TransientStorage::new();
        assert_eq!(
            store.get(&H160::repeat_byte(1), &H256::repeat_byte(2)),
            H256::zero()
        );
    }

    #[test]
    fn test_set_and_clear() {
        let mut store = TransientStorage::new();
        let addr = H160::repeat_byte(1);
        let key = H256::repeat_byte(2);
        store.set(addr, key, H256::repeat_byte(3));
        assert_eq!(store.get(&addr, &key), H256::repeat_byte(3));

        store.set(addr, key, H256::zero());
        assert_eq!(store.get(&addr, &key), H256::zero());
        assert!(store.slots.is_empty());
    }
}
