//! Per-transaction warm access tracking for accounts and storage slots.
//! Reset when a new transaction context begins; additions are journaled so
//! reverts can cool entries back down.

use super::entities::{Address, StorageKey};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, Default)]
pub struct AccessList {
    addresses: HashMap<Address, HashSet<StorageKey>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.addresses.contains_key(address)
    }

    /// Returns `(address_present, slot_present)`.
    pub fn contains(&self, address: &Address, slot: &StorageKey) -> (bool, bool) {
        match self.addresses.get(address) {
            Some(slots) => (true, slots.contains(slot)),
            None => (false, false),
        }
    }

    /// Add an address; true when it was not already present.
    pub fn add_address(&mut self, address: Address) -> bool {
        if self.addresses.contains_key(&address) {
            return false;
        }
        self.addresses.insert(address, HashSet::new());
        true
    }

    /// Add a slot, warming its address as needed. Returns
    /// `(address_added, slot_added)`.
    pub fn add_slot(&mut self, address: Address, slot: StorageKey) -> (bool, bool) {
        let address_added = !self.addresses.contains_key(&address);
        let slots = self.addresses.entry(address).or_default();
        let slot_added = slots.insert(slot);
        (address_added, slot_added)
    }

    /// Undo for a journaled slot addition.
    pub fn remove_slot(&mut self, address: &Address, slot: &StorageKey) {
        if let Some(slots) = self.addresses.get_mut(address) {
            slots.remove(slot);
        }
    }

    /// Undo for a journaled address addition.
    pub fn remove_address(&mut self, address: &Address) {
        self.addresses.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::{H160, H256};

    #[test]
    fn test_add_address_idempotent() {
        let mut list = AccessList::new();
        let addr = H160::repeat_byte(1);
        assert!(list.add_address(addr));
        assert!(!list.add_address(addr));
        assert!(list.contains_address(&addr));
    }

    #[test]
    fn test_add_slot_warms_address() {
        let mut list = AccessList::new();
        let addr = H160::repeat_byte(1);
        let slot = H256::repeat_byte(2);
        assert_eq!(list.add_slot(addr, slot), (true, true));
        assert_eq!(list.add_slot(addr, slot), (false, false));
        assert_eq!(list.contains(&addr, &slot), (true, true));
    }

    #[test]
    fn test_remove_slot_keeps_address() {
        let mut list = AccessList::new();
        let addr = H160::repeat_byte(1);
        let slot = H256::repeat_byte(2);
        list.add_slot(addr, slot);
        list.remove_slot(&addr, &slot);
        assert_eq!(list.contains(&addr, &slot), (true, false));
    }
}
