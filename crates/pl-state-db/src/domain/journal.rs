//! # Change Journal
//!
//! Records every state mutation as an undoable entry. Snapshots are cheap
//! (an index into the entry list) and reverting replays entries backwards.
//!
//! The journal also tracks which accounts were dirtied and how many times,
//! so transaction finalisation knows exactly which objects to fold in. The
//! undo logic itself lives on the state manager, which owns the objects and
//! caches the entries refer to.

use super::entities::{Address, Hash, StateAccount, StorageKey, StorageValue};
use super::object::StateObject;
use primitive_types::U256;
use std::collections::HashMap;
use std::sync::Arc;

/// One reversible mutation.
#[derive(Clone, Debug)]
pub enum JournalEntry {
    /// A fresh object entered the live set.
    ObjectCreated { address: Address },
    /// An existing object was replaced by a newly created one. Carries
    /// everything needed to restore the replaced object and the per-block
    /// cache entries that were overwritten alongside it.
    ObjectReset {
        address: Address,
        prev: Option<Box<StateObject>>,
        prev_destruct: Option<Option<StateAccount>>,
        prev_account: Option<Vec<u8>>,
        prev_storage: Option<HashMap<Hash, Vec<u8>>>,
        /// `Some(entry)` when the address had an original-account record.
        prev_account_origin: Option<Option<Vec<u8>>>,
        prev_storage_origin: Option<HashMap<StorageKey, Option<Vec<u8>>>>,
    },
    SelfDestruct {
        address: Address,
        prev: bool,
        prev_balance: U256,
    },
    BalanceChange {
        address: Address,
        prev: U256,
    },
    NonceChange {
        address: Address,
        prev: u64,
    },
    StorageChange {
        address: Address,
        key: StorageKey,
        /// `None` when the slot had no buffered value before this write.
        prev: Option<StorageValue>,
    },
    CodeChange {
        address: Address,
        prev_code: Option<Arc<Vec<u8>>>,
        prev_hash: Hash,
    },
    RefundChange {
        prev: u64,
    },
    AccessListAddAccount {
        address: Address,
    },
    AccessListAddSlot {
        address: Address,
        slot: StorageKey,
    },
    TransientStorageChange {
        address: Address,
        key: StorageKey,
        prev: StorageValue,
    },
}

impl JournalEntry {
    /// Address this entry dirties, if any.
    pub fn dirtied(&self) -> Option<Address> {
        match self {
            JournalEntry::ObjectCreated { address }
            | JournalEntry::ObjectReset { address, .. }
            | JournalEntry::SelfDestruct { address, .. }
            | JournalEntry::BalanceChange { address, .. }
            | JournalEntry::NonceChange { address, .. }
            | JournalEntry::StorageChange { address, .. }
            | JournalEntry::CodeChange { address, .. }
            | JournalEntry::TransientStorageChange { address, .. } => Some(*address),
            JournalEntry::RefundChange { .. }
            | JournalEntry::AccessListAddAccount { .. }
            | JournalEntry::AccessListAddSlot { .. } => None,
        }
    }
}

/// Ordered log of entries plus per-address dirty counts.
#[derive(Default)]
pub struct Journal {
    pub entries: Vec<JournalEntry>,
    pub dirties: HashMap<Address, usize>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: JournalEntry) {
        if let Some(address) = entry.dirtied() {
            *self.dirties.entry(address).or_insert(0) += 1;
        }
        self.entries.push(entry);
    }

    /// Explicitly mark an address dirty without a revertible entry.
    pub fn dirty(&mut self, address: Address) {
        *self.dirties.entry(address).or_insert(0) += 1;
    }

    /// Drop the dirty count added by a reverted entry.
    pub fn undirty(&mut self, address: Address) {
        if let Some(count) = self.dirties.get_mut(&address) {
            *count -= 1;
            if *count == 0 {
                self.dirties.remove(&address);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirties.clear();
    }
}
