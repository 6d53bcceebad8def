//! # Per-Account Mutation Buffer
//!
//! A `StateObject` buffers all mutations of one account during block
//! execution. Storage changes move through three layers:
//!
//! - `dirty_storage`: writes of the current transaction, revertible.
//! - `pending_storage`: writes accepted at transaction boundaries.
//! - `original_storage`: values as loaded from pre-block storage, a read
//!   cache that also short-circuits no-op writes.
//!
//! Accounts are plain data here; loading from the backing trie or snapshot
//! is driven by the state manager, which owns the database handles.

use super::entities::{
    hash_address, keccak256, Address, Hash, StateAccount, StorageKey, StorageValue,
    EMPTY_CODE_HASH,
};
use primitive_types::U256;
use std::collections::HashMap;
use std::sync::Arc;

/// One account's in-memory mutation state.
#[derive(Clone, Debug)]
pub struct StateObject {
    pub address: Address,
    /// Keccak hash of the address, the key used by trie and snapshot layers.
    pub addr_hash: Hash,
    /// Current (possibly mutated) account fields.
    pub data: StateAccount,
    /// Account fields as they stood at the start of the block; `None` when
    /// the account did not exist then.
    pub origin: Option<StateAccount>,

    /// Contract code, loaded lazily by the state manager.
    pub code: Option<Arc<Vec<u8>>>,
    pub dirty_code: bool,

    pub original_storage: HashMap<StorageKey, StorageValue>,
    pub pending_storage: HashMap<StorageKey, StorageValue>,
    pub dirty_storage: HashMap<StorageKey, StorageValue>,

    /// Marked for deletion at the end of the transaction.
    pub self_destructed: bool,
    /// Excluded from further reads and from the commit.
    pub deleted: bool,
    /// Created inside the current block; its storage cannot predate it.
    pub created: bool,
}

impl StateObject {
    /// Wrap loaded account data. `origin` is the pre-block value used later
    /// for reverse-diff construction.
    pub fn new(address: Address, data: StateAccount, origin: Option<StateAccount>) -> Self {
        Self {
            address,
            addr_hash: hash_address(&address),
            data,
            origin,
            code: None,
            dirty_code: false,
            original_storage: HashMap::new(),
            pending_storage: HashMap::new(),
            dirty_storage: HashMap::new(),
            self_destructed: false,
            deleted: false,
            created: false,
        }
    }

    /// Fresh account that does not exist in pre-block storage.
    pub fn new_created(address: Address) -> Self {
        let mut object = Self::new(address, StateAccount::default(), None);
        object.created = true;
        object
    }

    /// An account is empty when nonce, balance, and code are all zero.
    /// Empty accounts are pruned at transaction boundaries.
    pub fn is_empty(&self) -> bool {
        self.data.nonce == 0 && self.data.balance.is_zero() && self.data.code_hash == EMPTY_CODE_HASH
    }

    pub fn balance(&self) -> U256 {
        self.data.balance
    }

    pub fn nonce(&self) -> u64 {
        self.data.nonce
    }

    pub fn code_hash(&self) -> Hash {
        self.data.code_hash
    }

    pub fn set_balance(&mut self, balance: U256) {
        self.data.balance = balance;
    }

    pub fn add_balance(&mut self, amount: U256) {
        self.data.balance = self.data.balance.saturating_add(amount);
    }

    pub fn sub_balance(&mut self, amount: U256) {
        self.data.balance = self.data.balance.saturating_sub(amount);
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.data.nonce = nonce;
    }

    pub fn set_code(&mut self, code: Vec<u8>) {
        self.data.code_hash = keccak256(&code);
        self.code = Some(Arc::new(code));
        self.dirty_code = true;
    }

    /// Current value of a slot as seen by the running transaction. `None`
    /// means the value has not been buffered and must be loaded.
    pub fn cached_storage(&self, key: &StorageKey) -> Option<StorageValue> {
        if let Some(value) = self.dirty_storage.get(key) {
            return Some(*value);
        }
        self.committed_cached_storage(key)
    }

    /// Value of a slot ignoring the current transaction's dirty writes.
    pub fn committed_cached_storage(&self, key: &StorageKey) -> Option<StorageValue> {
        if let Some(value) = self.pending_storage.get(key) {
            return Some(*value);
        }
        self.original_storage.get(key).copied()
    }

    /// Buffer a storage write. Returns the previous transaction-visible
    /// value when one was cached, for journaling.
    pub fn set_storage(&mut self, key: StorageKey, value: StorageValue) -> Option<StorageValue> {
        let prev = self.cached_storage(&key);
        self.dirty_storage.insert(key, value);
        prev
    }

    /// Move the current transaction's writes into the pending layer.
    /// Called at transaction acceptance; pending survives reverts of later
    /// transactions.
    pub fn finalise(&mut self) {
        for (key, value) in self.dirty_storage.drain() {
            self.pending_storage.insert(key, value);
        }
    }

    /// True when this object carries changes the commit must persist.
    pub fn has_pending_storage(&self) -> bool {
        !self.pending_storage.is_empty()
    }
}
