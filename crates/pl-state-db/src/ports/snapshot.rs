//! # Snapshot Port
//!
//! Flat acceleration layer over the trie: account and storage lookups by
//! hash without trie traversal, plus ordered storage iteration for the fast
//! deletion path. The layer is optional; the state manager degrades to trie
//! reads when no snapshot covers its root.

use crate::domain::entities::{Hash, StateAccount, EMPTY_CODE_HASH, EMPTY_ROOT_HASH};
use crate::domain::errors::StateError;
use primitive_types::U256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Account record as the snapshot layer stores it: slim fields with the
/// empty root and code hash elided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotAccount {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: Option<Hash>,
    pub code_hash: Option<Hash>,
}

impl SnapshotAccount {
    pub fn from_account(account: &StateAccount) -> Self {
        Self {
            nonce: account.nonce,
            balance: account.balance,
            storage_root: (account.storage_root != EMPTY_ROOT_HASH).then_some(account.storage_root),
            code_hash: (account.code_hash != EMPTY_CODE_HASH).then_some(account.code_hash),
        }
    }

    pub fn to_account(&self) -> StateAccount {
        StateAccount {
            nonce: self.nonce,
            balance: self.balance,
            storage_root: self.storage_root.unwrap_or(EMPTY_ROOT_HASH),
            code_hash: self.code_hash.unwrap_or(EMPTY_CODE_HASH),
        }
    }
}

/// Ordered iterator over one account's storage, yielding
/// `(slot_hash, encoded_value)` pairs.
pub trait StorageIterator: Send {
    fn next(&mut self) -> Result<Option<(Hash, Vec<u8>)>, StateError>;
}

/// Read access to the flat state at one root.
pub trait AccountSnapshot: Send + Sync {
    fn root(&self) -> Hash;
    /// Account by address hash; `Ok(None)` means definitively absent.
    fn account(&self, addr_hash: Hash) -> Result<Option<SnapshotAccount>, StateError>;
    /// Storage slot by hashes; the blob is the trimmed big-endian value.
    fn storage(&self, addr_hash: Hash, slot_hash: Hash) -> Result<Option<Vec<u8>>, StateError>;
}

/// The layered snapshot tree spanning recent blocks.
pub trait SnapshotTree: Send + Sync {
    /// Snapshot at a root, when one exists.
    fn snapshot(&self, root: Hash) -> Option<Arc<dyn AccountSnapshot>>;
    /// Iterate an account's storage at a root, starting at `start`.
    fn storage_iterator(
        &self,
        root: Hash,
        addr_hash: Hash,
        start: Hash,
    ) -> Result<Box<dyn StorageIterator>, StateError>;
    /// Layer a block's flat diff on top of its parent.
    #[allow(clippy::too_many_arguments)]
    fn update(
        &self,
        root: Hash,
        parent: Hash,
        destructs: HashSet<Hash>,
        accounts: HashMap<Hash, Vec<u8>>,
        storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    ) -> Result<(), StateError>;
    /// Flatten layers below `root` down to at most `layers` diffs.
    fn cap(&self, root: Hash, layers: usize) -> Result<(), StateError>;
}

/// Stand-in snapshot used when no layer covers the requested root. Every
/// lookup reports unavailability so callers fall back to the trie.
pub struct FallbackSnapshot {
    root: Hash,
}

impl FallbackSnapshot {
    pub fn new(root: Hash) -> Self {
        Self { root }
    }
}

impl AccountSnapshot for FallbackSnapshot {
    fn root(&self) -> Hash {
        self.root
    }

    fn account(&self, _addr_hash: Hash) -> Result<Option<SnapshotAccount>, StateError> {
        Err(StateError::SnapshotUnavailable { root: self.root })
    }

    fn storage(&self, _addr_hash: Hash, _slot_hash: Hash) -> Result<Option<Vec<u8>>, StateError> {
        Err(StateError::SnapshotUnavailable { root: self.root })
    }
}
