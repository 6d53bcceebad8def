//! # Database Port
//!
//! Trait seams between the state manager and the backing trie database.
//! Adapters implement these; the domain never sees a concrete store.

use crate::domain::entities::{Address, Hash, StateAccount, StorageKey, StorageValue};
use crate::domain::errors::StateError;
use std::collections::HashMap;
use std::sync::Arc;

/// How the trie database organizes nodes on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrieScheme {
    /// Nodes keyed by hash; stale storage is reclaimed by external pruning,
    /// so destroyed-contract storage is left in place at commit.
    Hash,
    /// Nodes keyed by path; destroyed-contract storage must be deleted
    /// inline at commit.
    Path,
}

/// A trie node mutation collected during commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrieNode {
    Deleted,
    Updated(Vec<u8>),
}

/// Node mutations of a single trie, keyed by node path. `owner` is the zero
/// hash for the account trie and the account's address hash for storage
/// tries.
#[derive(Clone, Debug, Default)]
pub struct NodeSet {
    pub owner: Hash,
    pub nodes: HashMap<Vec<u8>, TrieNode>,
}

impl NodeSet {
    pub fn new(owner: Hash) -> Self {
        Self {
            owner,
            nodes: HashMap::new(),
        }
    }

    pub fn mark_deleted(&mut self, path: Vec<u8>) {
        self.nodes.insert(path, TrieNode::Deleted);
    }

    pub fn mark_updated(&mut self, path: Vec<u8>, blob: Vec<u8>) {
        self.nodes.insert(path, TrieNode::Updated(blob));
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Node sets of all tries touched by one commit, keyed by owner.
#[derive(Debug, Default)]
pub struct MergedNodeSet {
    pub sets: HashMap<Hash, NodeSet>,
}

impl MergedNodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one trie's node set in. Each owner may be merged once.
    pub fn merge(&mut self, set: NodeSet) -> Result<(), StateError> {
        if self.sets.contains_key(&set.owner) {
            return Err(StateError::NodeSetConflict { owner: set.owner });
        }
        self.sets.insert(set.owner, set);
        Ok(())
    }
}

/// Original (pre-block) values accompanying a commit, from which the trie
/// database builds its reverse diff.
#[derive(Debug, Default)]
pub struct StateSetOrigin {
    /// Pre-block slim-encoded accounts; `None` marks accounts that did not
    /// exist before the block.
    pub accounts: HashMap<Address, Option<Vec<u8>>>,
    /// Pre-block storage values; `None` marks slots absent before the block.
    pub storages: HashMap<Address, HashMap<StorageKey, Option<Vec<u8>>>>,
    /// Addresses whose storage wipe exceeded the deletion budget; their
    /// storage origin is untrustworthy and was withheld.
    pub incomplete: std::collections::HashSet<Address>,
}

/// Item yielded by a trie node iterator.
#[derive(Clone, Debug)]
pub enum TrieItem {
    /// A value-bearing leaf: full key and stored blob.
    Leaf { key: Vec<u8>, blob: Vec<u8> },
    /// An interior node: its path and hash (zero for embedded nodes).
    Node { path: Vec<u8>, hash: Hash },
}

/// Pre-order traversal over a trie's nodes and leaves.
pub trait NodeIterator: Send {
    fn next(&mut self) -> Result<Option<TrieItem>, StateError>;
}

/// The account trie of one block's state.
pub trait AccountTrie: Send + Sync {
    fn get_account(&self, address: &Address) -> Result<Option<StateAccount>, StateError>;
    fn update_account(&mut self, address: &Address, account: &StateAccount)
        -> Result<(), StateError>;
    fn delete_account(&mut self, address: &Address) -> Result<(), StateError>;
    /// Record new contract code against its owning account.
    fn update_contract_code(
        &mut self,
        address: &Address,
        code_hash: Hash,
        code: &[u8],
    ) -> Result<(), StateError>;
    /// Root over all updates so far. Repeatable.
    fn hash(&mut self) -> Hash;
    /// Finalize and collect node mutations. `collect_leaf` asks for leaf
    /// blobs to be included in the node set.
    fn commit(&mut self, collect_leaf: bool) -> Result<(Hash, Option<NodeSet>), StateError>;
}

/// One account's storage trie.
pub trait StorageTrie: Send + Sync {
    fn get_storage(&self, key: &StorageKey) -> Result<Option<StorageValue>, StateError>;
    fn update_storage(&mut self, key: &StorageKey, value: &[u8]) -> Result<(), StateError>;
    fn delete_storage(&mut self, key: &StorageKey) -> Result<(), StateError>;
    fn hash(&mut self) -> Hash;
    fn commit(&mut self, collect_leaf: bool) -> Result<(Hash, Option<NodeSet>), StateError>;
    /// Iterate the trie as stored, for the slow storage-wipe path.
    fn node_iterator(&self) -> Result<Box<dyn NodeIterator>, StateError>;
}

/// Write-once trie builder fed with key-ordered entries; produces the root
/// and the deletion markers used to wipe a contract's storage.
pub trait StackTrieBuilder: Send {
    fn update(&mut self, key: &[u8], blob: Vec<u8>) -> Result<(), StateError>;
    fn finalize(self: Box<Self>) -> (Hash, NodeSet);
}

/// Handle on the node store underneath all tries.
pub trait TrieDatabase: Send + Sync {
    fn scheme(&self) -> TrieScheme;
    /// Persist one block's node mutations together with the reverse diff.
    fn update(
        &self,
        root: Hash,
        parent: Hash,
        block: u64,
        nodes: MergedNodeSet,
        origin: StateSetOrigin,
    ) -> Result<(), StateError>;
}

/// Factory for tries and code storage against one backing store.
pub trait Database: Send + Sync {
    /// Open the account trie at a state root.
    fn open_trie(&self, root: Hash) -> Result<Box<dyn AccountTrie>, StateError>;
    /// Open one account's storage trie.
    fn open_storage_trie(
        &self,
        state_root: Hash,
        address: &Address,
        root: Hash,
    ) -> Result<Box<dyn StorageTrie>, StateError>;
    fn read_code(&self, address: &Address, code_hash: Hash) -> Result<Arc<Vec<u8>>, StateError>;
    fn write_code(&self, address: &Address, code_hash: Hash, code: &[u8]);
    /// Builder used to re-derive a storage root from iterated slots.
    fn new_stack_builder(&self, owner: Hash) -> Box<dyn StackTrieBuilder>;
    fn trie_db(&self) -> Arc<dyn TrieDatabase>;
}
