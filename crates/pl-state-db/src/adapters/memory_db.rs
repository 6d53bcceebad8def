//! # In-Memory State Backend
//!
//! Reference adapter over the database and snapshot ports. State worlds
//! are content-addressed: each account-trie root maps to a full account
//! set, each storage root to a full slot set, so any previously hashed
//! root can be reopened. Roots are deterministic digests over the sorted
//! entries.
//!
//! The trie database records every committed update, including the reverse
//! diff, so tests can inspect exactly what a commit persisted.

use crate::domain::entities::{
    decode_slot_value, hash_address, hash_slot, keccak256, Address, Hash, StateAccount,
    StorageKey, StorageValue, EMPTY_ROOT_HASH,
};
use crate::domain::errors::StateError;
use crate::ports::database::{
    AccountTrie, Database, MergedNodeSet, NodeIterator, NodeSet, StackTrieBuilder,
    StateSetOrigin, StorageTrie, TrieDatabase, TrieItem, TrieScheme,
};
use crate::ports::snapshot::{
    AccountSnapshot, SnapshotAccount, SnapshotTree, StorageIterator,
};
use lru::LruCache;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

const CODE_CACHE_CAPACITY: usize = 1024;

type AccountWorld = HashMap<Address, StateAccount>;
type StorageWorld = BTreeMap<Hash, Vec<u8>>;

fn account_world_root(world: &AccountWorld) -> Hash {
    if world.is_empty() {
        return EMPTY_ROOT_HASH;
    }
    let mut entries: Vec<(&Address, &StateAccount)> = world.iter().collect();
    entries.sort_by_key(|(address, _)| **address);
    let mut hasher = Keccak256::new();
    for (address, account) in entries {
        hasher.update(address.as_bytes());
        hasher.update(account.slim_rlp());
    }
    Hash::from_slice(&hasher.finalize())
}

fn storage_world_root(world: &StorageWorld) -> Hash {
    if world.is_empty() {
        return EMPTY_ROOT_HASH;
    }
    let mut hasher = Keccak256::new();
    for (slot_hash, blob) in world {
        hasher.update(slot_hash.as_bytes());
        hasher.update(blob);
    }
    Hash::from_slice(&hasher.finalize())
}

struct StoreInner {
    accounts: RwLock<HashMap<Hash, AccountWorld>>,
    storages: RwLock<HashMap<Hash, StorageWorld>>,
    codes: RwLock<LruCache<Hash, Arc<Vec<u8>>>>,
}

/// One recorded `TrieDatabase::update` call.
#[derive(Clone, Debug)]
pub struct RecordedCommit {
    pub root: Hash,
    pub parent: Hash,
    pub block: u64,
    pub account_origins: HashMap<Address, Option<Vec<u8>>>,
    pub storage_origins: HashMap<Address, HashMap<Hash, Option<Vec<u8>>>>,
    pub incomplete: HashSet<Address>,
    pub node_owners: Vec<Hash>,
    pub deleted_nodes: usize,
}

/// Node store handle that records updates instead of persisting them.
pub struct InMemoryTrieDatabase {
    scheme: TrieScheme,
    commits: RwLock<Vec<RecordedCommit>>,
}

impl InMemoryTrieDatabase {
    fn new(scheme: TrieScheme) -> Self {
        Self {
            scheme,
            commits: RwLock::new(Vec::new()),
        }
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.commits
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl TrieDatabase for InMemoryTrieDatabase {
    fn scheme(&self) -> TrieScheme {
        self.scheme
    }

    fn update(
        &self,
        root: Hash,
        parent: Hash,
        block: u64,
        nodes: MergedNodeSet,
        origin: StateSetOrigin,
    ) -> Result<(), StateError> {
        let deleted_nodes = nodes
            .sets
            .values()
            .flat_map(|set| set.nodes.values())
            .filter(|node| matches!(node, crate::ports::database::TrieNode::Deleted))
            .count();
        let record = RecordedCommit {
            root,
            parent,
            block,
            account_origins: origin.accounts,
            storage_origins: origin.storages,
            incomplete: origin.incomplete,
            node_owners: nodes.sets.keys().copied().collect(),
            deleted_nodes,
        };
        self.commits
            .write()
            .map_err(|_| StateError::LockPoisoned)?
            .push(record);
        Ok(())
    }
}

/// The memory-backed database adapter.
pub struct InMemoryStateDatabase {
    inner: Arc<StoreInner>,
    trie_db: Arc<InMemoryTrieDatabase>,
}

impl InMemoryStateDatabase {
    pub fn new() -> Arc<Self> {
        Self::with_scheme(TrieScheme::Path)
    }

    pub fn with_scheme(scheme: TrieScheme) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(StoreInner {
                accounts: RwLock::new(HashMap::new()),
                storages: RwLock::new(HashMap::new()),
                codes: RwLock::new(LruCache::new(
                    NonZeroUsize::new(CODE_CACHE_CAPACITY).expect("capacity is non-zero"),
                )),
            }),
            trie_db: Arc::new(InMemoryTrieDatabase::new(scheme)),
        })
    }

    /// Seed a genesis world and return the database with its root. Storage
    /// roots of the given accounts are derived from the given slots.
    pub fn with_genesis(
        accounts: Vec<(Address, StateAccount, Vec<(StorageKey, StorageValue)>)>,
    ) -> (Arc<Self>, Hash) {
        let db = Self::new();
        let mut world = AccountWorld::new();
        for (address, mut account, slots) in accounts {
            let mut storage = StorageWorld::new();
            for (key, value) in slots {
                if !value.is_zero() {
                    storage.insert(
                        hash_slot(&key),
                        crate::domain::entities::encode_slot_value(&value),
                    );
                }
            }
            let storage_root = storage_world_root(&storage);
            if storage_root != EMPTY_ROOT_HASH {
                if let Ok(mut worlds) = db.inner.storages.write() {
                    worlds.insert(storage_root, storage);
                }
            }
            account.storage_root = storage_root;
            world.insert(address, account);
        }
        let root = account_world_root(&world);
        if let Ok(mut worlds) = db.inner.accounts.write() {
            worlds.insert(root, world);
        }
        (db, root)
    }

    pub fn trie_backend(&self) -> Arc<InMemoryTrieDatabase> {
        Arc::clone(&self.trie_db)
    }

    /// Build a snapshot layer for the world at `root`.
    pub fn snapshot_tree(&self, root: Hash) -> Result<Arc<InMemorySnapshotTree>, StateError> {
        let tree = Arc::new(InMemorySnapshotTree::new());
        let world = if root == EMPTY_ROOT_HASH || root.is_zero() {
            AccountWorld::new()
        } else {
            self.inner
                .accounts
                .read()
                .map_err(|_| StateError::LockPoisoned)?
                .get(&root)
                .cloned()
                .ok_or_else(|| StateError::Database(format!("unknown state root {root:?}")))?
        };
        let mut layer = SnapLayer::default();
        let storage_worlds = self
            .inner
            .storages
            .read()
            .map_err(|_| StateError::LockPoisoned)?;
        for (address, account) in &world {
            let addr_hash = hash_address(address);
            layer.accounts.insert(addr_hash, account.slim_rlp());
            if account.storage_root != EMPTY_ROOT_HASH {
                if let Some(slots) = storage_worlds.get(&account.storage_root) {
                    layer
                        .storages
                        .insert(addr_hash, slots.iter().map(|(k, v)| (*k, v.clone())).collect());
                }
            }
        }
        tree.insert_layer(root, layer)?;
        Ok(tree)
    }
}

impl Database for InMemoryStateDatabase {
    fn open_trie(&self, root: Hash) -> Result<Box<dyn AccountTrie>, StateError> {
        let world = if root == EMPTY_ROOT_HASH || root.is_zero() {
            AccountWorld::new()
        } else {
            self.inner
                .accounts
                .read()
                .map_err(|_| StateError::LockPoisoned)?
                .get(&root)
                .cloned()
                .ok_or_else(|| StateError::Database(format!("unknown state root {root:?}")))?
        };
        Ok(Box::new(MemoryAccountTrie {
            store: Arc::clone(&self.inner),
            world,
            deleted: HashSet::new(),
        }))
    }

    fn open_storage_trie(
        &self,
        _state_root: Hash,
        address: &Address,
        root: Hash,
    ) -> Result<Box<dyn StorageTrie>, StateError> {
        let slots = if root == EMPTY_ROOT_HASH || root.is_zero() {
            StorageWorld::new()
        } else {
            self.inner
                .storages
                .read()
                .map_err(|_| StateError::LockPoisoned)?
                .get(&root)
                .cloned()
                .ok_or_else(|| {
                    StateError::Database(format!("unknown storage root {root:?}"))
                })?
        };
        Ok(Box::new(MemoryStorageTrie {
            store: Arc::clone(&self.inner),
            owner: hash_address(address),
            slots,
            deleted: HashSet::new(),
        }))
    }

    fn read_code(&self, _address: &Address, code_hash: Hash) -> Result<Arc<Vec<u8>>, StateError> {
        self.inner
            .codes
            .write()
            .map_err(|_| StateError::LockPoisoned)?
            .get(&code_hash)
            .cloned()
            .ok_or_else(|| StateError::Database(format!("missing code {code_hash:?}")))
    }

    fn write_code(&self, _address: &Address, code_hash: Hash, code: &[u8]) {
        if let Ok(mut codes) = self.inner.codes.write() {
            codes.put(code_hash, Arc::new(code.to_vec()));
        }
    }

    fn new_stack_builder(&self, owner: Hash) -> Box<dyn StackTrieBuilder> {
        Box::new(MemoryStackBuilder {
            owner,
            entries: Vec::new(),
        })
    }

    fn trie_db(&self) -> Arc<dyn TrieDatabase> {
        Arc::clone(&self.trie_db) as Arc<dyn TrieDatabase>
    }
}

struct MemoryAccountTrie {
    store: Arc<StoreInner>,
    world: AccountWorld,
    deleted: HashSet<Address>,
}

impl MemoryAccountTrie {
    fn persist(&self, root: Hash) {
        if root == EMPTY_ROOT_HASH {
            return;
        }
        if let Ok(mut worlds) = self.store.accounts.write() {
            worlds.insert(root, self.world.clone());
        }
    }
}

impl AccountTrie for MemoryAccountTrie {
    fn get_account(&self, address: &Address) -> Result<Option<StateAccount>, StateError> {
        Ok(self.world.get(address).cloned())
    }

    fn update_account(
        &mut self,
        address: &Address,
        account: &StateAccount,
    ) -> Result<(), StateError> {
        self.world.insert(*address, account.clone());
        self.deleted.remove(address);
        Ok(())
    }

    fn delete_account(&mut self, address: &Address) -> Result<(), StateError> {
        self.world.remove(address);
        self.deleted.insert(*address);
        Ok(())
    }

    fn update_contract_code(
        &mut self,
        _address: &Address,
        code_hash: Hash,
        code: &[u8],
    ) -> Result<(), StateError> {
        if keccak256(code) != code_hash {
            return Err(StateError::Encoding("code hash mismatch".into()));
        }
        Ok(())
    }

    fn hash(&mut self) -> Hash {
        let root = account_world_root(&self.world);
        self.persist(root);
        root
    }

    fn commit(&mut self, collect_leaf: bool) -> Result<(Hash, Option<NodeSet>), StateError> {
        let root = account_world_root(&self.world);
        self.persist(root);
        let mut set = NodeSet::new(Hash::zero());
        if collect_leaf {
            for (address, account) in &self.world {
                set.mark_updated(hash_address(address).as_bytes().to_vec(), account.slim_rlp());
            }
        }
        for address in &self.deleted {
            set.mark_deleted(hash_address(address).as_bytes().to_vec());
        }
        Ok((root, (!set.is_empty()).then_some(set)))
    }
}

struct MemoryStorageTrie {
    store: Arc<StoreInner>,
    owner: Hash,
    slots: StorageWorld,
    deleted: HashSet<Hash>,
}

impl MemoryStorageTrie {
    fn persist(&self, root: Hash) {
        if root == EMPTY_ROOT_HASH {
            return;
        }
        if let Ok(mut worlds) = self.store.storages.write() {
            worlds.insert(root, self.slots.clone());
        }
    }
}

impl StorageTrie for MemoryStorageTrie {
    fn get_storage(&self, key: &StorageKey) -> Result<Option<StorageValue>, StateError> {
        Ok(self
            .slots
            .get(&hash_slot(key))
            .map(|blob| decode_slot_value(blob)))
    }

    fn update_storage(&mut self, key: &StorageKey, value: &[u8]) -> Result<(), StateError> {
        let slot_hash = hash_slot(key);
        self.slots.insert(slot_hash, value.to_vec());
        self.deleted.remove(&slot_hash);
        Ok(())
    }

    fn delete_storage(&mut self, key: &StorageKey) -> Result<(), StateError> {
        let slot_hash = hash_slot(key);
        self.slots.remove(&slot_hash);
        self.deleted.insert(slot_hash);
        Ok(())
    }

    fn hash(&mut self) -> Hash {
        let root = storage_world_root(&self.slots);
        self.persist(root);
        root
    }

    fn commit(&mut self, collect_leaf: bool) -> Result<(Hash, Option<NodeSet>), StateError> {
        let root = storage_world_root(&self.slots);
        self.persist(root);
        let mut set = NodeSet::new(self.owner);
        if collect_leaf {
            for (slot_hash, blob) in &self.slots {
                set.mark_updated(slot_hash.as_bytes().to_vec(), blob.clone());
            }
        }
        for slot_hash in &self.deleted {
            set.mark_deleted(slot_hash.as_bytes().to_vec());
        }
        Ok((root, (!set.is_empty()).then_some(set)))
    }

    fn node_iterator(&self) -> Result<Box<dyn NodeIterator>, StateError> {
        let items: Vec<TrieItem> = self
            .slots
            .iter()
            .map(|(slot_hash, blob)| TrieItem::Leaf {
                key: slot_hash.as_bytes().to_vec(),
                blob: blob.clone(),
            })
            .collect();
        Ok(Box::new(MemoryNodeIterator { items, pos: 0 }))
    }
}

struct MemoryNodeIterator {
    items: Vec<TrieItem>,
    pos: usize,
}

impl NodeIterator for MemoryNodeIterator {
    fn next(&mut self) -> Result<Option<TrieItem>, StateError> {
        let item = self.items.get(self.pos).cloned();
        self.pos += 1;
        Ok(item)
    }
}

struct MemoryStackBuilder {
    owner: Hash,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl StackTrieBuilder for MemoryStackBuilder {
    fn update(&mut self, key: &[u8], blob: Vec<u8>) -> Result<(), StateError> {
        if let Some((last, _)) = self.entries.last() {
            if key <= last.as_slice() {
                return Err(StateError::Encoding(
                    "stack builder keys must be strictly ascending".into(),
                ));
            }
        }
        self.entries.push((key.to_vec(), blob));
        Ok(())
    }

    fn finalize(self: Box<Self>) -> (Hash, NodeSet) {
        let mut world = StorageWorld::new();
        let mut set = NodeSet::new(self.owner);
        for (key, blob) in self.entries {
            world.insert(Hash::from_slice(&key), blob);
            set.mark_deleted(key);
        }
        (storage_world_root(&world), set)
    }
}

#[derive(Clone, Default)]
struct SnapLayer {
    accounts: HashMap<Hash, Vec<u8>>,
    storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
}

/// Layered flat-state tree over the memory backend.
#[derive(Default)]
pub struct InMemorySnapshotTree {
    layers: RwLock<HashMap<Hash, SnapLayer>>,
}

impl InMemorySnapshotTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_layer(&self, root: Hash, layer: SnapLayer) -> Result<(), StateError> {
        self.layers
            .write()
            .map_err(|_| StateError::LockPoisoned)?
            .insert(root, layer);
        Ok(())
    }

    pub fn has_layer(&self, root: Hash) -> bool {
        self.layers
            .read()
            .map(|layers| layers.contains_key(&root))
            .unwrap_or(false)
    }
}

impl SnapshotTree for InMemorySnapshotTree {
    fn snapshot(&self, root: Hash) -> Option<Arc<dyn AccountSnapshot>> {
        let layer = self.layers.read().ok()?.get(&root).cloned()?;
        Some(Arc::new(InMemorySnapshot { root, layer }))
    }

    fn storage_iterator(
        &self,
        root: Hash,
        addr_hash: Hash,
        start: Hash,
    ) -> Result<Box<dyn StorageIterator>, StateError> {
        let layer = self
            .layers
            .read()
            .map_err(|_| StateError::LockPoisoned)?
            .get(&root)
            .cloned()
            .ok_or(StateError::SnapshotUnavailable { root })?;
        let mut items: Vec<(Hash, Vec<u8>)> = layer
            .storages
            .get(&addr_hash)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|(slot_hash, _)| **slot_hash >= start)
                    .map(|(slot_hash, blob)| (*slot_hash, blob.clone()))
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by_key(|(slot_hash, _)| *slot_hash);
        Ok(Box::new(MemorySnapIterator { items, pos: 0 }))
    }

    fn update(
        &self,
        root: Hash,
        parent: Hash,
        destructs: HashSet<Hash>,
        accounts: HashMap<Hash, Vec<u8>>,
        storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    ) -> Result<(), StateError> {
        let mut layers = self.layers.write().map_err(|_| StateError::LockPoisoned)?;
        let mut layer = layers.get(&parent).cloned().unwrap_or_default();
        for addr_hash in &destructs {
            layer.accounts.remove(addr_hash);
            layer.storages.remove(addr_hash);
        }
        for (addr_hash, blob) in accounts {
            if blob.is_empty() {
                layer.accounts.remove(&addr_hash);
            } else {
                layer.accounts.insert(addr_hash, blob);
            }
        }
        for (addr_hash, slots) in storages {
            let entry = layer.storages.entry(addr_hash).or_default();
            for (slot_hash, blob) in slots {
                if blob.is_empty() {
                    entry.remove(&slot_hash);
                } else {
                    entry.insert(slot_hash, blob);
                }
            }
            if entry.is_empty() {
                layer.storages.remove(&addr_hash);
            }
        }
        layers.insert(root, layer);
        Ok(())
    }

    fn cap(&self, _root: Hash, _layers: usize) -> Result<(), StateError> {
        // All layers are full in this backend; nothing to flatten.
        Ok(())
    }
}

struct InMemorySnapshot {
    root: Hash,
    layer: SnapLayer,
}

impl AccountSnapshot for InMemorySnapshot {
    fn root(&self) -> Hash {
        self.root
    }

    fn account(&self, addr_hash: Hash) -> Result<Option<SnapshotAccount>, StateError> {
        match self.layer.accounts.get(&addr_hash) {
            Some(blob) => {
                let account = StateAccount::from_slim_rlp(blob)?;
                Ok(Some(SnapshotAccount::from_account(&account)))
            }
            None => Ok(None),
        }
    }

    fn storage(&self, addr_hash: Hash, slot_hash: Hash) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self
            .layer
            .storages
            .get(&addr_hash)
            .and_then(|slots| slots.get(&slot_hash))
            .cloned())
    }
}

struct MemorySnapIterator {
    items: Vec<(Hash, Vec<u8>)>,
    pos: usize,
}

impl StorageIterator for MemorySnapIterator {
    fn next(&mut self) -> Result<Option<(Hash, Vec<u8>)>, StateError> {
        let item = self.items.get(self.pos).cloned();
        self.pos += 1;
        Ok(item)
    }
}
