//! # State Manager
//!
//! The per-block mutation front-end over one state root. All reads and
//! writes of block execution flow through here:
//!
//! - mutations are journaled and revertible to numbered snapshots,
//! - transaction boundaries fold dirty objects into the pending set,
//! - `intermediate_root` folds pending changes into the trie and returns
//!   the post-transaction root,
//! - `commit` persists the block's node mutations together with the
//!   reverse diff and notifies registered listeners. A manager commits at
//!   most once.
//!
//! When a multi-version map is attached, every account read and write is
//! additionally recorded against versioned keys so an external scheduler
//! can run the block's transactions optimistically in parallel.
//!
//! Backing-store failures are memoized on first occurrence and surface at
//! commit; read paths degrade to defaults instead of propagating storage
//! errors through execution.

use super::access_list::AccessList;
use super::entities::{
    encode_slot_value, hash_address, hash_slot, Address, Hash, StateAccount, StorageKey,
    StorageValue, EMPTY_ROOT_HASH,
};
use super::errors::StateError;
use super::journal::{Journal, JournalEntry};
use super::mvcc::{
    ExecutionAbort, MultiVersionMap, MvValue, ReadDescriptor, ReadKind, ReadResult, Version,
    WriteDescriptor,
};
use super::object::StateObject;
use super::transient::TransientStorage;
use super::versioned_key::{Subpath, VersionedKey};
use crate::events::StateUpdatePayload;
use crate::ports::database::{Database, MergedNodeSet, StateSetOrigin};
use crate::ports::listener::ListenerRegistry;
use crate::ports::snapshot::{AccountSnapshot, FallbackSnapshot, SnapshotTree};
use primitive_types::{H256, U256};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Below this many pending accounts the storage roots are computed on the
/// calling thread.
const PARALLEL_THRESHOLD: usize = 4;

/// Diff layers retained by the snapshot tree after a commit.
const SNAPSHOT_CAP_LAYERS: usize = 128;

pub struct StateDb {
    db: Arc<dyn Database>,
    trie: Box<dyn crate::ports::database::AccountTrie>,
    /// Root the manager was opened at; becomes the committed root after
    /// commit.
    original_root: Hash,
    snaps: Option<Arc<dyn SnapshotTree>>,
    snap: Option<Arc<dyn AccountSnapshot>>,
    /// True when `snap` is a real layer rather than the degraded stand-in.
    snap_live: bool,

    // Per-block caches of mutated state, keyed the way the snapshot layer
    // consumes them.
    accounts: HashMap<Hash, Vec<u8>>,
    storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    // Pre-block values of everything mutated this block; the raw material
    // of the reverse diff. `None` marks entries absent before the block.
    accounts_origin: HashMap<Address, Option<Vec<u8>>>,
    storages_origin: HashMap<Address, HashMap<Hash, Option<Vec<u8>>>>,

    state_objects: HashMap<Address, StateObject>,
    state_objects_pending: HashSet<Address>,
    state_objects_dirty: HashSet<Address>,
    /// Accounts destroyed this block, with their pre-block value. Only the
    /// first destruction of an address is recorded.
    state_objects_destruct: HashMap<Address, Option<StateAccount>>,

    db_err: Option<StateError>,
    refund: u64,
    tx_index: usize,
    /// Budget for a single account's storage wipe.
    storage_delete_limit: usize,

    journal: Journal,
    valid_revisions: Vec<(usize, usize)>,
    next_revision_id: usize,

    access_list: AccessList,
    transient: TransientStorage,

    mvcc: Option<Arc<MultiVersionMap>>,
    incarnation: usize,
    read_map: HashMap<VersionedKey, ReadDescriptor>,
    write_map: HashMap<VersionedKey, WriteDescriptor>,
    revert_keys: HashSet<VersionedKey>,
    dep: Option<usize>,

    listeners: ListenerRegistry,
    committed: bool,
}

enum MvLookup {
    /// No applicable multi-version value; read local state.
    Local,
    Value(MvValue),
}

impl StateDb {
    /// Open the state at `root`. The snapshot tree is optional; when it is
    /// configured but carries no layer for `root`, reads degrade to the
    /// trie through a stand-in snapshot.
    pub fn new(
        root: Hash,
        db: Arc<dyn Database>,
        snaps: Option<Arc<dyn SnapshotTree>>,
        listeners: ListenerRegistry,
    ) -> Result<Self, StateError> {
        let trie = db.open_trie(root)?;
        let mut snap_live = false;
        let snap = match &snaps {
            Some(tree) => match tree.snapshot(root) {
                Some(layer) => {
                    snap_live = true;
                    Some(layer)
                }
                None => Some(Arc::new(FallbackSnapshot::new(root)) as Arc<dyn AccountSnapshot>),
            },
            None => None,
        };
        Ok(Self {
            db,
            trie,
            original_root: root,
            snaps,
            snap,
            snap_live,
            accounts: HashMap::new(),
            storages: HashMap::new(),
            accounts_origin: HashMap::new(),
            storages_origin: HashMap::new(),
            state_objects: HashMap::new(),
            state_objects_pending: HashSet::new(),
            state_objects_dirty: HashSet::new(),
            state_objects_destruct: HashMap::new(),
            db_err: None,
            refund: 0,
            tx_index: 0,
            storage_delete_limit: super::deletion::STORAGE_DELETE_LIMIT,
            journal: Journal::new(),
            valid_revisions: Vec::new(),
            next_revision_id: 0,
            access_list: AccessList::new(),
            transient: TransientStorage::new(),
            mvcc: None,
            incarnation: 0,
            read_map: HashMap::new(),
            write_map: HashMap::new(),
            revert_keys: HashSet::new(),
            dep: None,
            listeners,
            committed: false,
        })
    }

    /// First backing-store error seen by this manager, if any.
    pub fn error(&self) -> Option<&StateError> {
        self.db_err.as_ref()
    }

    fn set_error(&mut self, err: StateError) {
        if self.db_err.is_none() {
            warn!(error = %err, "state database error memoized");
            self.db_err = Some(err);
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Root the manager was opened at (the committed root after commit).
    pub fn root_before(&self) -> Hash {
        self.original_root
    }

    pub(crate) fn snapshot_tree(&self) -> Option<&Arc<dyn SnapshotTree>> {
        self.snaps.as_ref()
    }

    pub(crate) fn storage_delete_limit(&self) -> usize {
        self.storage_delete_limit
    }

    /// Override the storage wipe budget. Wipes exceeding it are reported
    /// incomplete rather than failed.
    pub fn set_storage_delete_limit(&mut self, limit: usize) {
        self.storage_delete_limit = limit;
    }

    pub(crate) fn state_objects_destruct_entries(&self) -> Vec<(Address, Option<StateAccount>)> {
        self.state_objects_destruct
            .iter()
            .map(|(address, prev)| (*address, prev.clone()))
            .collect()
    }

    pub(crate) fn account_cached(&self, addr_hash: &Hash) -> bool {
        self.accounts.contains_key(addr_hash)
    }

    pub(crate) fn record_account_origin(&mut self, address: Address, origin: Option<Vec<u8>>) {
        self.accounts_origin.insert(address, origin);
    }

    pub(crate) fn drop_storage_origin(&mut self, address: &Address) {
        self.storages_origin.remove(address);
    }

    /// Merge wiped slots into the storage origin record. Slots already
    /// recorded by in-block writes keep their earlier origin.
    pub(crate) fn merge_wiped_storage_origin(
        &mut self,
        address: Address,
        slots: HashMap<Hash, Vec<u8>>,
    ) {
        let entry = self.storages_origin.entry(address).or_default();
        for (slot_hash, blob) in slots {
            entry.entry(slot_hash).or_insert(Some(blob));
        }
    }

    // ------------------------------------------------------------------
    // Multi-version plumbing
    // ------------------------------------------------------------------

    /// Attach the block's shared multi-version map and take the identity of
    /// one transaction attempt.
    pub fn set_mv_hashmap(&mut self, map: Arc<MultiVersionMap>) {
        self.mvcc = Some(map);
    }

    pub fn set_incarnation(&mut self, incarnation: usize) {
        self.incarnation = incarnation;
    }

    /// Index of the transaction this attempt depends on, when the last
    /// operation aborted.
    pub fn dep_tx_index(&self) -> Option<usize> {
        self.dep
    }

    pub fn mv_read_list(&self) -> Vec<ReadDescriptor> {
        self.read_map.values().cloned().collect()
    }

    /// Writes to publish on acceptance. Excludes keys whose writes were
    /// reverted before the attempt finished.
    pub fn mv_write_list(&self) -> Vec<WriteDescriptor> {
        self.write_map
            .values()
            .filter(|w| !self.revert_keys.contains(&w.path))
            .cloned()
            .collect()
    }

    /// Every key this attempt ever wrote, reverted or not. Used when
    /// demoting a failed attempt's entries.
    pub fn mv_full_write_list(&self) -> Vec<WriteDescriptor> {
        self.write_map.values().cloned().collect()
    }

    /// Publish this attempt's surviving writes to the shared map.
    pub fn flush_mv_write_set(&self) {
        if let Some(map) = &self.mvcc {
            map.flush_write_set(&self.mv_write_list());
        }
    }

    /// Replay an accepted transaction's write set onto this manager. Used
    /// by the sequential fallback that folds parallel results in order.
    pub fn apply_mv_write_set(
        &mut self,
        writes: &[WriteDescriptor],
    ) -> Result<(), ExecutionAbort> {
        for write in writes {
            match (&write.path, &write.value) {
                (VersionedKey::Slot(addr, slot), MvValue::Storage(value)) => {
                    self.set_state(*addr, *slot, *value)?;
                }
                (VersionedKey::Field(addr, Subpath::Balance), MvValue::Balance(value)) => {
                    self.set_balance(*addr, *value)?;
                }
                (VersionedKey::Field(addr, Subpath::Nonce), MvValue::Nonce(value)) => {
                    self.set_nonce(*addr, *value)?;
                }
                (VersionedKey::Field(addr, Subpath::Code), MvValue::Code(Some(code))) => {
                    self.set_code(*addr, code.as_ref().clone())?;
                }
                (VersionedKey::Field(addr, Subpath::SelfDestructed), MvValue::SelfDestructed(true)) => {
                    self.self_destruct(*addr)?;
                }
                // Account-level existence keys carry no replayable value.
                _ => {}
            }
        }
        Ok(())
    }

    /// Log this attempt's read and write sets, one line per access.
    pub fn dump_access_sets(&self) {
        for read in self.read_map.values() {
            debug!(
                tx_index = self.tx_index,
                incarnation = self.incarnation,
                path = %read.path.to_hex_path(),
                kind = ?read.kind,
                "mv read"
            );
        }
        for write in self.write_map.values() {
            debug!(
                tx_index = self.tx_index,
                incarnation = self.incarnation,
                path = %write.path.to_hex_path(),
                "mv write"
            );
        }
    }

    fn mv_lookup(&mut self, key: VersionedKey) -> Result<MvLookup, ExecutionAbort> {
        let Some(map) = self.mvcc.clone() else {
            return Ok(MvLookup::Local);
        };
        // Reads of our own writes come from local state.
        if self.write_map.contains_key(&key) {
            return Ok(MvLookup::Local);
        }
        match map.read(&key, self.tx_index) {
            ReadResult::Done { version, value } => {
                self.read_map.insert(
                    key,
                    ReadDescriptor {
                        path: key,
                        kind: ReadKind::FromMap,
                        version: Some(version),
                    },
                );
                Ok(MvLookup::Value(value))
            }
            ReadResult::Dependency { tx_index } => {
                self.dep = Some(tx_index);
                Err(ExecutionAbort {
                    dep_tx_index: tx_index,
                })
            }
            ReadResult::None => {
                self.read_map.insert(
                    key,
                    ReadDescriptor {
                        path: key,
                        kind: ReadKind::FromStorage,
                        version: None,
                    },
                );
                Ok(MvLookup::Local)
            }
        }
    }

    fn mv_write(&mut self, key: VersionedKey, value: MvValue) {
        if let Some(map) = &self.mvcc {
            let version = Version::new(self.tx_index, self.incarnation);
            map.write(key, version, value.clone());
            self.write_map.insert(
                key,
                WriteDescriptor {
                    path: key,
                    version,
                    value,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Object loading
    // ------------------------------------------------------------------

    /// Ensure the account at `address` is loaded, deleted or not. Returns
    /// true when an object is present in the live map afterwards.
    fn load_object(&mut self, address: &Address) -> bool {
        if self.state_objects.contains_key(address) {
            return true;
        }
        let addr_hash = hash_address(address);
        let mut data: Option<StateAccount> = None;
        let mut snap_failed = false;
        if let Some(snap) = &self.snap {
            match snap.account(addr_hash) {
                Ok(Some(slim)) => data = Some(slim.to_account()),
                Ok(None) => return false,
                Err(_) => snap_failed = true,
            }
        }
        if data.is_none() && (self.snap.is_none() || snap_failed) {
            match self.trie.get_account(address) {
                Ok(Some(account)) => data = Some(account),
                Ok(None) => return false,
                Err(err) => {
                    self.set_error(err);
                    return false;
                }
            }
        }
        match data {
            Some(account) => {
                let object = StateObject::new(*address, account.clone(), Some(account));
                self.state_objects.insert(*address, object);
                true
            }
            None => false,
        }
    }

    fn live_object(&mut self, address: &Address) -> Option<&StateObject> {
        if !self.load_object(address) {
            return None;
        }
        self.state_objects.get(address).filter(|o| !o.deleted)
    }

    fn live_object_mut(&mut self, address: &Address) -> Option<&mut StateObject> {
        if !self.load_object(address) {
            return None;
        }
        self.state_objects.get_mut(address).filter(|o| !o.deleted)
    }

    fn get_or_new_object(&mut self, address: Address) -> &mut StateObject {
        let exists = self.live_object(&address).is_some();
        if !exists {
            self.create_object(address);
        }
        self.state_objects
            .get_mut(&address)
            .filter(|o| !o.deleted)
            .unwrap_or_else(|| unreachable!("object created above"))
    }

    /// Replace whatever lives at `address` with a freshly created object.
    /// The replaced object, its cache entries, and its destruct marker are
    /// journaled so the creation can be reverted.
    fn create_object(&mut self, address: Address) {
        self.load_object(&address);
        let prev = self.state_objects.remove(&address);
        let entry = match prev {
            None => JournalEntry::ObjectCreated { address },
            Some(prev) => {
                let addr_hash = prev.addr_hash;
                let prev_destruct = match self.state_objects_destruct.get(&address) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        self.state_objects_destruct
                            .insert(address, prev.origin.clone());
                        None
                    }
                };
                JournalEntry::ObjectReset {
                    address,
                    prev_destruct,
                    prev_account: self.accounts.remove(&addr_hash),
                    prev_storage: self.storages.remove(&addr_hash),
                    prev_account_origin: self.accounts_origin.remove(&address),
                    prev_storage_origin: self.storages_origin.remove(&address),
                    prev: Some(Box::new(prev)),
                }
            }
        };
        self.journal.append(entry);
        self.state_objects
            .insert(address, StateObject::new_created(address));
        self.mv_write(VersionedKey::address_key(address), MvValue::Exists(true));
    }

    // ------------------------------------------------------------------
    // Versioned getters
    // ------------------------------------------------------------------

    pub fn exist(&mut self, address: Address) -> Result<bool, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::address_key(address))? {
            MvLookup::Value(MvValue::Exists(exists)) => Ok(exists),
            MvLookup::Value(_) => Ok(true),
            MvLookup::Local => Ok(self.live_object(&address).is_some()),
        }
    }

    pub fn empty(&mut self, address: Address) -> Result<bool, ExecutionAbort> {
        if !self.exist(address)? {
            return Ok(true);
        }
        let balance = self.get_balance(address)?;
        let nonce = self.get_nonce(address)?;
        let code_hash = self.get_code_hash(address)?;
        Ok(balance.is_zero()
            && nonce == 0
            && (code_hash == super::entities::EMPTY_CODE_HASH || code_hash.is_zero()))
    }

    pub fn get_balance(&mut self, address: Address) -> Result<U256, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::subpath_key(address, Subpath::Balance))? {
            MvLookup::Value(MvValue::Balance(balance)) => Ok(balance),
            MvLookup::Value(_) => Ok(U256::zero()),
            MvLookup::Local => Ok(self
                .live_object(&address)
                .map(|o| o.balance())
                .unwrap_or_default()),
        }
    }

    pub fn get_nonce(&mut self, address: Address) -> Result<u64, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::subpath_key(address, Subpath::Nonce))? {
            MvLookup::Value(MvValue::Nonce(nonce)) => Ok(nonce),
            MvLookup::Value(_) => Ok(0),
            MvLookup::Local => Ok(self
                .live_object(&address)
                .map(|o| o.nonce())
                .unwrap_or_default()),
        }
    }

    pub fn get_code_hash(&mut self, address: Address) -> Result<Hash, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::subpath_key(address, Subpath::Code))? {
            MvLookup::Value(MvValue::Code(Some(code))) => {
                Ok(super::entities::keccak256(code.as_ref()))
            }
            MvLookup::Value(MvValue::Code(None)) => Ok(H256::zero()),
            MvLookup::Value(_) => Ok(H256::zero()),
            MvLookup::Local => Ok(self
                .live_object(&address)
                .map(|o| o.code_hash())
                .unwrap_or_else(H256::zero)),
        }
    }

    /// Storage root of the account as currently buffered. Not versioned:
    /// storage roots are recomputed at block boundaries, never read inside
    /// parallel execution.
    pub fn storage_root(&mut self, address: Address) -> Hash {
        self.live_object(&address)
            .map(|o| o.data.storage_root)
            .unwrap_or(EMPTY_ROOT_HASH)
    }

    pub fn get_code(&mut self, address: Address) -> Result<Option<Arc<Vec<u8>>>, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::subpath_key(address, Subpath::Code))? {
            MvLookup::Value(MvValue::Code(code)) => Ok(code),
            MvLookup::Value(_) => Ok(None),
            MvLookup::Local => Ok(self.load_code(address)),
        }
    }

    pub fn get_code_size(&mut self, address: Address) -> Result<usize, ExecutionAbort> {
        Ok(self.get_code(address)?.map(|c| c.len()).unwrap_or(0))
    }

    fn load_code(&mut self, address: Address) -> Option<Arc<Vec<u8>>> {
        let (code_hash, cached) = match self.live_object(&address) {
            Some(obj) => (obj.code_hash(), obj.code.clone()),
            None => return None,
        };
        if let Some(code) = cached {
            return Some(code);
        }
        if code_hash == super::entities::EMPTY_CODE_HASH {
            return None;
        }
        match self.db.read_code(&address, code_hash) {
            Ok(code) => {
                if let Some(obj) = self.state_objects.get_mut(&address) {
                    obj.code = Some(Arc::clone(&code));
                }
                Some(code)
            }
            Err(err) => {
                self.set_error(err);
                None
            }
        }
    }

    pub fn has_self_destructed(&mut self, address: Address) -> Result<bool, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::subpath_key(address, Subpath::SelfDestructed))? {
            MvLookup::Value(MvValue::SelfDestructed(flag)) => Ok(flag),
            MvLookup::Value(_) => Ok(false),
            MvLookup::Local => Ok(self
                .live_object(&address)
                .map(|o| o.self_destructed)
                .unwrap_or(false)),
        }
    }

    /// Value of a slot as the running transaction sees it.
    pub fn get_state(
        &mut self,
        address: Address,
        key: StorageKey,
    ) -> Result<StorageValue, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::state_key(address, key))? {
            MvLookup::Value(MvValue::Storage(value)) => Ok(value),
            MvLookup::Value(_) => Ok(H256::zero()),
            MvLookup::Local => Ok(self.local_state(address, key)),
        }
    }

    /// Value of a slot ignoring the running transaction's writes.
    pub fn get_committed_state(
        &mut self,
        address: Address,
        key: StorageKey,
    ) -> Result<StorageValue, ExecutionAbort> {
        match self.mv_lookup(VersionedKey::state_key(address, key))? {
            MvLookup::Value(MvValue::Storage(value)) => Ok(value),
            MvLookup::Value(_) => Ok(H256::zero()),
            MvLookup::Local => Ok(self.local_committed_state(address, key)),
        }
    }

    fn local_state(&mut self, address: Address, key: StorageKey) -> StorageValue {
        let dirty = self
            .live_object(&address)
            .and_then(|o| o.dirty_storage.get(&key).copied());
        match dirty {
            Some(value) => value,
            None => self.local_committed_state(address, key),
        }
    }

    fn local_committed_state(&mut self, address: Address, key: StorageKey) -> StorageValue {
        let (cached, created, origin_root) = match self.live_object(&address) {
            Some(obj) => (
                obj.committed_cached_storage(&key),
                obj.created,
                obj.origin
                    .as_ref()
                    .map(|o| o.storage_root)
                    .unwrap_or(EMPTY_ROOT_HASH),
            ),
            None => return H256::zero(),
        };
        if let Some(value) = cached {
            return value;
        }
        // Storage of an account created in this block cannot predate it.
        if created || origin_root == EMPTY_ROOT_HASH {
            if let Some(obj) = self.state_objects.get_mut(&address) {
                obj.original_storage.insert(key, H256::zero());
            }
            return H256::zero();
        }
        let value = self.load_committed_slot(address, key, origin_root);
        if let Some(obj) = self.state_objects.get_mut(&address) {
            obj.original_storage.insert(key, value);
        }
        value
    }

    fn load_committed_slot(
        &mut self,
        address: Address,
        key: StorageKey,
        origin_root: Hash,
    ) -> StorageValue {
        let addr_hash = hash_address(&address);
        if let Some(snap) = &self.snap {
            match snap.storage(addr_hash, hash_slot(&key)) {
                Ok(Some(blob)) => return super::entities::decode_slot_value(&blob),
                Ok(None) => return H256::zero(),
                Err(_) => {} // degrade to the trie
            }
        }
        match self
            .db
            .open_storage_trie(self.original_root, &address, origin_root)
            .and_then(|trie| trie.get_storage(&key))
        {
            Ok(Some(value)) => value,
            Ok(None) => H256::zero(),
            Err(err) => {
                self.set_error(err);
                H256::zero()
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    pub fn add_balance(&mut self, address: Address, amount: U256) -> Result<(), ExecutionAbort> {
        // Record the read dependency before computing the new balance.
        let balance = self.get_balance(address)?;
        let obj = self.get_or_new_object(address);
        let prev = obj.balance();
        obj.set_balance(balance.saturating_add(amount));
        self.journal
            .append(JournalEntry::BalanceChange { address, prev });
        self.mv_write(
            VersionedKey::subpath_key(address, Subpath::Balance),
            MvValue::Balance(balance.saturating_add(amount)),
        );
        Ok(())
    }

    pub fn sub_balance(&mut self, address: Address, amount: U256) -> Result<(), ExecutionAbort> {
        let balance = self.get_balance(address)?;
        let obj = self.get_or_new_object(address);
        let prev = obj.balance();
        obj.set_balance(balance.saturating_sub(amount));
        self.journal
            .append(JournalEntry::BalanceChange { address, prev });
        self.mv_write(
            VersionedKey::subpath_key(address, Subpath::Balance),
            MvValue::Balance(balance.saturating_sub(amount)),
        );
        Ok(())
    }

    pub fn set_balance(&mut self, address: Address, balance: U256) -> Result<(), ExecutionAbort> {
        let obj = self.get_or_new_object(address);
        let prev = obj.balance();
        obj.set_balance(balance);
        self.journal
            .append(JournalEntry::BalanceChange { address, prev });
        self.mv_write(
            VersionedKey::subpath_key(address, Subpath::Balance),
            MvValue::Balance(balance),
        );
        Ok(())
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) -> Result<(), ExecutionAbort> {
        let obj = self.get_or_new_object(address);
        let prev = obj.nonce();
        obj.set_nonce(nonce);
        self.journal
            .append(JournalEntry::NonceChange { address, prev });
        self.mv_write(
            VersionedKey::subpath_key(address, Subpath::Nonce),
            MvValue::Nonce(nonce),
        );
        Ok(())
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> Result<(), ExecutionAbort> {
        let obj = self.get_or_new_object(address);
        let prev_code = obj.code.clone();
        let prev_hash = obj.code_hash();
        obj.set_code(code);
        let new_code = obj.code.clone();
        self.journal.append(JournalEntry::CodeChange {
            address,
            prev_code,
            prev_hash,
        });
        self.mv_write(
            VersionedKey::subpath_key(address, Subpath::Code),
            MvValue::Code(new_code),
        );
        Ok(())
    }

    pub fn set_state(
        &mut self,
        address: Address,
        key: StorageKey,
        value: StorageValue,
    ) -> Result<(), ExecutionAbort> {
        let current = self.get_state(address, key)?;
        if current == value {
            return Ok(());
        }
        let obj = self.get_or_new_object(address);
        let prev = obj.set_storage(key, value);
        self.journal
            .append(JournalEntry::StorageChange { address, key, prev });
        self.mv_write(
            VersionedKey::state_key(address, key),
            MvValue::Storage(value),
        );
        Ok(())
    }

    /// Mark the account for destruction at the end of the transaction. Its
    /// balance is cleared immediately.
    pub fn self_destruct(&mut self, address: Address) -> Result<(), ExecutionAbort> {
        // Record the existence read before mutating.
        if !self.exist(address)? {
            return Ok(());
        }
        let Some(obj) = self.live_object_mut(&address) else {
            return Ok(());
        };
        let prev = obj.self_destructed;
        let prev_balance = obj.balance();
        obj.self_destructed = true;
        obj.set_balance(U256::zero());
        self.journal.append(JournalEntry::SelfDestruct {
            address,
            prev,
            prev_balance,
        });
        self.mv_write(
            VersionedKey::subpath_key(address, Subpath::SelfDestructed),
            MvValue::SelfDestructed(true),
        );
        self.mv_write(
            VersionedKey::subpath_key(address, Subpath::Balance),
            MvValue::Balance(U256::zero()),
        );
        Ok(())
    }

    /// Destruction restricted to accounts created in the same transaction.
    pub fn self_destruct_6780(&mut self, address: Address) -> Result<(), ExecutionAbort> {
        let created = self
            .live_object(&address)
            .map(|o| o.created)
            .unwrap_or(false);
        if created {
            self.self_destruct(address)?;
        }
        Ok(())
    }

    /// Explicitly create an account, replacing any previous object at the
    /// address. The previous balance carries over.
    pub fn create_account(&mut self, address: Address) -> Result<(), ExecutionAbort> {
        let prev_balance = self.get_balance(address)?;
        self.create_object(address);
        if let Some(obj) = self.state_objects.get_mut(&address) {
            obj.set_balance(prev_balance);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Refund counter
    // ------------------------------------------------------------------

    pub fn add_refund(&mut self, amount: u64) {
        self.journal
            .append(JournalEntry::RefundChange { prev: self.refund });
        self.refund += amount;
    }

    /// ## Panics
    ///
    /// Panics when the refund counter would go below zero; that indicates
    /// a broken caller, not a recoverable state.
    pub fn sub_refund(&mut self, amount: u64) {
        self.journal
            .append(JournalEntry::RefundChange { prev: self.refund });
        if amount > self.refund {
            panic!("refund counter below zero ({} > {})", amount, self.refund);
        }
        self.refund -= amount;
    }

    pub fn get_refund(&self) -> u64 {
        self.refund
    }

    // ------------------------------------------------------------------
    // Access list and transient storage
    // ------------------------------------------------------------------

    pub fn address_in_access_list(&self, address: Address) -> bool {
        self.access_list.contains_address(&address)
    }

    pub fn slot_in_access_list(&self, address: Address, slot: StorageKey) -> (bool, bool) {
        self.access_list.contains(&address, &slot)
    }

    pub fn add_address_to_access_list(&mut self, address: Address) {
        if self.access_list.add_address(address) {
            self.journal
                .append(JournalEntry::AccessListAddAccount { address });
        }
    }

    pub fn add_slot_to_access_list(&mut self, address: Address, slot: StorageKey) {
        let (address_added, slot_added) = self.access_list.add_slot(address, slot);
        if address_added {
            self.journal
                .append(JournalEntry::AccessListAddAccount { address });
        }
        if slot_added {
            self.journal
                .append(JournalEntry::AccessListAddSlot { address, slot });
        }
    }

    pub fn get_transient_state(&self, address: Address, key: StorageKey) -> StorageValue {
        self.transient.get(&address, &key)
    }

    pub fn set_transient_state(&mut self, address: Address, key: StorageKey, value: StorageValue) {
        let prev = self.transient.get(&address, &key);
        if prev == value {
            return;
        }
        self.journal
            .append(JournalEntry::TransientStorageChange { address, key, prev });
        self.transient.set(address, key, value);
    }

    /// Begin a new transaction context. Warm access tracking, transient
    /// storage, and the attempt's read/write sets start fresh.
    pub fn set_tx_context(&mut self, tx_index: usize) {
        self.tx_index = tx_index;
        self.access_list = AccessList::new();
        self.transient = TransientStorage::new();
        self.read_map.clear();
        self.write_map.clear();
        self.revert_keys.clear();
        self.dep = None;
    }

    pub fn tx_index(&self) -> usize {
        self.tx_index
    }

    // ------------------------------------------------------------------
    // Snapshots and reverts
    // ------------------------------------------------------------------

    pub fn snapshot(&mut self) -> usize {
        let id = self.next_revision_id;
        self.next_revision_id += 1;
        self.valid_revisions.push((id, self.journal.len()));
        id
    }

    /// ## Panics
    ///
    /// Panics when `id` does not name a live revision; revision ids are
    /// only valid until they are reverted past or the transaction ends.
    pub fn revert_to_snapshot(&mut self, id: usize) {
        let idx = self.valid_revisions.partition_point(|&(rid, _)| rid < id);
        if idx == self.valid_revisions.len() || self.valid_revisions[idx].0 != id {
            panic!("revision id {id} cannot be reverted");
        }
        let target_len = self.valid_revisions[idx].1;
        self.revert_journal(target_len);
        self.valid_revisions.truncate(idx);
    }

    fn revert_journal(&mut self, target_len: usize) {
        while self.journal.len() > target_len {
            let entry = self
                .journal
                .entries
                .pop()
                .unwrap_or_else(|| unreachable!("length checked above"));
            if let Some(address) = entry.dirtied() {
                self.journal.undirty(address);
            }
            self.undo(entry);
        }
    }

    fn record_revert(&mut self, key: VersionedKey) {
        if let Some(map) = &self.mvcc {
            if self.write_map.contains_key(&key) {
                self.revert_keys.insert(key);
                map.delete(&key, self.tx_index);
            }
        }
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::ObjectCreated { address } => {
                self.state_objects.remove(&address);
                self.record_revert(VersionedKey::address_key(address));
            }
            JournalEntry::ObjectReset {
                address,
                prev,
                prev_destruct,
                prev_account,
                prev_storage,
                prev_account_origin,
                prev_storage_origin,
            } => {
                let addr_hash = hash_address(&address);
                match prev {
                    Some(prev) => {
                        self.state_objects.insert(address, *prev);
                    }
                    None => {
                        self.state_objects.remove(&address);
                    }
                }
                match prev_destruct {
                    Some(marker) => {
                        self.state_objects_destruct.insert(address, marker);
                    }
                    None => {
                        self.state_objects_destruct.remove(&address);
                    }
                }
                match prev_account {
                    Some(blob) => {
                        self.accounts.insert(addr_hash, blob);
                    }
                    None => {
                        self.accounts.remove(&addr_hash);
                    }
                }
                match prev_storage {
                    Some(slots) => {
                        self.storages.insert(addr_hash, slots);
                    }
                    None => {
                        self.storages.remove(&addr_hash);
                    }
                }
                match prev_account_origin {
                    Some(origin) => {
                        self.accounts_origin.insert(address, origin);
                    }
                    None => {
                        self.accounts_origin.remove(&address);
                    }
                }
                match prev_storage_origin {
                    Some(origin) => {
                        self.storages_origin.insert(address, origin);
                    }
                    None => {
                        self.storages_origin.remove(&address);
                    }
                }
                self.record_revert(VersionedKey::address_key(address));
            }
            JournalEntry::SelfDestruct {
                address,
                prev,
                prev_balance,
            } => {
                if let Some(obj) = self.state_objects.get_mut(&address) {
                    obj.self_destructed = prev;
                    obj.set_balance(prev_balance);
                }
                self.record_revert(VersionedKey::subpath_key(address, Subpath::SelfDestructed));
                self.record_revert(VersionedKey::subpath_key(address, Subpath::Balance));
            }
            JournalEntry::BalanceChange { address, prev } => {
                if let Some(obj) = self.state_objects.get_mut(&address) {
                    obj.set_balance(prev);
                }
                self.record_revert(VersionedKey::subpath_key(address, Subpath::Balance));
            }
            JournalEntry::NonceChange { address, prev } => {
                if let Some(obj) = self.state_objects.get_mut(&address) {
                    obj.set_nonce(prev);
                }
                self.record_revert(VersionedKey::subpath_key(address, Subpath::Nonce));
            }
            JournalEntry::StorageChange { address, key, prev } => {
                if let Some(obj) = self.state_objects.get_mut(&address) {
                    match prev {
                        Some(value) => {
                            obj.dirty_storage.insert(key, value);
                        }
                        None => {
                            obj.dirty_storage.remove(&key);
                        }
                    }
                }
                self.record_revert(VersionedKey::state_key(address, key));
            }
            JournalEntry::CodeChange {
                address,
                prev_code,
                prev_hash,
            } => {
                if let Some(obj) = self.state_objects.get_mut(&address) {
                    obj.code = prev_code;
                    obj.data.code_hash = prev_hash;
                }
                self.record_revert(VersionedKey::subpath_key(address, Subpath::Code));
            }
            JournalEntry::RefundChange { prev } => {
                self.refund = prev;
            }
            JournalEntry::AccessListAddAccount { address } => {
                self.access_list.remove_address(&address);
            }
            JournalEntry::AccessListAddSlot { address, slot } => {
                self.access_list.remove_slot(&address, &slot);
            }
            JournalEntry::TransientStorageChange { address, key, prev } => {
                self.transient.set(address, key, prev);
            }
        }
    }

    fn clear_journal_and_refund(&mut self) {
        if !self.journal.is_empty() {
            self.journal.clear();
            self.refund = 0;
        }
        self.valid_revisions.clear();
    }

    // ------------------------------------------------------------------
    // Transaction and block boundaries
    // ------------------------------------------------------------------

    /// Fold the current transaction's dirty objects into the pending set.
    /// Self-destructed and (optionally) empty accounts are marked deleted
    /// and their destruct markers recorded, first destruction winning.
    pub fn finalise(&mut self, delete_empty: bool) {
        let mut dirties: Vec<Address> = self.journal.dirties.keys().copied().collect();
        dirties.sort();
        for address in dirties {
            let Some(obj) = self.state_objects.get_mut(&address) else {
                continue;
            };
            if obj.self_destructed || (delete_empty && obj.is_empty()) {
                obj.deleted = true;
                let addr_hash = obj.addr_hash;
                let origin = obj.origin.clone();
                self.state_objects_destruct
                    .entry(address)
                    .or_insert(origin);
                self.accounts.remove(&addr_hash);
                self.storages.remove(&addr_hash);
                self.accounts_origin.remove(&address);
                self.storages_origin.remove(&address);
            } else {
                obj.finalise();
            }
            self.state_objects_pending.insert(address);
            self.state_objects_dirty.insert(address);
        }
        self.clear_journal_and_refund();
    }

    /// Fold pending changes into the trie and return the root they hash
    /// to. Repeatable; the pending set is drained but objects stay dirty
    /// until commit.
    pub fn intermediate_root(&mut self, delete_empty: bool) -> Hash {
        self.finalise(delete_empty);

        let mut pending: Vec<Address> = self.state_objects_pending.drain().collect();
        pending.sort();

        // Storage roots of surviving accounts, in parallel when enough
        // accounts changed.
        let mut tasks = Vec::new();
        for address in &pending {
            let Some(obj) = self.state_objects.get(address) else {
                continue;
            };
            if obj.deleted || obj.pending_storage.is_empty() {
                continue;
            }
            let origin_root = obj
                .origin
                .as_ref()
                .map(|o| o.storage_root)
                .unwrap_or(EMPTY_ROOT_HASH);
            let changes: Vec<(StorageKey, StorageValue, StorageValue)> = obj
                .pending_storage
                .iter()
                .map(|(k, v)| {
                    (
                        *k,
                        *v,
                        obj.original_storage.get(k).copied().unwrap_or_default(),
                    )
                })
                .collect();
            tasks.push((*address, origin_root, changes));
        }

        let db = Arc::clone(&self.db);
        let state_root = self.original_root;
        let compute = |task: &(Address, Hash, Vec<(StorageKey, StorageValue, StorageValue)>)| {
            let (address, origin_root, changes) = task;
            let mut trie = db.open_storage_trie(state_root, address, *origin_root)?;
            for (key, value, origin) in changes {
                if value == origin {
                    continue;
                }
                if value.is_zero() {
                    trie.delete_storage(key)?;
                } else {
                    trie.update_storage(key, &encode_slot_value(value))?;
                }
            }
            Ok::<(Address, Hash), StateError>((*address, trie.hash()))
        };
        let results: Vec<Result<(Address, Hash), StateError>> =
            if tasks.len() >= PARALLEL_THRESHOLD {
                tasks.par_iter().map(compute).collect()
            } else {
                tasks.iter().map(compute).collect()
            };
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok((address, root)) => {
                    if let Some(obj) = self.state_objects.get_mut(&address) {
                        obj.data.storage_root = root;
                    }
                }
                Err(err) => errors.push(err),
            }
        }

        // Account trie updates and per-block cache maintenance.
        for address in &pending {
            let Some(obj) = self.state_objects.get(address) else {
                continue;
            };
            if obj.deleted {
                if let Err(err) = self.trie.delete_account(address) {
                    errors.push(err);
                }
                continue;
            }
            let addr_hash = obj.addr_hash;
            let storage_entry = self.storages.entry(addr_hash).or_default();
            let origin_entry = self.storages_origin.entry(*address).or_default();
            for (key, value) in &obj.pending_storage {
                let origin = obj.original_storage.get(key).copied().unwrap_or_default();
                if *value == origin {
                    continue;
                }
                let slot_hash = hash_slot(key);
                storage_entry.insert(slot_hash, encode_slot_value(value));
                origin_entry.entry(slot_hash).or_insert_with(|| {
                    (!origin.is_zero()).then(|| encode_slot_value(&origin))
                });
            }
            if storage_entry.is_empty() {
                self.storages.remove(&addr_hash);
            }
            if origin_entry.is_empty() {
                self.storages_origin.remove(address);
            }
            self.accounts.insert(addr_hash, obj.data.slim_rlp());
            self.accounts_origin
                .entry(*address)
                .or_insert_with(|| obj.origin.as_ref().map(|o| o.slim_rlp()));
            if let Err(err) = self.trie.update_account(address, &obj.data) {
                errors.push(err);
            }
        }
        for err in errors {
            self.set_error(err);
        }
        self.trie.hash()
    }

    /// Persist the block. Terminal: a committed manager refuses further
    /// commits; open a new one at the returned root.
    pub fn commit(&mut self, block: u64, delete_empty: bool) -> Result<Hash, StateError> {
        if self.committed {
            return Err(StateError::CommitTerminated);
        }
        if let Some(err) = &self.db_err {
            return Err(StateError::CommitAborted(err.to_string()));
        }

        let root = self.intermediate_root(delete_empty);

        let mut nodes = MergedNodeSet::new();
        let incomplete = self.handle_destruction(&mut nodes)?;

        if let Some(err) = &self.db_err {
            return Err(StateError::CommitAborted(err.to_string()));
        }

        // Code writes and storage trie commits for surviving objects.
        let mut code_updates: HashMap<Hash, Vec<u8>> = HashMap::new();
        let mut dirty: Vec<Address> = self.state_objects_dirty.drain().collect();
        dirty.sort();
        let mut errors = Vec::new();
        for address in dirty {
            let Some(obj) = self.state_objects.get_mut(&address) else {
                continue;
            };
            if obj.deleted {
                continue;
            }
            if obj.dirty_code {
                if let Some(code) = obj.code.clone() {
                    let code_hash = obj.data.code_hash;
                    self.db.write_code(&address, code_hash, &code);
                    if let Err(err) = self.trie.update_contract_code(&address, code_hash, &code) {
                        errors.push(err);
                    }
                    code_updates.insert(code_hash, code.as_ref().clone());
                }
                obj.dirty_code = false;
            }
            if obj.pending_storage.is_empty() {
                continue;
            }
            let origin_root = obj
                .origin
                .as_ref()
                .map(|o| o.storage_root)
                .unwrap_or(EMPTY_ROOT_HASH);
            let result = self
                .db
                .open_storage_trie(self.original_root, &address, origin_root)
                .and_then(|mut trie| {
                    for (key, value) in &obj.pending_storage {
                        let origin = obj.original_storage.get(key).copied().unwrap_or_default();
                        if *value == origin {
                            continue;
                        }
                        if value.is_zero() {
                            trie.delete_storage(key)?;
                        } else {
                            trie.update_storage(key, &encode_slot_value(value))?;
                        }
                    }
                    trie.commit(true)
                });
            match result {
                Ok((storage_root, set)) => {
                    if storage_root != obj.data.storage_root {
                        errors.push(StateError::RootMismatch {
                            expected: obj.data.storage_root,
                            actual: storage_root,
                        });
                    }
                    if let Some(set) = set {
                        if !set.is_empty() {
                            if let Err(err) = nodes.merge(set) {
                                errors.push(err);
                            }
                        }
                    }
                    for (key, value) in obj.pending_storage.drain() {
                        obj.original_storage.insert(key, value);
                    }
                }
                Err(err) => errors.push(err),
            }
        }
        for err in errors {
            self.set_error(err);
        }

        let (account_root, account_set) = self.trie.commit(true)?;
        if let Some(set) = account_set {
            if !set.is_empty() {
                nodes.merge(set)?;
            }
        }
        debug_assert_eq!(account_root, root);

        if let Some(err) = &self.db_err {
            return Err(StateError::CommitAborted(err.to_string()));
        }

        let root = if root.is_zero() { EMPTY_ROOT_HASH } else { root };
        let origin = if self.original_root.is_zero() {
            EMPTY_ROOT_HASH
        } else {
            self.original_root
        };
        // A block that leaves the root unchanged has nothing to announce,
        // layer, or persist.
        if root != origin {
            let destructs: HashSet<Hash> = self
                .state_objects_destruct
                .keys()
                .map(hash_address)
                .collect();
            let payload = StateUpdatePayload {
                root,
                parent: origin,
                block,
                destructs: destructs.clone(),
                accounts: self.accounts.clone(),
                storages: self.storages.clone(),
                code_updates,
            };
            self.listeners.notify(&payload);

            if self.snap_live {
                if let Some(snaps) = &self.snaps {
                    if let Err(err) = snaps.update(
                        root,
                        origin,
                        destructs,
                        self.accounts.clone(),
                        self.storages.clone(),
                    ) {
                        warn!(
                            root = ?root,
                            error = %err,
                            "failed to layer snapshot diff"
                        );
                    } else if let Err(err) = snaps.cap(root, SNAPSHOT_CAP_LAYERS) {
                        warn!(root = ?root, error = %err, "failed to cap snapshot tree");
                    }
                }
            }

            let origin_set = StateSetOrigin {
                accounts: std::mem::take(&mut self.accounts_origin),
                storages: std::mem::take(&mut self.storages_origin),
                incomplete,
            };
            self.db.trie_db().update(root, origin, block, nodes, origin_set)?;
            self.original_root = root;
        }
        self.snap = None;
        self.snap_live = false;

        self.accounts.clear();
        self.storages.clear();
        self.accounts_origin.clear();
        self.storages_origin.clear();
        self.state_objects_destruct.clear();
        self.committed = true;
        debug!(root = ?root, block, "state committed");
        Ok(root)
    }
}
