//! # Storage Deletion Engine
//!
//! When a contract account is destroyed, its entire storage trie must be
//! wiped from a path-addressed node store. Two strategies:
//!
//! - fast path: iterate the flat snapshot and rebuild the expected root
//!   through a write-once trie builder, cross-checking against the account
//!   record;
//! - slow path: walk the storage trie itself node by node.
//!
//! Both paths honor a size budget. Exceeding it is not an error: the
//! account is reported as incomplete so the reverse diff can withhold its
//! untrustworthy storage origin.

use super::entities::{hash_address, Address, Hash, EMPTY_ROOT_HASH};
use super::errors::StateError;
use super::statedb::StateDb;
use crate::ports::database::{MergedNodeSet, NodeSet, TrieItem, TrieScheme};
use primitive_types::H256;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Default upper bound on the cumulative size of storage wiped per account.
pub(crate) const STORAGE_DELETE_LIMIT: usize = 512 * 1024 * 1024;

/// Result of one account's storage wipe: whether the budget aborted it,
/// the node deletions to apply, and the wiped slots with their values.
type DeletionOutcome = (bool, NodeSet, HashMap<Hash, Vec<u8>>);

impl StateDb {
    /// Wipe via the flat snapshot. Iterated slots feed a write-once trie
    /// builder whose root must reproduce the account's storage root; any
    /// divergence means the snapshot is stale and the caller must fall
    /// back to the trie walk.
    fn fast_delete_storage(
        &self,
        addr_hash: Hash,
        expected_root: Hash,
    ) -> Result<DeletionOutcome, StateError> {
        let snaps = self
            .snapshot_tree()
            .ok_or(StateError::SnapshotUnavailable {
                root: self.root_before(),
            })?;
        let mut iter = snaps.storage_iterator(self.root_before(), addr_hash, H256::zero())?;

        let mut builder = self.database().new_stack_builder(addr_hash);
        let mut slots: HashMap<Hash, Vec<u8>> = HashMap::new();
        let mut size = 0usize;
        while let Some((slot_hash, blob)) = iter.next()? {
            size += 32 + blob.len();
            if size > self.storage_delete_limit() {
                return Ok((true, NodeSet::new(addr_hash), HashMap::new()));
            }
            builder.update(slot_hash.as_bytes(), blob.clone())?;
            slots.insert(slot_hash, blob);
        }
        let (root, set) = builder.finalize();
        if root != expected_root {
            return Err(StateError::RootMismatch {
                expected: expected_root,
                actual: root,
            });
        }
        Ok((false, set, slots))
    }

    /// Wipe by walking the storage trie as stored. Slower, but needs no
    /// snapshot coverage.
    fn slow_delete_storage(
        &self,
        address: &Address,
        addr_hash: Hash,
        root: Hash,
    ) -> Result<DeletionOutcome, StateError> {
        let trie = self
            .database()
            .open_storage_trie(self.root_before(), address, root)?;
        let mut iter = trie.node_iterator()?;

        let mut set = NodeSet::new(addr_hash);
        let mut slots: HashMap<Hash, Vec<u8>> = HashMap::new();
        let mut size = 0usize;
        while let Some(item) = iter.next()? {
            match item {
                TrieItem::Leaf { key, blob } => {
                    size += 32 + blob.len();
                    if size > self.storage_delete_limit() {
                        return Ok((true, NodeSet::new(addr_hash), HashMap::new()));
                    }
                    slots.insert(H256::from_slice(&key), blob);
                    set.mark_deleted(key);
                }
                TrieItem::Node { path, hash } => {
                    // Embedded nodes have no standalone presence to delete.
                    if hash.is_zero() {
                        continue;
                    }
                    set.mark_deleted(path);
                }
            }
        }
        Ok((false, set, slots))
    }

    /// Wipe one destroyed account's storage, preferring the fast path when
    /// a snapshot tree is configured.
    fn delete_storage(
        &self,
        address: &Address,
        addr_hash: Hash,
        root: Hash,
    ) -> Result<DeletionOutcome, StateError> {
        if self.snapshot_tree().is_some() {
            match self.fast_delete_storage(addr_hash, root) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    debug!(
                        address = ?address,
                        error = %err,
                        "fast storage deletion failed, walking the trie"
                    );
                }
            }
        }
        self.slow_delete_storage(address, addr_hash, root)
    }

    /// Resolve every destruction marker recorded this block.
    ///
    /// Four cases per marked address:
    /// 1. no pre-block account and not resurrected: nothing to record;
    /// 2. no pre-block account but resurrected: record a created-from-
    ///    nothing origin;
    /// 3. pre-block account existed: record its slim encoding as origin
    ///    and wipe its storage when the node store is path-addressed;
    /// 4. the wipe exceeded its budget: mark the address incomplete and
    ///    withhold its storage origin.
    ///
    /// Hash-addressed node stores skip destruction processing entirely, so
    /// no origins are recorded there; stale storage is reclaimed by
    /// external pruning.
    pub(crate) fn handle_destruction(
        &mut self,
        nodes: &mut MergedNodeSet,
    ) -> Result<HashSet<Address>, StateError> {
        let mut incomplete = HashSet::new();
        if self.database().trie_db().scheme() == TrieScheme::Hash {
            return Ok(incomplete);
        }

        let destructs = self.state_objects_destruct_entries();
        for (address, prev) in destructs {
            let addr_hash = hash_address(&address);
            let Some(prev) = prev else {
                if self.account_cached(&addr_hash) {
                    // Resurrected from nothing; the reverse diff must show
                    // it did not exist before the block.
                    self.record_account_origin(address, None);
                }
                continue;
            };
            self.record_account_origin(address, Some(prev.slim_rlp()));
            if prev.storage_root == EMPTY_ROOT_HASH {
                continue;
            }
            let (aborted, set, slots) = self.delete_storage(&address, addr_hash, prev.storage_root)?;
            if aborted {
                debug!(address = ?address, "storage wipe exceeded budget, marked incomplete");
                incomplete.insert(address);
                self.drop_storage_origin(&address);
                continue;
            }
            self.merge_wiped_storage_origin(address, slots);
            if !set.is_empty() {
                nodes.merge(set)?;
            }
        }
        Ok(incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_limit_is_512_mib() {
        assert_eq!(STORAGE_DELETE_LIMIT, 512 * 1024 * 1024);
    }
}
