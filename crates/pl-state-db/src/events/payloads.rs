//! Serializable payloads emitted around state commits.

use crate::domain::entities::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Full description of one committed block's state changes, delivered to
/// registered listeners after trie commit and before the snapshot layer is
/// updated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateUpdatePayload {
    /// State root after the block.
    pub root: Hash,
    /// State root before the block.
    pub parent: Hash,
    /// Block number being committed.
    pub block: u64,
    /// Address hashes of accounts destroyed in this block.
    pub destructs: HashSet<Hash>,
    /// Updated accounts by address hash, slim-encoded.
    pub accounts: HashMap<Hash, Vec<u8>>,
    /// Updated storage by address hash and slot hash; empty blobs mark
    /// deleted slots.
    pub storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    /// New contract code by code hash.
    pub code_updates: HashMap<Hash, Vec<u8>>,
}
