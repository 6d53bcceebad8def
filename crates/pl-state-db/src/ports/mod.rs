//! Trait seams between the state domain and its adapters.

pub mod database;
pub mod listener;
pub mod snapshot;

pub use database::{
    AccountTrie, Database, MergedNodeSet, NodeIterator, NodeSet, StackTrieBuilder, StateSetOrigin,
    StorageTrie, TrieDatabase, TrieItem, TrieNode, TrieScheme,
};
pub use listener::{ListenerRegistry, StateUpdateListener};
pub use snapshot::{
    AccountSnapshot, FallbackSnapshot, SnapshotAccount, SnapshotTree, StorageIterator,
};
