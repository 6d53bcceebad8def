//! Concrete implementations of the database and snapshot ports.

pub mod memory_db;

pub use memory_db::{InMemorySnapshotTree, InMemoryStateDatabase, InMemoryTrieDatabase};
