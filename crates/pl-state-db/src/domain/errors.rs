use super::entities::{Address, Hash};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Snapshot unavailable for root {root:?}")]
    SnapshotUnavailable { root: Hash },

    #[error("Snapshot root mismatch: expected {expected:?}, got {actual:?}")]
    RootMismatch { expected: Hash, actual: Hash },

    #[error("Failed to delete storage for {address:?}: {reason}")]
    StorageDeletion { address: Address, reason: String },

    #[error("Commit aborted due to earlier error: {0}")]
    CommitAborted(String),

    #[error("Commit already performed; construct a new manager from the returned root")]
    CommitTerminated,

    #[error("Node set for owner {owner:?} merged twice with conflicting paths")]
    NodeSetConflict { owner: Hash },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}
