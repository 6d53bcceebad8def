//! # State Database
//!
//! Per-block journaled state management with optimistic parallel
//! execution support.
//!
//! ## Capabilities
//!
//! - **Journaled mutation**: every write is revertible to numbered
//!   snapshots; transaction boundaries fold changes into a pending set.
//! - **Cryptographic commit**: pending changes hash into account and
//!   storage trie roots; commit persists node mutations together with a
//!   reverse diff of pre-block values.
//! - **Optimistic concurrency**: a shared multi-version map records the
//!   read and write sets of concurrently executing transactions and
//!   surfaces dependency aborts to an external scheduler.
//! - **Storage deletion accounting**: destroyed contract storage is wiped
//!   through a budgeted fast (snapshot) or slow (trie walk) path.
//!
//! ## Architecture
//!
//! Hexagonal: `domain` holds the state manager and its supporting logic,
//! `ports` the trait seams toward storage and observers, `adapters` the
//! in-memory reference backend, `events` the payloads crossing the
//! boundary.

pub mod adapters;
pub mod domain;
pub mod events;
pub mod ports;

pub use domain::{
    Address, ExecutionAbort, Hash, MultiVersionMap, StateAccount, StateDb, StateError,
    StorageKey, StorageValue, Subpath, Version, VersionedKey,
};
pub use events::StateUpdatePayload;
pub use ports::{ListenerRegistry, StateUpdateListener};
