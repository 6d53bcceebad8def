//! # Multi-Version Map
//!
//! Concurrency layer for optimistic parallel transaction execution.
//!
//! ## Problem
//!
//! Multiple transactions of one block execute concurrently, potentially out
//! of commit order, against shared pre-block storage.
//!
//! ## Solution: Multi-Version Concurrency Control
//!
//! Every write is recorded per `(key, transaction index)` cell. A read at
//! index `i` observes the highest-index flushed write below `i`, falls
//! through to underlying storage when no such write exists, and aborts the
//! attempt when the candidate write is still tentative (the writer has not
//! been accepted yet). Aborts surface as an explicit [`ExecutionAbort`]
//! value so the external scheduler decides retry policy.

use super::entities::StorageValue;
use super::versioned_key::VersionedKey;
use primitive_types::U256;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Identifies which attempt of which transaction produced a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Version {
    pub tx_index: usize,
    pub incarnation: usize,
}

impl Version {
    pub fn new(tx_index: usize, incarnation: usize) -> Self {
        Self {
            tx_index,
            incarnation,
        }
    }
}

/// Concrete value carried by a versioned write.
///
/// Carrying values (rather than references into the writer's state) means
/// concurrent attempts never share mutable state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MvValue {
    /// Account-level existence (object created or known present).
    Exists(bool),
    Balance(U256),
    Nonce(u64),
    Code(Option<Arc<Vec<u8>>>),
    SelfDestructed(bool),
    Storage(StorageValue),
}

/// Where a recorded read was satisfied from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadKind {
    /// Served by a flushed write in the multi-version map.
    FromMap,
    /// Fell through to pre-block storage.
    FromStorage,
}

/// One observed read, kept for later validation of the attempt.
#[derive(Clone, Debug)]
pub struct ReadDescriptor {
    pub path: VersionedKey,
    pub kind: ReadKind,
    /// Version observed for map reads; `None` for storage reads.
    pub version: Option<Version>,
}

/// One tentative write produced by an attempt.
#[derive(Clone, Debug)]
pub struct WriteDescriptor {
    pub path: VersionedKey,
    pub version: Version,
    pub value: MvValue,
}

/// Dependency abort: the reading attempt observed a write it must not use
/// yet. Normal control flow for the scheduler, not an application error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionAbort {
    /// Index of the transaction whose write blocked this read.
    pub dep_tx_index: usize,
}

/// Outcome of a versioned read.
#[derive(Clone, Debug)]
pub enum ReadResult {
    /// Value written by the highest flushed transaction index below the
    /// reader's, with the version that wrote it.
    Done { version: Version, value: MvValue },
    /// A tentative write from a lower index exists; the reader must abort
    /// and retry after that transaction is accepted.
    Dependency { tx_index: usize },
    /// No prior write; read falls through to underlying storage.
    None,
}

#[derive(Clone, Debug)]
struct Cell {
    incarnation: usize,
    value: MvValue,
    flushed: bool,
}

/// Concurrent map from versioned key to per-transaction-index writes.
///
/// Shared across all in-flight attempts of a block via `Arc`.
#[derive(Default)]
pub struct MultiVersionMap {
    cells: RwLock<HashMap<VersionedKey, BTreeMap<usize, Cell>>>,
}

impl MultiVersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the latest applicable write below `tx_index`.
    pub fn read(&self, key: &VersionedKey, tx_index: usize) -> ReadResult {
        let cells = self.cells.read().expect("mv map lock poisoned");
        let Some(versions) = cells.get(key) else {
            return ReadResult::None;
        };
        let Some((&writer_index, cell)) = versions.range(..tx_index).next_back() else {
            return ReadResult::None;
        };
        if !cell.flushed {
            return ReadResult::Dependency {
                tx_index: writer_index,
            };
        }
        ReadResult::Done {
            version: Version::new(writer_index, cell.incarnation),
            value: cell.value.clone(),
        }
    }

    /// Record a tentative write for one transaction attempt. Never touches
    /// other transactions' cells.
    ///
    /// ## Panics
    ///
    /// Panics when a stale incarnation tries to overwrite a newer one; the
    /// scheduler must never run two incarnations of one transaction at once.
    pub fn write(&self, key: VersionedKey, version: Version, value: MvValue) {
        let mut cells = self.cells.write().expect("mv map lock poisoned");
        let slot = cells
            .entry(key)
            .or_default()
            .entry(version.tx_index)
            .or_insert_with(|| Cell {
                incarnation: version.incarnation,
                value: value.clone(),
                flushed: false,
            });
        assert!(
            slot.incarnation <= version.incarnation,
            "stale incarnation {} writing over {}",
            version.incarnation,
            slot.incarnation,
        );
        slot.incarnation = version.incarnation;
        slot.value = value;
        slot.flushed = false;
    }

    /// Durably merge an accepted transaction's write set into the map.
    pub fn flush_write_set(&self, writes: &[WriteDescriptor]) {
        let mut cells = self.cells.write().expect("mv map lock poisoned");
        for write in writes {
            let slot = cells
                .entry(write.path)
                .or_default()
                .entry(write.version.tx_index)
                .or_insert_with(|| Cell {
                    incarnation: write.version.incarnation,
                    value: write.value.clone(),
                    flushed: false,
                });
            if slot.incarnation <= write.version.incarnation {
                slot.incarnation = write.version.incarnation;
                slot.value = write.value.clone();
            }
            slot.flushed = true;
        }
    }

    /// Demote a transaction's entries back to tentative before it is
    /// re-executed with a bumped incarnation. Readers that land on them
    /// will abort instead of consuming a value about to be replaced.
    pub fn mark_estimates(&self, keys: &[VersionedKey], tx_index: usize) {
        let mut cells = self.cells.write().expect("mv map lock poisoned");
        for key in keys {
            if let Some(cell) = cells.get_mut(key).and_then(|v| v.get_mut(&tx_index)) {
                cell.flushed = false;
            }
        }
    }

    /// Drop a transaction's entry for a key (a write reverted before flush).
    pub fn delete(&self, key: &VersionedKey, tx_index: usize) {
        let mut cells = self.cells.write().expect("mv map lock poisoned");
        if let Some(versions) = cells.get_mut(key) {
            versions.remove(&tx_index);
            if versions.is_empty() {
                cells.remove(key);
            }
        }
    }

    /// Re-check a completed attempt's read set against the current map.
    /// Returns false when any read would now resolve differently.
    pub fn validate_read_set(&self, reads: &[ReadDescriptor], tx_index: usize) -> bool {
        reads.iter().all(|read| {
            match (self.read(&read.path, tx_index), read.kind) {
                (ReadResult::Done { version, .. }, ReadKind::FromMap) => {
                    read.version == Some(version)
                }
                (ReadResult::None, ReadKind::FromStorage) => true,
                _ => false,
            }
        })
    }

    /// Number of keys with at least one recorded write.
    pub fn len(&self) -> usize {
        self.cells.read().expect("mv map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
