//! Pure domain logic of the state database.

pub mod access_list;
pub mod deletion;
pub mod entities;
pub mod errors;
pub mod journal;
pub mod mvcc;
pub mod object;
pub mod statedb;
pub mod transient;
pub mod versioned_key;

pub use entities::{Address, Hash, StateAccount, StorageKey, StorageValue};
pub use errors::StateError;
pub use mvcc::{ExecutionAbort, MultiVersionMap, ReadDescriptor, Version, WriteDescriptor};
pub use statedb::StateDb;
pub use versioned_key::{Subpath, VersionedKey};
