//! # Versioned Key Model
//!
//! Encodes an account address plus an optional sub-path (balance, nonce,
//! code, self-destruct flag, or a specific storage slot) into a single
//! ordered key usable for conflict detection.
//!
//! Two operations conflict iff their keys compare equal. Keys also render
//! into a byte path for diagnostic dumps of read/write sets.

use super::entities::{Address, StorageKey};
use serde::{Deserialize, Serialize};

/// Sub-field of an account targeted by a read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subpath {
    Balance,
    Nonce,
    Code,
    SelfDestructed,
}

impl Subpath {
    fn tag(self) -> u8 {
        match self {
            Subpath::Balance => 1,
            Subpath::Nonce => 2,
            Subpath::Code => 3,
            Subpath::SelfDestructed => 4,
        }
    }
}

/// Location touched by a transaction: a whole account, one of its
/// sub-fields, or one of its storage slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VersionedKey {
    /// Account-level key (existence / object identity).
    Account(Address),
    /// A specific sub-field of an account.
    Field(Address, Subpath),
    /// A specific storage slot of an account.
    Slot(Address, StorageKey),
}

impl VersionedKey {
    pub fn address_key(address: Address) -> Self {
        VersionedKey::Account(address)
    }

    pub fn subpath_key(address: Address, subpath: Subpath) -> Self {
        VersionedKey::Field(address, subpath)
    }

    pub fn state_key(address: Address, slot: StorageKey) -> Self {
        VersionedKey::Slot(address, slot)
    }

    pub fn is_address(&self) -> bool {
        matches!(self, VersionedKey::Account(_))
    }

    pub fn is_state(&self) -> bool {
        matches!(self, VersionedKey::Slot(_, _))
    }

    pub fn address(&self) -> Address {
        match self {
            VersionedKey::Account(addr) => *addr,
            VersionedKey::Field(addr, _) => *addr,
            VersionedKey::Slot(addr, _) => *addr,
        }
    }

    pub fn subpath(&self) -> Option<Subpath> {
        match self {
            VersionedKey::Field(_, subpath) => Some(*subpath),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<StorageKey> {
        match self {
            VersionedKey::Slot(_, slot) => Some(*slot),
            _ => None,
        }
    }

    /// Byte path identifying the touched location, for diagnostic dumps.
    ///
    /// Layout: 20 address bytes, then either nothing (account key), a
    /// 32-byte slot (state key), or 32 zero bytes plus a one-byte sub-field
    /// tag (subpath key). The zero padding keeps subpath keys from ever
    /// colliding with slot keys.
    pub fn to_path_bytes(&self) -> Vec<u8> {
        match self {
            VersionedKey::Account(addr) => addr.as_bytes().to_vec(),
            VersionedKey::Slot(addr, slot) => {
                let mut path = Vec::with_capacity(52);
                path.extend_from_slice(addr.as_bytes());
                path.extend_from_slice(slot.as_bytes());
                path
            }
            VersionedKey::Field(addr, subpath) => {
                let mut path = Vec::with_capacity(53);
                path.extend_from_slice(addr.as_bytes());
                path.extend_from_slice(&[0u8; 32]);
                path.push(subpath.tag());
                path
            }
        }
    }

    /// Hex rendering of the path, used by read/write set dumps.
    pub fn to_hex_path(&self) -> String {
        hex::encode(self.to_path_bytes())
    }
}
