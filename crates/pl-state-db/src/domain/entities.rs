//! # Domain Entities for the State Database
//!
//! Core account/hash primitives shared by every other module.
//!
//! ## Type Decisions
//!
//! - `balance: U256` - Account balances are full 256-bit quantities so that
//!   committed roots stay compatible with the canonical account encoding.
//! - `Address`/`Hash` come from `primitive-types` (H160/H256) which carry
//!   RLP and serde support out of the box.

use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use super::errors::StateError;

pub type Address = H160;
pub type Hash = H256;
pub type StorageKey = H256;
pub type StorageValue = H256;

/// Keccak256 hash of empty bytes. Accounts without code carry this hash.
pub const EMPTY_CODE_HASH: Hash = H256([
    0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c, 0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7, 0x03, 0xc0,
    0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b, 0x7b, 0xfa, 0xd8, 0x04, 0x5d, 0x85, 0xa4, 0x70,
]);

/// Keccak256 hash of an empty RLP-encoded trie.
/// Value: keccak256(RLP("")) = 0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421
pub const EMPTY_ROOT_HASH: Hash = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8, 0x6e,
    0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63, 0xb4, 0x21,
]);

/// Compute the Keccak256 hash of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256(hasher.finalize().into())
}

/// Hash an account address into its trie/snapshot key.
pub fn hash_address(address: &Address) -> Hash {
    keccak256(address.as_bytes())
}

/// Hash a storage slot key into its trie/snapshot key.
pub fn hash_slot(key: &StorageKey) -> Hash {
    keccak256(key.as_bytes())
}

/// Account state committed into the account trie.
///
/// Identified by its 20-byte address; the trie and snapshot layers key it by
/// the address hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAccount {
    /// Transaction nonce. Increments by exactly one per processed transaction.
    pub nonce: u64,
    /// Account balance in base units.
    pub balance: U256,
    /// Root hash of the account's storage trie. `EMPTY_ROOT_HASH` if empty.
    pub storage_root: Hash,
    /// Keccak256 hash of contract code. `EMPTY_CODE_HASH` for plain accounts.
    pub code_hash: Hash,
}

impl Default for StateAccount {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: EMPTY_ROOT_HASH,
            code_hash: EMPTY_CODE_HASH,
        }
    }
}

impl StateAccount {
    /// Create a new account with the specified balance.
    pub fn new(balance: U256) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }

    /// Builder method to set nonce.
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// True when the account has no contract code.
    pub fn has_empty_code(&self) -> bool {
        self.code_hash == EMPTY_CODE_HASH
    }

    /// Slim RLP encoding: `[nonce, balance, storage_root, code_hash]` with
    /// the empty storage root and the empty code hash encoded as empty
    /// strings. This is the form cached per block and handed to the
    /// snapshot layer.
    pub fn slim_rlp(&self) -> Vec<u8> {
        let mut stream = rlp::RlpStream::new_list(4);
        stream.append(&self.nonce);
        stream.append(&self.balance);
        if self.storage_root == EMPTY_ROOT_HASH {
            stream.append_empty_data();
        } else {
            stream.append(&self.storage_root);
        }
        if self.code_hash == EMPTY_CODE_HASH {
            stream.append_empty_data();
        } else {
            stream.append(&self.code_hash);
        }
        stream.out().to_vec()
    }

    /// Decode the slim RLP form, restoring the omitted empty fields.
    pub fn from_slim_rlp(data: &[u8]) -> Result<Self, StateError> {
        let decode = |err: rlp::DecoderError| StateError::Encoding(err.to_string());
        let item = rlp::Rlp::new(data);
        let nonce: u64 = item.val_at(0).map_err(decode)?;
        let balance: U256 = item.val_at(1).map_err(decode)?;
        let storage_root = {
            let field = item.at(2).map_err(decode)?;
            if field.is_empty() {
                EMPTY_ROOT_HASH
            } else {
                field.as_val::<H256>().map_err(decode)?
            }
        };
        let code_hash = {
            let field = item.at(3).map_err(decode)?;
            if field.is_empty() {
                EMPTY_CODE_HASH
            } else {
                field.as_val::<H256>().map_err(decode)?
            }
        };
        Ok(Self {
            nonce,
            balance,
            storage_root,
            code_hash,
        })
    }
}

/// Encode a storage value the way snapshots and per-block caches carry it:
/// big-endian with leading zeros trimmed. The zero value encodes to empty.
pub fn encode_slot_value(value: &StorageValue) -> Vec<u8> {
    let bytes = value.as_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(32);
    bytes[start..].to_vec()
}

/// Decode a trimmed storage value blob back into a full 32-byte value.
pub fn decode_slot_value(blob: &[u8]) -> StorageValue {
    let mut out = [0u8; 32];
    let len = blob.len().min(32);
    out[32 - len..].copy_from_slice(&blob[blob.len() - len..]);
    H256(out)
}
