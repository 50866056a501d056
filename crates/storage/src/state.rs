//! Account records stored in state trie leaves
//!
//! State trie keys are the Keccak256 hash of the 20-byte account address. Each
//! leaf value is a bincode-encoded [`Account`] which references two further
//! content-addressed objects:
//! - the root of the account's own storage trie
//! - the hash of the account's contract code

use serde::{Deserialize, Serialize};

use crate::{keccak256, Hash, Result, StorageError, EMPTY_HASH, EMPTY_ROOT};

/// 20-byte account address
pub type Address = [u8; 20];

/// Account state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Transaction nonce
    pub nonce: u64,
    /// Account balance in wei
    pub balance: u128,
    /// Hash of the account's contract code (EMPTY_HASH if no code)
    pub code_hash: Hash,
    /// Root hash of the account's storage trie
    pub storage_root: Hash,
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}

impl Account {
    /// Create a new empty account
    pub fn new() -> Self {
        Self::with_balance(0)
    }

    /// Create an account with balance
    pub fn with_balance(balance: u128) -> Self {
        Self {
            nonce: 0,
            balance,
            code_hash: EMPTY_HASH,
            storage_root: EMPTY_ROOT,
        }
    }

    /// Check if this is an empty account
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance == 0 && self.code_hash == EMPTY_HASH
    }

    /// Check if this is a contract account
    pub fn is_contract(&self) -> bool {
        self.code_hash != EMPTY_HASH
    }

    /// Check if the account has a non-empty storage trie
    pub fn has_storage(&self) -> bool {
        self.storage_root != EMPTY_ROOT
    }

    /// Encode the account for storage
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode an account from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// State trie key for an address
pub fn account_key(address: &Address) -> Hash {
    keccak256(address)
}

/// Storage trie key for a slot
pub fn storage_key(slot: &Hash) -> Hash {
    keccak256(slot)
}
