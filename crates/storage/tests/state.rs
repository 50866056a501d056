//! Integration tests for account records

use std::sync::Arc;

use lightcore_storage::state::{account_key, Account};
use lightcore_storage::{MemoryStore, MerkleTrie, EMPTY_HASH, EMPTY_ROOT};

#[test]
fn test_account_new() {
    let account = Account::new();
    assert_eq!(account.nonce, 0);
    assert_eq!(account.balance, 0);
    assert_eq!(account.code_hash, EMPTY_HASH);
    assert_eq!(account.storage_root, EMPTY_ROOT);
    assert!(account.is_empty());
    assert!(!account.is_contract());
    assert!(!account.has_storage());
}

#[test]
fn test_account_encode_decode() {
    let account = Account {
        nonce: 42,
        balance: 1_000_000,
        code_hash: [1u8; 32],
        storage_root: [2u8; 32],
    };

    let decoded = Account::decode(&account.encode()).unwrap();
    assert_eq!(account, decoded);
    assert!(decoded.is_contract());
    assert!(decoded.has_storage());
}

#[test]
fn test_account_decode_garbage() {
    assert!(Account::decode(&[0xff, 0x01]).is_err());
}

#[test]
fn test_accounts_in_state_trie() {
    let trie = MerkleTrie::new(Arc::new(MemoryStore::new()));
    let alice = [0xaa; 20];
    let bob = [0xbb; 20];

    trie.insert(&account_key(&alice), &Account::with_balance(100).encode())
        .unwrap();
    trie.insert(&account_key(&bob), &Account::with_balance(7).encode())
        .unwrap();

    let raw = trie.get(&account_key(&alice)).unwrap().unwrap();
    assert_eq!(Account::decode(&raw).unwrap().balance, 100);
    assert!(trie.get(&account_key(&[0xcc; 20])).unwrap().is_none());
}
