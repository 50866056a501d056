//! State trie synchronization
//!
//! Account leaves reference two further objects: the account's storage trie
//! and its contract code. [`AccountLeafDecoder`] turns those references into
//! scheduler requests so a single registered state root pulls in everything
//! below it.

use std::sync::Arc;

use lightcore_storage::{Account, Hash, NodeStore, EMPTY_HASH, EMPTY_ROOT};

use crate::bloom::SyncBloom;
use crate::sync::{LeafDecoder, NestedRef, SyncError, TrieSync};

/// Depth at which storage tries and code of an account are scheduled
pub const ACCOUNT_NESTED_DEPTH: u32 = 64;

/// Leaf decoder for the account trie
#[derive(Debug, Default, Clone, Copy)]
pub struct AccountLeafDecoder;

impl LeafDecoder for AccountLeafDecoder {
    fn decode(&self, leaf: &[u8]) -> Result<Vec<NestedRef>, String> {
        let account = Account::decode(leaf).map_err(|e| e.to_string())?;

        let mut nested = Vec::with_capacity(2);
        if account.storage_root != EMPTY_ROOT {
            nested.push(NestedRef::SubTrie(account.storage_root));
        }
        if account.code_hash != EMPTY_HASH {
            nested.push(NestedRef::RawEntry(account.code_hash));
        }
        Ok(nested)
    }

    fn nested_depth(&self, _leaf_depth: u32) -> u32 {
        ACCOUNT_NESTED_DEPTH
    }
}

/// Create a scheduler that synchronizes the whole state below `root`,
/// including every account's storage trie and code.
pub fn new_state_sync<S: NodeStore + ?Sized>(
    root: Hash,
    store: Arc<S>,
    bloom: Arc<SyncBloom>,
) -> Result<TrieSync<S>, SyncError> {
    let mut sync = TrieSync::new(store, bloom);
    sync.add_sub_trie(root, 0, None, Some(Arc::new(AccountLeafDecoder)))?;
    Ok(sync)
}
