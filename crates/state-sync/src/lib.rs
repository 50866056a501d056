//! # Lightcore State Sync
//!
//! This crate schedules the retrieval of content-addressed trie data for the
//! lightcore light client.
//!
//! ## Key Components
//!
//! - **[`TrieSync`]**: tracks the frontier of missing trie nodes and blobs for
//!   any number of registered roots, deduplicated by content hash.
//!
//! - **[`SyncBloom`]**: probabilistic filter over committed hashes, used to
//!   skip store lookups for content that is definitely absent.
//!
//! - **[`AccountLeafDecoder`]**: discovers storage tries and contract code
//!   referenced by account leaves.
//!
//! ## Flow
//!
//! 1. **Register**: a root is added for full sync ([`TrieSync::add_sub_trie`])
//!    or along a single key ([`TrieSync::add_path`]).
//!
//! 2. **Dispatch**: [`TrieSync::missing`] hands out requests, shallowest first.
//!
//! 3. **Process**: fetched content is verified against its hash, decoded, and
//!    its children are scheduled.
//!
//! 4. **Commit**: once a node's children are stored, the node itself is
//!    written and reported through [`TrieSync::drain_events`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use lightcore_state_sync::{new_state_sync, SyncBloom};
//!
//! let mut sync = new_state_sync(root, store, Arc::new(SyncBloom::default()))?;
//! while sync.pending() > 0 {
//!     for request in sync.missing(64) {
//!         let data = fetch(request.hash).await?;
//!         sync.process(request.hash, data)?;
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod bloom;
pub mod state;
pub mod sync;

// Re-export main types at crate root
pub use bloom::{SyncBloom, DEFAULT_BLOOM_BITS};
pub use state::{new_state_sync, AccountLeafDecoder, ACCOUNT_NESTED_DEPTH};
pub use sync::{
    Expansion, LeafDecoder, NestedRef, RequestKind, SyncError, SyncEvent, SyncRequest, TrieSync,
    MAX_SYNC_DEPTH,
};

/// Result type for state sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
