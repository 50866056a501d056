//! # Lightcore Light Client
//!
//! On-demand state retrieval for a light client that holds only roots and
//! pulls the trie nodes and contract code it needs from peers.
//!
//! ## Overview
//!
//! A query such as "the account at address A under state root R" is answered
//! from the local store when possible. Otherwise the missing part of the key
//! path is scheduled for synchronization, fetched from peers, verified by hash
//! and committed, after which the query is answered locally.
//!
//! Concurrent queries share work: a hash that is already being fetched is
//! never fetched twice, and every caller waiting on it is woken when it
//! commits or fails.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------+
//! |     LightOdr      |  retrieve / retrieve_account / retrieve_code / sync_state
//! +-------------------+
//!          |
//!          v
//! +-------------------+
//! |     ExecQueue     |  single consumer thread owning the scheduler and waiters
//! +-------------------+
//!          |
//!          v
//! +-------------------+
//! |     TrieSync      |  frontier of missing content
//! +-------------------+
//!          |
//!          v
//! +-------------------+
//! | RequestDistributor|  peer selection, timeouts, retries
//! +-------------------+
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lightcore_light_client::{LightOdr, OdrConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let odr = LightOdr::new(OdrConfig::default(), store, distributor)?;
//! let cancel = CancellationToken::new();
//!
//! let account = odr.retrieve_account(state_root, &address, &cancel).await?;
//! let code = odr.retrieve_code(account.unwrap().code_hash, &cancel).await?;
//! ```
//!
//! ## Modules
//!
//! - [`queue`] - Bounded single-consumer execution queue
//! - [`odr`] - Retrieval coordinator
//! - [`error`] - Error types

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod error;
pub mod odr;
pub mod queue;

// Re-export main types at crate root
pub use error::{OdrError, Result};
pub use odr::{LightOdr, OdrConfig, OdrStatus};
pub use queue::{ExecQueue, Task};
