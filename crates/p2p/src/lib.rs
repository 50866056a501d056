//! # Lightcore P2P
//!
//! Peer-facing layer of the lightcore light client.
//!
//! This crate provides:
//! - **Peer abstraction** - identity, capabilities and a non-blocking send, plus
//!   the request/response shapes exchanged with serving peers
//! - **Request distribution** - peer selection, timeouts and retries across peers
//! - **Reputation** - per-peer score, round-trip estimate and failure cooldown
//! - **Expiring set** - time-keyed membership with lazy expiry
//!
//! ## Example
//!
//! ```rust,ignore
//! use lightcore_p2p::{Capability, DistributorConfig, FetchItem, FetchRequest, ItemKind, RequestDistributor};
//!
//! let distributor = Arc::new(RequestDistributor::new(DistributorConfig::default()));
//! distributor.register_peer(peer);
//!
//! // The transport hands responses back with `deliver`
//! let request = FetchRequest::new(vec![FetchItem { hash, kind: ItemKind::Node }]);
//! let nodes = distributor.distribute(request, Capability::StateNodes).await?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod distributor;
pub mod expiry;
pub mod peer;
pub mod reputation;

// Re-export main types at crate root
pub use distributor::{DistributorConfig, RequestDistributor};
pub use expiry::ExpiringSet;
pub use peer::{
    Capability, FetchItem, FetchRequest, FetchResponse, ItemKind, ItemResponse, Peer,
    PeerCapabilities, PeerId, RequestId,
};
pub use reputation::{PeerStats, PeerStatus, ReputationPolicy};

use bytes::Bytes;
use lightcore_storage::Hash;

/// Errors raised by a peer transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    /// The peer connection is gone
    #[error("peer disconnected")]
    Disconnected,

    /// The transport refused the message
    #[error("send error: {0}")]
    Send(String),

    /// Bytes on the wire did not decode
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Errors returned by [`RequestDistributor::distribute`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DistributeError {
    /// Attempts ran out with items still unresolved
    #[error("no peer available: {} items unresolved after {attempts} attempts", .unresolved.len())]
    NoPeerAvailable {
        /// Items that were delivered and verified
        delivered: Vec<(Hash, Bytes)>,
        /// Hashes nobody delivered
        unresolved: Vec<Hash>,
        /// Distinct peers tried
        attempts: u32,
    },

    /// The distributor was closed
    #[error("request distributor closed")]
    Closed,
}
