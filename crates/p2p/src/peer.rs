//! Peer abstraction and wire shapes
//!
//! Peers are supplied by the transport layer already connected. The
//! distributor only needs a peer's identity, what it serves, and a
//! non-blocking way to hand it a request; responses come back through
//! [`RequestDistributor::deliver`](crate::RequestDistributor::deliver).

use std::fmt;

use bytes::Bytes;
use lightcore_storage::{short_hex, Hash};
use serde::{Deserialize, Serialize};

use crate::PeerError;

/// Peer identifier type
pub type PeerId = [u8; 32];

/// Correlation id of an outstanding request
pub type RequestId = u64;

// ============================================================================
// Capabilities
// ============================================================================

/// Services a peer can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Serves state and storage trie nodes by hash
    StateNodes,
    /// Serves contract code by hash
    ContractCode,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::StateNodes => write!(f, "state-nodes"),
            Capability::ContractCode => write!(f, "contract-code"),
        }
    }
}

/// What a peer advertised during its handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    /// Protocol version spoken by the peer
    pub protocol_version: u32,
    /// Advertised chain head
    pub head_number: u64,
    /// Services offered
    pub services: Vec<Capability>,
}

impl PeerCapabilities {
    /// A peer offering every service
    pub fn full(protocol_version: u32, head_number: u64) -> Self {
        Self {
            protocol_version,
            head_number,
            services: vec![Capability::StateNodes, Capability::ContractCode],
        }
    }

    /// Check whether the peer offers `capability`
    pub fn serves(&self, capability: Capability) -> bool {
        self.services.contains(&capability)
    }
}

// ============================================================================
// Wire Shapes
// ============================================================================

/// Kind of an item in a fetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// Trie node
    Node,
    /// Contract code
    Code,
}

/// One requested item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchItem {
    /// Content hash
    pub hash: Hash,
    /// What the hash refers to
    pub kind: ItemKind,
}

impl fmt::Display for FetchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, short_hex(&self.hash))
    }
}

/// Batch request for content by hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Requested items
    pub items: Vec<FetchItem>,
}

impl FetchRequest {
    /// Build a request from items
    pub fn new(items: Vec<FetchItem>) -> Self {
        Self { items }
    }

    /// Encode for the wire
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode from the wire
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        bincode::deserialize(data).map_err(|e| PeerError::Malformed(e.to_string()))
    }
}

/// Answer for one requested item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemResponse {
    /// The content
    Found(Bytes),
    /// The peer does not have it
    NotFound,
}

/// Response to a [`FetchRequest`], one entry per requested item in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Per-item answers
    pub items: Vec<ItemResponse>,
}

impl FetchResponse {
    /// Encode for the wire
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode from the wire
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        bincode::deserialize(data).map_err(|e| PeerError::Malformed(e.to_string()))
    }

    /// Total payload bytes
    pub fn payload_len(&self) -> usize {
        self.items
            .iter()
            .map(|item| match item {
                ItemResponse::Found(data) => data.len(),
                ItemResponse::NotFound => 0,
            })
            .sum()
    }
}

// ============================================================================
// Peer Trait
// ============================================================================

/// A connected peer serving content by hash.
///
/// `send` must not block: it hands the request to the transport and returns.
/// The transport later calls `RequestDistributor::deliver` with the same
/// request id.
pub trait Peer: Send + Sync {
    /// Peer identity
    fn id(&self) -> PeerId;

    /// Capabilities advertised by the peer
    fn capabilities(&self) -> PeerCapabilities;

    /// Send a request to the peer
    fn send(&self, id: RequestId, request: &FetchRequest) -> Result<(), PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let request = FetchRequest::new(vec![
            FetchItem {
                hash: [1u8; 32],
                kind: ItemKind::Node,
            },
            FetchItem {
                hash: [2u8; 32],
                kind: ItemKind::Code,
            },
        ]);
        assert_eq!(FetchRequest::decode(&request.encode()).unwrap(), request);

        let response = FetchResponse {
            items: vec![ItemResponse::Found(Bytes::from_static(b"abc")), ItemResponse::NotFound],
        };
        assert_eq!(FetchResponse::decode(&response.encode()).unwrap(), response);
        assert_eq!(response.payload_len(), 3);
    }

    #[test]
    fn test_malformed_request() {
        assert!(matches!(
            FetchRequest::decode(&[0xff; 3]),
            Err(PeerError::Malformed(_))
        ));
    }

    #[test]
    fn test_capabilities() {
        let caps = PeerCapabilities {
            protocol_version: 2,
            head_number: 100,
            services: vec![Capability::StateNodes],
        };
        assert!(caps.serves(Capability::StateNodes));
        assert!(!caps.serves(Capability::ContractCode));
        assert!(PeerCapabilities::full(2, 0).serves(Capability::ContractCode));
    }
}
