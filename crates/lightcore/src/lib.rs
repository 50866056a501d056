//! # Lightcore
//!
//! Light client node for content-addressed state tries.
//!
//! This crate provides the `lightcore` binary and can also be used as a
//! library for embedding a light client into other applications.
//!
//! ## Components
//!
//! - [`LightNode`] - Local store, request distributor and retrieval coordinator
//! - [`sim`] - In-process serving peers and the `simulate` command
//!
//! ## Example
//!
//! ```rust,no_run
//! use lightcore::LightNode;
//! use lightcore_config::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(root: [u8; 32], address: [u8; 20]) -> anyhow::Result<()> {
//! let node = LightNode::in_memory(&Config::default())?;
//! // node.add_peer(peer);
//!
//! let account = node
//!     .odr()
//!     .retrieve_account(root, &address, &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod node;
pub mod sim;

pub use node::{distributor_config, odr_config, LightNode};
pub use sim::{GeneratedState, PeerCounters, SimulatedPeer, SimulationReport};
