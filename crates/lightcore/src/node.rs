//! Light client node
//!
//! Wires the configuration into a running [`LightOdr`]: the local store, the
//! request distributor and the retrieval coordinator on top of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lightcore_config::Config;
use lightcore_light_client::{LightOdr, OdrConfig, OdrStatus};
use lightcore_p2p::{DistributorConfig, Peer, PeerId, PeerStats, ReputationPolicy, RequestDistributor};
use lightcore_storage::{MemoryStore, NodeStore};
use tracing::info;

/// Coordinator settings from the `[odr]` and `[sync]` sections
pub fn odr_config(config: &Config) -> OdrConfig {
    OdrConfig {
        queue_capacity: config.odr.queue_capacity,
        batch_size: config.odr.batch_size,
        max_concurrent_fetches: config.odr.max_concurrent_fetches,
        max_lookup_rounds: config.odr.max_lookup_rounds,
        enqueue_retry: Duration::from_millis(config.odr.enqueue_retry_ms),
        bloom_bits: config.sync.bloom_bits,
        max_sync_depth: config.sync.max_depth,
    }
}

/// Distributor settings from the `[distributor]` section
pub fn distributor_config(config: &Config) -> DistributorConfig {
    let section = &config.distributor;
    let reputation = &section.reputation;
    DistributorConfig {
        request_timeout: Duration::from_millis(section.request_timeout_ms),
        max_attempts: section.max_attempts,
        max_in_flight_per_peer: section.max_in_flight_per_peer,
        peer_wait: Duration::from_millis(section.peer_wait_ms),
        min_protocol_version: section.min_protocol_version,
        late_response_window: Duration::from_millis(section.late_response_window_ms),
        reputation: ReputationPolicy {
            initial_score: reputation.initial_score,
            max_score: reputation.max_score,
            success_reward: reputation.success_reward,
            failure_penalty: reputation.failure_penalty,
            failure_cooldown: Duration::from_millis(reputation.failure_cooldown_ms),
        },
    }
}

/// A light client: local store, peers and the retrieval coordinator
pub struct LightNode<S: NodeStore = MemoryStore> {
    odr: Arc<LightOdr<S>>,
    distributor: Arc<RequestDistributor>,
}

impl LightNode<MemoryStore> {
    /// Create a node over an empty in-memory store
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::new(config, Arc::new(MemoryStore::new()))
    }
}

impl<S: NodeStore> LightNode<S> {
    /// Create a node over `store`. Must be called inside a tokio runtime.
    pub fn new(config: &Config, store: Arc<S>) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let distributor = Arc::new(RequestDistributor::new(distributor_config(config)));
        let odr = LightOdr::new(odr_config(config), store, distributor.clone())
            .context("failed to start retrieval coordinator")?;

        info!(
            request_timeout_ms = config.distributor.request_timeout_ms,
            max_attempts = config.distributor.max_attempts,
            "light node initialized"
        );
        Ok(Self {
            odr: Arc::new(odr),
            distributor,
        })
    }

    /// Retrieval coordinator
    pub fn odr(&self) -> &Arc<LightOdr<S>> {
        &self.odr
    }

    /// Request distributor
    pub fn distributor(&self) -> &Arc<RequestDistributor> {
        &self.distributor
    }

    /// Attach a serving peer
    pub fn add_peer(&self, peer: Arc<dyn Peer>) -> bool {
        self.distributor.register_peer(peer)
    }

    /// Reputation records of all attached peers
    pub fn peer_stats(&self) -> Vec<(PeerId, PeerStats)> {
        self.distributor.all_peer_stats()
    }

    /// Coordinator progress
    pub async fn status(&self) -> Result<OdrStatus> {
        Ok(self.odr.status().await?)
    }

    /// Stop the coordinator, then the distributor
    pub async fn shutdown(&self) {
        info!("shutting down light node");
        self.odr.close().await;
        self.distributor.close();
    }
}
