//! Tests for the light node against simulated peers

use std::sync::Arc;

use lightcore::sim::{self, generate_state, SimulatedPeer};
use lightcore::LightNode;
use lightcore_config::{Config, SimulationConfig};
use lightcore_storage::state::Address;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

fn quick_config() -> Config {
    let mut config = Config::default();
    config.distributor.request_timeout_ms = 200;
    config.distributor.peer_wait_ms = 200;
    config.distributor.reputation.failure_cooldown_ms = 100;
    config.simulation = SimulationConfig {
        peers: 3,
        accounts: 60,
        contract_every: 4,
        storage_slots: 2,
        lookups: 24,
        latency_ms: 1,
        jitter_ms: 2,
        drop_rate: 0.0,
        corruption_rate: 0.0,
        full_sync: true,
        seed: 7,
    };
    config
}

#[test]
fn test_generated_state_is_deterministic() {
    let config = quick_config().simulation;
    let a = generate_state(&config, &mut StdRng::seed_from_u64(config.seed)).unwrap();
    let b = generate_state(&config, &mut StdRng::seed_from_u64(config.seed)).unwrap();

    assert_eq!(a.root, b.root);
    assert_eq!(a.addresses, b.addresses);
    assert_eq!(a.addresses.len(), 60);

    let contracts = a
        .addresses
        .iter()
        .filter(|address| a.account(address).unwrap().unwrap().is_contract())
        .count();
    assert_eq!(contracts, 15);
}

#[tokio::test]
async fn test_simulation_with_reliable_peers() {
    let report = sim::run(&quick_config(), CancellationToken::new()).await.unwrap();

    assert_eq!(report.lookups, 24);
    assert_eq!(report.failed, 0);
    assert_eq!(report.found + report.absent, 24);
    assert!(report.sync_time.is_some());
    assert_eq!(report.status.pending_requests, 0);
    assert_eq!(report.status.waiters, 0);
    assert_eq!(report.peers.len(), 3);
    assert!(report.client_nodes > 0);
    assert!(report.client_nodes <= report.server_nodes);

    let rendered = report.to_string();
    assert!(rendered.starts_with("Lookups: 24\n"));
    assert_eq!(rendered.matches("rate 100%").count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulation_survives_corrupting_peer() {
    let mut config = quick_config();
    config.simulation.corruption_rate = 0.2;
    config.simulation.full_sync = false;

    let report = sim::run(&config, CancellationToken::new()).await.unwrap();
    assert_eq!(report.found + report.absent + report.failed, 24);
    assert_eq!(report.status.pending_requests, 0);

    // Corrupted answers cost the peer reputation
    for (_, stats, counters) in &report.peers {
        assert!(stats.failures >= counters.corrupted);
        if counters.corrupted > 0 {
            assert!(stats.success_rate() < 1.0);
        }
    }
}

#[tokio::test]
async fn test_canceled_simulation() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(sim::run(&quick_config(), cancel).await.is_err());
}

#[tokio::test]
async fn test_node_retrieves_from_simulated_peer() {
    let config = quick_config();
    let state = generate_state(&config.simulation, &mut StdRng::seed_from_u64(1)).unwrap();

    let node = LightNode::in_memory(&config).unwrap();
    let peer = Arc::new(SimulatedPeer::new(
        0,
        state.server.clone(),
        &config.simulation,
        node.distributor(),
    ));
    assert!(node.add_peer(peer.clone()));

    let cancel = CancellationToken::new();
    for address in state.addresses.iter().take(5) {
        let account = node
            .odr()
            .retrieve_account(state.root, address, &cancel)
            .await
            .unwrap();
        assert_eq!(account, state.account(address).unwrap());
    }

    let missing: Address = [0xee; 20];
    assert_eq!(
        node.odr().retrieve_account(state.root, &missing, &cancel).await.unwrap(),
        None
    );
    assert!(peer.counters().served > 0);
    assert_eq!(peer.counters().dropped, 0);

    node.shutdown().await;
    assert!(node.odr().is_closed());
}

#[test]
fn test_node_requires_runtime() {
    assert!(LightNode::in_memory(&Config::default()).is_err());
}

#[tokio::test]
async fn test_node_rejects_invalid_config() {
    let mut config = Config::default();
    config.odr.batch_size = 0;
    assert!(LightNode::in_memory(&config).is_err());
}
