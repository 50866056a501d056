//! Tests for the request distributor

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use lightcore_p2p::{
    Capability, DistributeError, DistributorConfig, FetchItem, FetchRequest, FetchResponse,
    ItemKind, ItemResponse, Peer, PeerCapabilities, PeerError, PeerId, PeerStatus, RequestDistributor,
    RequestId, ReputationPolicy,
};
use lightcore_storage::{keccak256, Hash, MemoryStore, NodeStore};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Serve,
    Silent,
    Corrupt,
    NotFound,
    FailSend,
}

struct MockPeer {
    id: PeerId,
    capabilities: PeerCapabilities,
    store: Arc<MemoryStore>,
    behavior: Mutex<Behavior>,
    delay: Duration,
    distributor: Weak<RequestDistributor>,
    received: Mutex<Vec<RequestId>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockPeer {
    fn new(
        tag: u8,
        distributor: &Arc<RequestDistributor>,
        store: &Arc<MemoryStore>,
        behavior: Behavior,
    ) -> Arc<Self> {
        Self::with_delay(tag, distributor, store, behavior, Duration::from_millis(1))
    }

    fn with_delay(
        tag: u8,
        distributor: &Arc<RequestDistributor>,
        store: &Arc<MemoryStore>,
        behavior: Behavior,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: [tag; 32],
            capabilities: PeerCapabilities::full(1, 1000),
            store: store.clone(),
            behavior: Mutex::new(behavior),
            delay,
            distributor: Arc::downgrade(distributor),
            received: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn requests(&self) -> usize {
        self.received.lock().len()
    }

    fn answer(&self, request: &FetchRequest, behavior: Behavior) -> FetchResponse {
        let items = request
            .items
            .iter()
            .map(|item| match behavior {
                Behavior::Corrupt => ItemResponse::Found(Bytes::from_static(b"garbage")),
                Behavior::NotFound => ItemResponse::NotFound,
                _ => match self.store.get(&item.hash).unwrap() {
                    Some(data) => ItemResponse::Found(data),
                    None => ItemResponse::NotFound,
                },
            })
            .collect();
        FetchResponse { items }
    }
}

impl Peer for MockPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn capabilities(&self) -> PeerCapabilities {
        self.capabilities.clone()
    }

    fn send(&self, id: RequestId, request: &FetchRequest) -> Result<(), PeerError> {
        let behavior = *self.behavior.lock();
        if behavior == Behavior::FailSend {
            return Err(PeerError::Send("connection reset".into()));
        }
        self.received.lock().push(id);
        if behavior == Behavior::Silent {
            return Ok(());
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let response = self.answer(request, behavior);
        let distributor = self.distributor.clone();
        let peer = self.id;
        let delay = self.delay;
        let counter = self.active.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            counter.fetch_sub(1, Ordering::SeqCst);
            if let Some(distributor) = distributor.upgrade() {
                distributor.deliver(&peer, id, response);
            }
        });
        Ok(())
    }
}

fn config() -> DistributorConfig {
    DistributorConfig {
        request_timeout: Duration::from_millis(100),
        max_attempts: 5,
        max_in_flight_per_peer: 4,
        peer_wait: Duration::from_millis(100),
        ..Default::default()
    }
}

fn blobs(store: &MemoryStore, count: u8) -> Vec<FetchItem> {
    (0..count)
        .map(|i| {
            let data = Bytes::from(vec![i; 16]);
            let hash = keccak256(&data);
            store.put(hash, data).unwrap();
            FetchItem {
                hash,
                kind: ItemKind::Code,
            }
        })
        .collect()
}

fn hashes(items: &[(Hash, Bytes)]) -> Vec<Hash> {
    let mut hashes: Vec<Hash> = items.iter().map(|(h, _)| *h).collect();
    hashes.sort();
    hashes
}

#[tokio::test]
async fn test_distribute_from_single_peer() {
    let distributor = Arc::new(RequestDistributor::new(config()));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 3);
    let peer = MockPeer::new(1, &distributor, &store, Behavior::Serve);
    assert!(distributor.register_peer(peer.clone()));
    assert!(!distributor.register_peer(peer.clone()));

    let delivered = distributor
        .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
        .await
        .unwrap();

    let mut expected: Vec<Hash> = items.iter().map(|i| i.hash).collect();
    expected.sort();
    assert_eq!(hashes(&delivered), expected);

    let stats = distributor.peer_stats(&peer.id).unwrap();
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.score, 110);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.rtt.is_some());
    assert_eq!(distributor.pending_requests(), 0);
}

#[tokio::test]
async fn test_empty_request_resolves_immediately() {
    let distributor = RequestDistributor::new(config());
    let delivered = distributor
        .distribute(FetchRequest::default(), Capability::StateNodes)
        .await
        .unwrap();
    assert!(delivered.is_empty());
}

#[tokio::test]
async fn test_corrupt_peer_is_penalized_and_bypassed() {
    let distributor = Arc::new(RequestDistributor::new(config()));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 2);
    let bad = MockPeer::new(1, &distributor, &store, Behavior::Corrupt);
    let good = MockPeer::new(2, &distributor, &store, Behavior::Serve);
    distributor.register_peer(bad.clone());
    distributor.register_peer(good.clone());

    for _ in 0..3 {
        let delivered = distributor
            .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 2);
    }

    let bad_stats = distributor.peer_stats(&bad.id).unwrap();
    assert_eq!(bad_stats.failures, 1);
    assert_eq!(bad_stats.score, 80);
    assert!(matches!(bad_stats.status, PeerStatus::CoolingDown { .. }));
    assert_eq!(bad.requests(), 1);
    assert_eq!(good.requests(), 3);
}

#[tokio::test]
async fn test_retry_bound_is_peer_count() {
    let distributor = Arc::new(RequestDistributor::new(config()));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let peers: Vec<_> = (1..=3)
        .map(|tag| MockPeer::new(tag, &distributor, &store, Behavior::Silent))
        .collect();
    for peer in &peers {
        distributor.register_peer(peer.clone());
    }

    let err = distributor
        .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
        .await
        .unwrap_err();
    match err {
        DistributeError::NoPeerAvailable {
            delivered,
            unresolved,
            attempts,
        } => {
            assert!(delivered.is_empty());
            assert_eq!(unresolved, vec![items[0].hash]);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error {:?}", other),
    }
    for peer in &peers {
        assert_eq!(peer.requests(), 1);
        assert_eq!(distributor.peer_stats(&peer.id).unwrap().failures, 1);
    }
}

#[tokio::test]
async fn test_retry_bound_is_max_attempts() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        max_attempts: 2,
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let peers: Vec<_> = (1..=5)
        .map(|tag| MockPeer::new(tag, &distributor, &store, Behavior::FailSend))
        .collect();
    for peer in &peers {
        distributor.register_peer(peer.clone());
    }

    let err = distributor
        .distribute(FetchRequest::new(items), Capability::ContractCode)
        .await
        .unwrap_err();
    assert!(matches!(err, DistributeError::NoPeerAvailable { attempts: 2, .. }));
    let failed = peers
        .iter()
        .filter(|p| distributor.peer_stats(&p.id).unwrap().failures == 1)
        .count();
    assert_eq!(failed, 2);
}

#[tokio::test]
async fn test_not_found_moves_on_without_penalty() {
    let distributor = Arc::new(RequestDistributor::new(config()));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 2);
    let empty = MockPeer::new(1, &distributor, &store, Behavior::NotFound);
    let full = MockPeer::new(2, &distributor, &store, Behavior::Serve);
    distributor.register_peer(empty.clone());
    distributor.register_peer(full.clone());

    let delivered = distributor
        .distribute(FetchRequest::new(items), Capability::ContractCode)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 2);

    let stats = distributor.peer_stats(&empty.id).unwrap();
    assert_eq!(stats.failures, 0);
    assert!(stats.score >= 100);
}

#[tokio::test]
async fn test_partial_delivery_is_reported() {
    let distributor = Arc::new(RequestDistributor::new(config()));
    let store = Arc::new(MemoryStore::new());
    let mut items = blobs(&store, 2);
    let absent = keccak256(b"nobody has this");
    items.push(FetchItem {
        hash: absent,
        kind: ItemKind::Code,
    });
    distributor.register_peer(MockPeer::new(1, &distributor, &store, Behavior::Serve));

    match distributor
        .distribute(FetchRequest::new(items), Capability::ContractCode)
        .await
    {
        Err(DistributeError::NoPeerAvailable {
            delivered,
            unresolved,
            attempts,
        }) => {
            assert_eq!(delivered.len(), 2);
            assert_eq!(unresolved, vec![absent]);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_capability_and_version_filter() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        min_protocol_version: 2,
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);

    // Speaks an old protocol
    distributor.register_peer(MockPeer::new(1, &distributor, &store, Behavior::Serve));

    let err = distributor
        .distribute(FetchRequest::new(items), Capability::ContractCode)
        .await
        .unwrap_err();
    assert!(matches!(err, DistributeError::NoPeerAvailable { attempts: 0, .. }));
}

#[tokio::test]
async fn test_waits_for_late_registration() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        peer_wait: Duration::from_secs(2),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);

    let task = {
        let distributor = distributor.clone();
        tokio::spawn(async move {
            distributor
                .distribute(FetchRequest::new(items), Capability::ContractCode)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    distributor.register_peer(MockPeer::new(1, &distributor, &store, Behavior::Serve));

    assert_eq!(task.await.unwrap().unwrap().len(), 1);
}

#[tokio::test]
async fn test_in_flight_limit_is_respected() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        max_in_flight_per_peer: 1,
        peer_wait: Duration::from_secs(2),
        request_timeout: Duration::from_secs(1),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 4);
    let peer = MockPeer::with_delay(1, &distributor, &store, Behavior::Serve, Duration::from_millis(30));
    distributor.register_peer(peer.clone());

    let tasks: Vec<_> = items
        .into_iter()
        .map(|item| {
            let distributor = distributor.clone();
            tokio::spawn(async move {
                distributor
                    .distribute(FetchRequest::new(vec![item]), Capability::ContractCode)
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), 1);
    }

    assert_eq!(peer.requests(), 4);
    assert_eq!(peer.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prefers_lower_round_trip() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        request_timeout: Duration::from_secs(1),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let fast = MockPeer::with_delay(1, &distributor, &store, Behavior::Serve, Duration::from_millis(2));
    let slow = MockPeer::with_delay(2, &distributor, &store, Behavior::Serve, Duration::from_millis(80));
    distributor.register_peer(fast.clone());
    distributor.register_peer(slow.clone());

    for _ in 0..6 {
        distributor
            .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
            .await
            .unwrap();
    }

    // Each peer is measured once, after that the fast one wins
    assert_eq!(slow.requests(), 1);
    assert_eq!(fast.requests(), 5);
}

#[tokio::test]
async fn test_penalized_peer_ranks_after_healthy_ones() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        reputation: ReputationPolicy {
            failure_cooldown: Duration::from_millis(20),
            ..Default::default()
        },
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let flaky = MockPeer::new(1, &distributor, &store, Behavior::Corrupt);
    distributor.register_peer(flaky.clone());
    assert!(distributor
        .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
        .await
        .is_err());

    let steady = MockPeer::new(2, &distributor, &store, Behavior::Serve);
    distributor.register_peer(steady.clone());
    distributor
        .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
        .await
        .unwrap();

    // Out of cooldown and serving again, but still scored below a new peer.
    // Without a round-trip estimate it would otherwise rank first.
    tokio::time::sleep(Duration::from_millis(40)).await;
    *flaky.behavior.lock() = Behavior::Serve;
    for _ in 0..3 {
        distributor
            .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
            .await
            .unwrap();
    }

    let flaky_stats = distributor.peer_stats(&flaky.id).unwrap();
    assert_eq!(flaky_stats.score, 80);
    assert!(flaky_stats.rtt.is_none());
    assert_eq!(flaky.requests(), 1);
    assert_eq!(steady.requests(), 4);
}

#[tokio::test]
async fn test_response_correlation() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        request_timeout: Duration::from_secs(2),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let peer = MockPeer::new(1, &distributor, &store, Behavior::Silent);
    distributor.register_peer(peer.clone());

    let task = {
        let distributor = distributor.clone();
        let items = items.clone();
        tokio::spawn(async move {
            distributor
                .distribute(FetchRequest::new(items), Capability::ContractCode)
                .await
        })
    };
    while peer.requests() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let id = peer.received.lock()[0];
    let response = peer.answer(&FetchRequest::new(items), Behavior::Serve);

    // Unknown id and wrong peer are dropped
    assert!(!distributor.deliver(&peer.id, id + 100, response.clone()));
    assert!(!distributor.deliver(&[9u8; 32], id, response.clone()));
    assert!(distributor.deliver(&peer.id, id, response.clone()));
    assert_eq!(task.await.unwrap().unwrap().len(), 1);

    // Already answered
    assert!(!distributor.deliver(&peer.id, id, response));
}

#[tokio::test]
async fn test_late_response_is_discarded() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        request_timeout: Duration::from_millis(20),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let peer = MockPeer::new(1, &distributor, &store, Behavior::Silent);
    distributor.register_peer(peer.clone());

    assert!(distributor
        .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
        .await
        .is_err());
    let id = peer.received.lock()[0];
    let response = peer.answer(&FetchRequest::new(items), Behavior::Serve);
    assert!(!distributor.deliver(&peer.id, id, response));
    assert_eq!(distributor.pending_requests(), 0);
}

#[tokio::test]
async fn test_timed_out_requests_expire_as_new_ones_time_out() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        request_timeout: Duration::from_millis(10),
        late_response_window: Duration::from_millis(15),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let peer = MockPeer::new(1, &distributor, &store, Behavior::Silent);
    distributor.register_peer(peer.clone());

    for _ in 0..4 {
        assert!(distributor
            .distribute(FetchRequest::new(items.clone()), Capability::ContractCode)
            .await
            .is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    // Only the last timeout is still inside its window
    assert_eq!(peer.requests(), 4);
    assert_eq!(distributor.timed_out_requests(), 1);
}

#[tokio::test]
async fn test_unregister_fails_outstanding_request() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        request_timeout: Duration::from_secs(10),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let stuck = MockPeer::new(1, &distributor, &store, Behavior::Silent);
    let good = MockPeer::new(2, &distributor, &store, Behavior::Serve);
    distributor.register_peer(stuck.clone());
    distributor.register_peer(good.clone());

    let task = {
        let distributor = distributor.clone();
        tokio::spawn(async move {
            distributor
                .distribute(FetchRequest::new(items), Capability::ContractCode)
                .await
        })
    };
    while stuck.requests() == 0 && good.requests() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(distributor.unregister_peer(&stuck.id));
    assert!(!distributor.unregister_peer(&stuck.id));

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("retry should not wait for the request timeout")
        .unwrap();
    assert_eq!(result.unwrap().len(), 1);
    assert_eq!(distributor.peer_count(), 1);
}

#[tokio::test]
async fn test_close_cancels_outstanding() {
    let distributor = Arc::new(RequestDistributor::new(DistributorConfig {
        request_timeout: Duration::from_secs(10),
        ..config()
    }));
    let store = Arc::new(MemoryStore::new());
    let items = blobs(&store, 1);
    let peer = MockPeer::new(1, &distributor, &store, Behavior::Silent);
    distributor.register_peer(peer.clone());

    let task = {
        let distributor = distributor.clone();
        tokio::spawn(async move {
            distributor
                .distribute(FetchRequest::new(items), Capability::ContractCode)
                .await
        })
    };
    while peer.requests() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    distributor.close();
    distributor.close();
    assert_eq!(task.await.unwrap(), Err(DistributeError::Closed));
    assert!(distributor.is_closed());
    assert_eq!(distributor.peer_count(), 0);
    assert!(!distributor.register_peer(peer));
}
