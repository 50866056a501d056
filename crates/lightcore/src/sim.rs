//! Simulated serving network
//!
//! `lightcore simulate` runs the light client against in-process peers that
//! answer from a full copy of a generated state. Each peer delays its answer
//! by a base latency plus random jitter, and may drop a request or corrupt
//! one item of the answer with configurable probability.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytes::Bytes;
use lightcore_config::{Config, SimulationConfig};
use lightcore_light_client::{OdrError, OdrStatus};
use lightcore_p2p::{
    FetchRequest, FetchResponse, ItemResponse, Peer, PeerCapabilities, PeerError, PeerId,
    PeerStats, RequestDistributor, RequestId,
};
use lightcore_storage::state::{account_key, storage_key, Address};
use lightcore_storage::{keccak256, short_hex, Account, Hash, MemoryStore, MerkleTrie, NodeStore};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::LightNode;

/// Protocol version announced by simulated peers
const SIM_PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Simulated Peer
// ============================================================================

/// Counters kept by a [`SimulatedPeer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounters {
    /// Requests answered
    pub served: u64,
    /// Requests never answered
    pub dropped: u64,
    /// Answers with one corrupted item
    pub corrupted: u64,
}

/// In-process peer answering from a server-side store
pub struct SimulatedPeer {
    id: PeerId,
    server: Arc<MemoryStore>,
    latency: Duration,
    jitter: Duration,
    drop_rate: f64,
    corruption_rate: f64,
    rng: Mutex<StdRng>,
    distributor: Weak<RequestDistributor>,
    served: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
}

impl SimulatedPeer {
    /// Create peer number `index` with the behavior described by `config`
    pub fn new(
        index: usize,
        server: Arc<MemoryStore>,
        config: &SimulationConfig,
        distributor: &Arc<RequestDistributor>,
    ) -> Self {
        Self {
            id: keccak256(&(index as u64).to_be_bytes()),
            server,
            latency: Duration::from_millis(config.latency_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            drop_rate: config.drop_rate,
            corruption_rate: config.corruption_rate,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed.wrapping_add(index as u64 + 1))),
            distributor: Arc::downgrade(distributor),
            served: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
        }
    }

    /// Counters so far
    pub fn counters(&self) -> PeerCounters {
        PeerCounters {
            served: self.served.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
        }
    }

    fn answer(&self, request: &FetchRequest) -> Result<FetchResponse, PeerError> {
        let items = request
            .items
            .iter()
            .map(|item| match self.server.get(&item.hash) {
                Ok(Some(data)) => Ok(ItemResponse::Found(data)),
                Ok(None) => Ok(ItemResponse::NotFound),
                Err(e) => Err(PeerError::Send(e.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FetchResponse { items })
    }
}

impl Peer for SimulatedPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn capabilities(&self) -> PeerCapabilities {
        PeerCapabilities::full(SIM_PROTOCOL_VERSION, 0)
    }

    fn send(&self, id: RequestId, request: &FetchRequest) -> Result<(), PeerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PeerError::Send(e.to_string()))?;

        let (drop, corrupt, delay) = {
            let mut rng = self.rng.lock();
            let jitter = if self.jitter.is_zero() {
                Duration::ZERO
            } else {
                self.jitter.mul_f64(rng.gen::<f64>())
            };
            (
                rng.gen_bool(self.drop_rate),
                rng.gen_bool(self.corruption_rate),
                self.latency + jitter,
            )
        };

        if drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %short_hex(&self.id), request = id, "dropping request");
            return Ok(());
        }

        let mut response = self.answer(request)?;
        if corrupt {
            if let Some(ItemResponse::Found(data)) = response
                .items
                .iter_mut()
                .find(|item| matches!(item, ItemResponse::Found(_)))
            {
                let mut bytes = data.to_vec();
                bytes.push(0xff);
                *data = Bytes::from(bytes);
                self.corrupted.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %short_hex(&self.id), request = id, "corrupting response");
            }
        }
        self.served.fetch_add(1, Ordering::Relaxed);

        let distributor = self.distributor.clone();
        let peer = self.id;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(distributor) = distributor.upgrade() {
                distributor.deliver(&peer, id, response);
            }
        });
        Ok(())
    }
}

// ============================================================================
// State Generation
// ============================================================================

/// State held in full by the simulated peers
pub struct GeneratedState {
    /// Store shared by every peer
    pub server: Arc<MemoryStore>,
    /// State root
    pub root: Hash,
    /// Addresses with an account
    pub addresses: Vec<Address>,
}

impl GeneratedState {
    /// Account of `address` as the peers hold it
    pub fn account(&self, address: &Address) -> Result<Option<Account>> {
        let trie = MerkleTrie::open(self.server.clone(), self.root);
        match trie.get(&account_key(address))? {
            Some(data) => Ok(Some(Account::decode(&data)?)),
            None => Ok(None),
        }
    }
}

/// Generate accounts, storage tries and code as described by `config`
pub fn generate_state(config: &SimulationConfig, rng: &mut StdRng) -> Result<GeneratedState> {
    let server = Arc::new(MemoryStore::new());
    let state = MerkleTrie::new(server.clone());
    let mut addresses = Vec::with_capacity(config.accounts as usize);

    for i in 0..config.accounts {
        let address: Address = rng.gen();
        let mut account = Account::with_balance(rng.gen_range(1..1_000_000_000_000u128));
        account.nonce = rng.gen_range(0..1_000);

        if i % config.contract_every == 0 {
            let storage = MerkleTrie::new(server.clone());
            for _ in 0..config.storage_slots {
                let slot: Hash = rng.gen();
                let value: [u8; 32] = rng.gen();
                storage.insert(&storage_key(&slot), &value)?;
            }
            account.storage_root = storage.root();

            let len = rng.gen_range(16..256);
            let code: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            account.code_hash = keccak256(&code);
            server.put(account.code_hash, Bytes::from(code))?;
        }

        state.insert(&account_key(&address), &account.encode())?;
        addresses.push(address);
    }

    info!(
        accounts = config.accounts,
        nodes = server.len(),
        root = %short_hex(&state.root()),
        "generated state"
    );
    Ok(GeneratedState {
        root: state.root(),
        server,
        addresses,
    })
}

// ============================================================================
// Simulation
// ============================================================================

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Lookups issued
    pub lookups: usize,
    /// Lookups that found an account
    pub found: usize,
    /// Lookups that proved the account absent
    pub absent: usize,
    /// Lookups that failed to retrieve
    pub failed: usize,
    /// Time spent on the lookups
    pub lookup_time: Duration,
    /// Time spent on the full state sync, if one ran
    pub sync_time: Option<Duration>,
    /// Nodes held by the client afterwards
    pub client_nodes: usize,
    /// Nodes held by the peers
    pub server_nodes: usize,
    /// Per-peer reputation and counters
    pub peers: Vec<(PeerId, PeerStats, PeerCounters)>,
    /// Coordinator progress at the end
    pub status: OdrStatus,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lookups: {}", self.lookups)?;
        writeln!(f, "  found:  {}", self.found)?;
        writeln!(f, "  absent: {}", self.absent)?;
        writeln!(f, "  failed: {}", self.failed)?;
        writeln!(f, "  time:   {:?}", self.lookup_time)?;
        match self.sync_time {
            Some(elapsed) => writeln!(f, "State sync: complete in {:?}", elapsed)?,
            None => writeln!(f, "State sync: not completed")?,
        }
        writeln!(f, "Nodes: client {} / server {}", self.client_nodes, self.server_nodes)?;
        writeln!(
            f,
            "Coordinator: {} pending, {} waiters, {} fetches",
            self.status.pending_requests, self.status.waiters, self.status.active_fetches
        )?;
        writeln!(f, "Peers:")?;
        for (id, stats, counters) in &self.peers {
            let rtt = stats
                .rtt
                .map(|rtt| format!("{:?}", rtt))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "  {}  score {:>3}  ok {:>4}  failed {:>3}  rate {:>3.0}%  rtt {:>10}  served {:>4}  dropped {:>3}  corrupted {:>3}",
                short_hex(id),
                stats.score,
                stats.successes,
                stats.failures,
                stats.success_rate() * 100.0,
                rtt,
                counters.served,
                counters.dropped,
                counters.corrupted
            )?;
        }
        Ok(())
    }
}

/// Run the simulation described by `config.simulation`
pub async fn run(config: &Config, cancel: CancellationToken) -> Result<SimulationReport> {
    let sim = &config.simulation;
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let state = generate_state(sim, &mut rng)?;

    let store = Arc::new(MemoryStore::new());
    let node = LightNode::new(config, store.clone())?;
    let peers: Vec<Arc<SimulatedPeer>> = (0..sim.peers)
        .map(|i| Arc::new(SimulatedPeer::new(i, state.server.clone(), sim, node.distributor())))
        .collect();
    for peer in &peers {
        node.add_peer(peer.clone());
    }

    // One in eight lookups asks for an address that has no account
    let mut targets = Vec::with_capacity(sim.lookups);
    for _ in 0..sim.lookups {
        if state.addresses.is_empty() || rng.gen_ratio(1, 8) {
            targets.push(rng.gen::<Address>());
        } else {
            targets.push(state.addresses[rng.gen_range(0..state.addresses.len())]);
        }
    }

    info!(lookups = targets.len(), peers = peers.len(), "starting lookups");
    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for address in targets.iter().copied() {
        let odr = node.odr().clone();
        let cancel = cancel.clone();
        let root = state.root;
        tasks.spawn(async move {
            let result = odr.retrieve_account(root, &address, &cancel).await;
            (address, result)
        });
    }

    let (mut found, mut absent, mut failed) = (0, 0, 0);
    while let Some(joined) = tasks.join_next().await {
        let (address, result) = joined?;
        match result {
            Ok(account) => {
                if account != state.account(&address)? {
                    bail!("retrieved account differs from served state");
                }
                if account.is_some() {
                    found += 1;
                } else {
                    absent += 1;
                }
            }
            Err(OdrError::Canceled) => bail!("simulation canceled"),
            Err(e) => {
                warn!(error = %e, "lookup failed");
                failed += 1;
            }
        }
    }
    let lookup_time = started.elapsed();
    info!(found, absent, failed, elapsed_ms = lookup_time.as_millis() as u64, "lookups finished");

    let sync_time = if sim.full_sync {
        let started = Instant::now();
        match node.odr().sync_state(state.root, &cancel).await {
            Ok(()) => Some(started.elapsed()),
            Err(OdrError::Canceled) => bail!("simulation canceled"),
            Err(e) => {
                warn!(error = %e, "state sync failed");
                None
            }
        }
    } else {
        None
    };

    let status = node.status().await?;
    let mut peer_reports = Vec::with_capacity(peers.len());
    for (id, stats) in node.peer_stats() {
        let counters = peers
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.counters())
            .unwrap_or_default();
        peer_reports.push((id, stats, counters));
    }
    node.shutdown().await;

    Ok(SimulationReport {
        lookups: targets.len(),
        found,
        absent,
        failed,
        lookup_time,
        sync_time,
        client_nodes: store.len(),
        server_nodes: state.server.len(),
        peers: peer_reports,
        status,
    })
}
