//! Request distributor
//!
//! Maps fetch requests onto the registered peer set:
//! - only peers advertising the needed capability and a recent enough
//!   protocol version are eligible
//! - each peer carries at most `max_in_flight_per_peer` requests at a time
//! - peers outside their failure cooldown are preferred, then peers whose
//!   score has not dropped below the initial score, then the lowest smoothed
//!   round-trip time, then the higher score; ties rotate round-robin
//! - every attempt waits up to `request_timeout` for a correlated response
//! - timeouts, send errors, disconnects and invalid responses penalize the
//!   peer and move the unresolved items to a peer not yet tried
//!
//! The peer table and the pending-request table each sit behind their own
//! mutex; neither lock is held across an await point.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lightcore_storage::{keccak256, short_hex, Hash};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::expiry::ExpiringSet;
use crate::peer::{
    Capability, FetchItem, FetchRequest, FetchResponse, ItemResponse, Peer, PeerCapabilities,
    PeerId, RequestId,
};
use crate::reputation::{PeerStats, ReputationPolicy};
use crate::{DistributeError, PeerError};

/// Distributor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributorConfig {
    /// How long an attempt waits for its response
    pub request_timeout: Duration,
    /// Distinct peers tried per request
    pub max_attempts: u32,
    /// Concurrent requests per peer
    pub max_in_flight_per_peer: usize,
    /// How long to wait for a free peer slot
    pub peer_wait: Duration,
    /// Lowest protocol version accepted
    pub min_protocol_version: u32,
    /// How long timed-out request ids are remembered
    pub late_response_window: Duration,
    /// Peer scoring and cooldown
    pub reputation: ReputationPolicy,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_attempts: 5,
            max_in_flight_per_peer: 4,
            peer_wait: Duration::from_secs(2),
            min_protocol_version: 1,
            late_response_window: Duration::from_secs(30),
            reputation: ReputationPolicy::default(),
        }
    }
}

struct PeerEntry {
    id: PeerId,
    peer: Arc<dyn Peer>,
    capabilities: PeerCapabilities,
    stats: PeerStats,
    /// Registration order, used for round-robin tie breaks
    order: u64,
}

impl PeerEntry {
    /// Eligibility regardless of load
    fn serves(&self, capability: Capability, min_protocol_version: u32) -> bool {
        self.capabilities.protocol_version >= min_protocol_version
            && self.capabilities.serves(capability)
    }
}

struct PendingRequest {
    peer: PeerId,
    tx: oneshot::Sender<FetchResponse>,
}

enum Reservation {
    Peer(Arc<dyn Peer>),
    /// Untried peers exist but none has a free slot
    Busy,
    /// Every eligible peer was tried
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("send failed: {0}")]
    Send(PeerError),
    #[error("timed out")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("invalid response: {0}")]
    Invalid(String),
    #[error("distributor closed")]
    Closed,
}

struct Validated {
    found: Vec<(Hash, Bytes)>,
    not_found: Vec<FetchItem>,
    bytes: u64,
}

/// Distributes fetch requests over registered peers with retry
pub struct RequestDistributor {
    config: DistributorConfig,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    timed_out: Mutex<ExpiringSet<RequestId>>,
    next_id: AtomicU64,
    next_order: AtomicU64,
    rotation: AtomicU64,
    slot_freed: Notify,
    closed: CancellationToken,
}

impl std::fmt::Debug for RequestDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDistributor")
            .field("peers", &self.peer_count())
            .field("pending", &self.pending_requests())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RequestDistributor {
    /// Create a distributor with no peers
    pub fn new(config: DistributorConfig) -> Self {
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            timed_out: Mutex::new(ExpiringSet::new()),
            next_id: AtomicU64::new(1),
            next_order: AtomicU64::new(0),
            rotation: AtomicU64::new(0),
            slot_freed: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Distributor configuration
    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Add a connected peer. Returns false if it is already registered or
    /// the distributor is closed.
    pub fn register_peer(&self, peer: Arc<dyn Peer>) -> bool {
        if self.is_closed() {
            return false;
        }
        let id = peer.id();
        let capabilities = peer.capabilities();
        {
            let mut peers = self.peers.lock();
            if peers.contains_key(&id) {
                return false;
            }
            info!(
                peer = %short_hex(&id),
                version = capabilities.protocol_version,
                head = capabilities.head_number,
                "registered peer"
            );
            peers.insert(
                id,
                PeerEntry {
                    id,
                    peer,
                    capabilities,
                    stats: PeerStats::new(&self.config.reputation),
                    order: self.next_order.fetch_add(1, Ordering::Relaxed),
                },
            );
        }
        self.slot_freed.notify_waiters();
        true
    }

    /// Remove a peer. Its outstanding requests fail and are retried elsewhere.
    pub fn unregister_peer(&self, id: &PeerId) -> bool {
        if self.peers.lock().remove(id).is_none() {
            return false;
        }
        // Dropping the senders wakes the waiting attempts
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.peer != *id);
        info!(
            peer = %short_hex(id),
            outstanding = before - pending.len(),
            "unregistered peer"
        );
        true
    }

    /// Number of registered peers
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Reputation record of a peer
    pub fn peer_stats(&self, id: &PeerId) -> Option<PeerStats> {
        self.peers.lock().get(id).map(|e| e.stats.clone())
    }

    /// Reputation records of all peers, in registration order
    pub fn all_peer_stats(&self) -> Vec<(PeerId, PeerStats)> {
        let peers = self.peers.lock();
        let mut stats: Vec<_> = peers.values().map(|e| (e.order, e.id, e.stats.clone())).collect();
        stats.sort_by_key(|(order, _, _)| *order);
        stats.into_iter().map(|(_, id, s)| (id, s)).collect()
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of timed-out requests remembered for late responses
    pub fn timed_out_requests(&self) -> usize {
        self.timed_out.lock().len()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Fetch every item of `request` from peers serving `capability`.
    ///
    /// Items are retried on other peers until all are resolved, the attempt
    /// bound is reached, or no untried eligible peer is left.
    pub async fn distribute(
        &self,
        request: FetchRequest,
        capability: Capability,
    ) -> Result<Vec<(Hash, Bytes)>, DistributeError> {
        let mut unresolved = request.items;
        let mut delivered = Vec::with_capacity(unresolved.len());
        let mut tried = HashSet::new();
        let mut attempts = 0u32;

        while !unresolved.is_empty() && attempts < self.config.max_attempts {
            let Some(peer) = self.reserve_peer(capability, &tried).await? else {
                break;
            };
            let peer_id = peer.id();
            tried.insert(peer_id);
            attempts += 1;

            let batch = FetchRequest::new(unresolved.clone());
            match self.attempt(&peer, &batch).await {
                Ok(validated) => {
                    if !validated.not_found.is_empty() {
                        debug!(
                            peer = %short_hex(&peer_id),
                            missing = validated.not_found.len(),
                            "peer lacks some items"
                        );
                    }
                    delivered.extend(validated.found);
                    unresolved = validated.not_found;
                }
                Err(AttemptError::Closed) => return Err(DistributeError::Closed),
                Err(error) => {
                    debug!(peer = %short_hex(&peer_id), attempt = attempts, %error, "fetch attempt failed");
                }
            }
        }

        if unresolved.is_empty() {
            return Ok(delivered);
        }
        if self.is_closed() {
            return Err(DistributeError::Closed);
        }
        warn!(
            unresolved = unresolved.len(),
            attempts,
            capability = %capability,
            "no peer could serve request"
        );
        Err(DistributeError::NoPeerAvailable {
            delivered,
            unresolved: unresolved.iter().map(|item| item.hash).collect(),
            attempts,
        })
    }

    /// Hand a response from `peer` to the request it answers. Returns false
    /// for late, unsolicited or misattributed responses, which are dropped.
    pub fn deliver(&self, peer: &PeerId, id: RequestId, response: FetchResponse) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(&id).map(|p| p.peer) {
                Some(owner) if owner == *peer => pending.remove(&id),
                Some(_) => {
                    warn!(peer = %short_hex(peer), request_id = id, "response from wrong peer");
                    return false;
                }
                None => None,
            }
        };

        match entry {
            Some(entry) => entry.tx.send(response).is_ok(),
            None => {
                let mut timed_out = self.timed_out.lock();
                timed_out.expire_before(Instant::now());
                if timed_out.remove(&id) {
                    debug!(peer = %short_hex(peer), request_id = id, "discarding late response");
                } else {
                    debug!(peer = %short_hex(peer), request_id = id, "discarding unsolicited response");
                }
                false
            }
        }
    }

    /// Cancel every outstanding distribution and forget all peers. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let peers = std::mem::take(&mut *self.peers.lock());
        let pending = std::mem::take(&mut *self.pending.lock());
        self.slot_freed.notify_waiters();
        info!(
            peers = peers.len(),
            pending = pending.len(),
            "request distributor closed"
        );
    }

    async fn reserve_peer(
        &self,
        capability: Capability,
        tried: &HashSet<PeerId>,
    ) -> Result<Option<Arc<dyn Peer>>, DistributeError> {
        let deadline = tokio::time::Instant::now() + self.config.peer_wait;
        loop {
            if self.is_closed() {
                return Err(DistributeError::Closed);
            }
            // Registered before checking so a release in between is not missed
            let slot_freed = self.slot_freed.notified();
            match self.try_reserve(capability, tried) {
                Reservation::Peer(peer) => return Ok(Some(peer)),
                Reservation::Exhausted => return Ok(None),
                Reservation::Busy => {}
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Err(DistributeError::Closed),
                _ = slot_freed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(capability = %capability, "no peer slot became free");
                    return Ok(None);
                }
            }
        }
    }

    fn try_reserve(&self, capability: Capability, tried: &HashSet<PeerId>) -> Reservation {
        let now = Instant::now();
        let cursor = self.rotation.fetch_add(1, Ordering::Relaxed);
        let max_in_flight = self.config.max_in_flight_per_peer;
        let reputation = &self.config.reputation;

        let mut peers = self.peers.lock();
        let mut untried = 0usize;
        let best = peers
            .values_mut()
            .filter(|e| e.serves(capability, self.config.min_protocol_version) && !tried.contains(&e.id))
            .inspect(|_| untried += 1)
            .filter(|e| e.stats.has_capacity(max_in_flight))
            .min_by_key(|e| {
                (
                    e.stats.is_cooling_down(now),
                    e.stats.is_penalized(reputation),
                    e.stats.rtt.unwrap_or(Duration::ZERO),
                    Reverse(e.stats.score),
                    e.order.wrapping_sub(cursor),
                )
            });

        match best {
            Some(entry) => {
                entry.stats.in_flight += 1;
                trace!(peer = %short_hex(&entry.id), in_flight = entry.stats.in_flight, "reserved peer");
                Reservation::Peer(entry.peer.clone())
            }
            // With nothing tried yet, wait for a peer to register
            None if untried > 0 || tried.is_empty() => Reservation::Busy,
            None => Reservation::Exhausted,
        }
    }

    async fn attempt(
        &self,
        peer: &Arc<dyn Peer>,
        request: &FetchRequest,
    ) -> Result<Validated, AttemptError> {
        let peer_id = peer.id();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(id, PendingRequest { peer: peer_id, tx });
        let _slot = SlotGuard {
            distributor: self,
            peer: peer_id,
            id,
        };

        trace!(peer = %short_hex(&peer_id), request_id = id, items = request.items.len(), "sending request");
        let started = Instant::now();
        let result = match peer.send(id, request) {
            Err(e) => Err(AttemptError::Send(e)),
            Ok(()) => tokio::select! {
                _ = self.closed.cancelled() => Err(AttemptError::Closed),
                received = tokio::time::timeout(self.config.request_timeout, rx) => match received {
                    Ok(Ok(response)) => validate(request, response),
                    Ok(Err(_)) if self.is_closed() => Err(AttemptError::Closed),
                    Ok(Err(_)) => Err(AttemptError::Disconnected),
                    Err(_) => {
                        let now = Instant::now();
                        let mut timed_out = self.timed_out.lock();
                        timed_out.expire_before(now);
                        timed_out.add(id, now + self.config.late_response_window);
                        Err(AttemptError::Timeout)
                    }
                },
            },
        };

        let mut peers = self.peers.lock();
        if let Some(entry) = peers.get_mut(&peer_id) {
            match &result {
                Ok(validated) => {
                    entry
                        .stats
                        .record_success(started.elapsed(), validated.bytes, &self.config.reputation)
                }
                Err(AttemptError::Closed) => {}
                Err(AttemptError::Invalid(reason)) => {
                    warn!(peer = %short_hex(&peer_id), %reason, "peer sent invalid response");
                    entry.stats.record_failure(Instant::now(), &self.config.reputation);
                }
                Err(_) => entry.stats.record_failure(Instant::now(), &self.config.reputation),
            }
        }
        drop(peers);
        result
    }
}

/// Releases the peer slot and the pending entry of an attempt, however it ends
struct SlotGuard<'a> {
    distributor: &'a RequestDistributor,
    peer: PeerId,
    id: RequestId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.distributor.pending.lock().remove(&self.id);
        if let Some(entry) = self.distributor.peers.lock().get_mut(&self.peer) {
            entry.stats.in_flight = entry.stats.in_flight.saturating_sub(1);
        }
        self.distributor.slot_freed.notify_waiters();
    }
}

/// Check a response against the request it answers
fn validate(request: &FetchRequest, response: FetchResponse) -> Result<Validated, AttemptError> {
    if response.items.len() != request.items.len() {
        return Err(AttemptError::Invalid(format!(
            "expected {} items, got {}",
            request.items.len(),
            response.items.len()
        )));
    }

    let mut validated = Validated {
        found: Vec::new(),
        not_found: Vec::new(),
        bytes: 0,
    };
    for (item, answer) in request.items.iter().zip(response.items) {
        match answer {
            ItemResponse::Found(data) => {
                if keccak256(&data) != item.hash {
                    return Err(AttemptError::Invalid(format!(
                        "content mismatch for {}",
                        short_hex(&item.hash)
                    )));
                }
                validated.bytes += data.len() as u64;
                validated.found.push((item.hash, data));
            }
            ItemResponse::NotFound => validated.not_found.push(*item),
        }
    }
    Ok(validated)
}
