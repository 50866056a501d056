//! On-demand retrieval
//!
//! [`LightOdr`] answers point queries against state the client does not hold
//! in full. A query first walks the local store; when the walk hits a node
//! that is not stored, the remaining key path is registered with the trie
//! scheduler and the caller waits until that part of the trie is committed.
//! Callers sharing a node wait on it together, but a node that cannot be
//! fetched fails only the callers whose paths run through it.
//!
//! The scheduler and the table of waiting callers live on the consumer thread
//! of an [`ExecQueue`]. Every change to them is a task on that queue:
//! - callers register paths and waiters
//! - fetch tasks hand back delivered content and failures
//! - canceled callers remove their waiter
//!
//! After each task the coordinator drains the scheduler's frontier into fetch
//! batches, split by kind, and runs them on the tokio runtime through the
//! [`RequestDistributor`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lightcore_p2p::{
    Capability, DistributeError, FetchItem, FetchRequest, ItemKind, RequestDistributor,
};
use lightcore_state_sync::{
    AccountLeafDecoder, RequestKind, SyncBloom, SyncError, SyncEvent, TrieSync, DEFAULT_BLOOM_BITS,
    MAX_SYNC_DEPTH,
};
use lightcore_storage::state::{account_key, storage_key, Address};
use lightcore_storage::{
    is_empty_reference, lookup, short_hex, Account, Hash, Lookup, Nibbles, NodeStore, EMPTY_HASH,
    EMPTY_ROOT,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{OdrError, Result};
use crate::queue::{ExecQueue, Task};

/// Retrieval coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OdrConfig {
    /// Execution queue capacity
    pub queue_capacity: usize,
    /// Requests per fetch batch
    pub batch_size: usize,
    /// Fetch batches in flight at once
    pub max_concurrent_fetches: usize,
    /// Fetch rounds per lookup before giving up
    pub max_lookup_rounds: u32,
    /// Backoff between attempts to hand results to a full queue
    pub enqueue_retry: Duration,
    /// Size of the committed-hash filter in bits
    pub bloom_bits: usize,
    /// Cap on the recorded depth of scheduler requests
    pub max_sync_depth: u32,
}

impl Default for OdrConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            batch_size: 64,
            max_concurrent_fetches: 8,
            max_lookup_rounds: 4,
            enqueue_retry: Duration::from_millis(5),
            bloom_bits: DEFAULT_BLOOM_BITS,
            max_sync_depth: MAX_SYNC_DEPTH,
        }
    }
}

/// Snapshot of the coordinator's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OdrStatus {
    /// Unresolved scheduler requests
    pub pending_requests: usize,
    /// Hashes with at least one waiting caller
    pub waited_hashes: usize,
    /// Callers waiting
    pub waiters: usize,
    /// Fetch batches in flight
    pub active_fetches: usize,
}

// ============================================================================
// Queue State
// ============================================================================

struct Waiter {
    id: u64,
    /// Key path below the waited hash, for lookups
    path: Option<Nibbles>,
    tx: oneshot::Sender<Result<()>>,
}

/// State owned by the execution queue consumer
struct OdrState<S: NodeStore> {
    sync: TrieSync<S>,
    waiters: HashMap<Hash, Vec<Waiter>>,
    fetches: usize,
}

#[derive(Default)]
struct FetchOutcome {
    delivered: Vec<(Hash, Bytes)>,
    failed: Vec<(Hash, SyncError)>,
}

impl FetchOutcome {
    fn merge(mut self, other: FetchOutcome) -> Self {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
        self
    }
}

impl<S: NodeStore> OdrState<S> {
    /// Apply a registration and attach `waiter` to `hash` if it is still pending
    fn register<F>(&mut self, ctx: &Dispatch<S>, hash: Hash, waiter: Waiter, add: F)
    where
        F: FnOnce(&mut TrieSync<S>) -> std::result::Result<(), SyncError>,
    {
        match add(&mut self.sync) {
            Ok(()) if self.sync.is_pending(&hash) => {
                self.waiters.entry(hash).or_default().push(waiter);
            }
            Ok(()) => {
                let _ = waiter.tx.send(Ok(()));
            }
            Err(error) => {
                debug!(hash = %short_hex(&hash), %error, "registration failed");
                let _ = waiter.tx.send(Err(error.into()));
            }
        }
        self.settle();
        self.pump(ctx);
    }

    /// Apply the result of a fetch batch
    fn complete(&mut self, ctx: &Dispatch<S>, outcome: FetchOutcome) {
        self.fetches = self.fetches.saturating_sub(1);

        for (hash, data) in outcome.delivered {
            match self.sync.process(hash, data) {
                Ok(()) => {}
                Err(SyncError::NotRequested { .. }) | Err(SyncError::AlreadyProcessed { .. }) => {
                    trace!(hash = %short_hex(&hash), "dropping response for resolved request");
                }
                Err(error) => {
                    debug!(hash = %short_hex(&hash), %error, "failed to process response");
                }
            }
        }
        for (hash, error) in outcome.failed {
            self.sync.fail(hash, error);
        }

        self.settle();
        self.pump(ctx);
    }

    /// Remove one waiter; a hash nobody waits for any more is abandoned
    fn cancel(&mut self, hash: Hash, id: u64) {
        let Some(waiters) = self.waiters.get_mut(&hash) else {
            return;
        };
        waiters.retain(|w| w.id != id);
        if waiters.is_empty() {
            self.waiters.remove(&hash);
            if self.sync.abandon(hash) {
                debug!(hash = %short_hex(&hash), "abandoned request without waiters");
            }
        }
    }

    fn status(&self) -> OdrStatus {
        OdrStatus {
            pending_requests: self.sync.pending(),
            waited_hashes: self.waiters.len(),
            waiters: self.waiters.values().map(Vec::len).sum(),
            active_fetches: self.fetches,
        }
    }

    /// Resolve waiters from scheduler events
    fn settle(&mut self) {
        for event in self.sync.drain_events() {
            match event {
                SyncEvent::Committed(hash) => self.resolve(hash, Ok(())),
                SyncEvent::Failed { hash, error } => self.resolve(hash, Err(OdrError::from(error))),
                SyncEvent::PathsFailed { hash, paths, error } => {
                    self.fail_paths(hash, &paths, OdrError::from(error))
                }
            }
        }
    }

    fn resolve(&mut self, hash: Hash, result: Result<()>) {
        if let Some(waiters) = self.waiters.remove(&hash) {
            trace!(
                hash = %short_hex(&hash),
                waiters = waiters.len(),
                ok = result.is_ok(),
                "resolving waiters"
            );
            for waiter in waiters {
                let _ = waiter.tx.send(result.clone());
            }
        }
    }

    /// Fail the waiters on `hash` whose path was dropped. The others keep
    /// waiting for the commit.
    fn fail_paths(&mut self, hash: Hash, paths: &BTreeSet<Nibbles>, error: OdrError) {
        let Some(waiters) = self.waiters.get_mut(&hash) else {
            return;
        };
        let (failed, kept): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(waiters)
            .into_iter()
            .partition(|w| w.path.as_ref().is_some_and(|p| paths.contains(p)));
        *waiters = kept;
        if waiters.is_empty() {
            self.waiters.remove(&hash);
            self.sync.abandon(hash);
        }

        trace!(
            hash = %short_hex(&hash),
            failed = failed.len(),
            "failing waiters on dropped paths"
        );
        for waiter in failed {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }

    /// Turn the ready frontier into fetch batches
    fn pump(&mut self, ctx: &Dispatch<S>) {
        while self.fetches < ctx.config.max_concurrent_fetches {
            let batch = self.sync.missing(ctx.config.batch_size);
            if batch.is_empty() {
                break;
            }
            self.fetches += 1;

            let (nodes, codes): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(|r| r.kind == RequestKind::Node);
            let nodes: Vec<Hash> = nodes.into_iter().map(|r| r.hash).collect();
            let codes: Vec<Hash> = codes.into_iter().map(|r| r.hash).collect();
            debug!(
                nodes = nodes.len(),
                codes = codes.len(),
                active = self.fetches,
                "dispatching fetch batch"
            );

            let task_ctx = ctx.clone();
            ctx.runtime.spawn(async move {
                let distributor = &task_ctx.distributor;
                let (nodes, codes) = tokio::join!(
                    fetch_batch(distributor, nodes, ItemKind::Node, Capability::StateNodes),
                    fetch_batch(distributor, codes, ItemKind::Code, Capability::ContractCode),
                );
                let outcome = nodes.merge(codes);
                task_ctx
                    .deliver(move |state, ctx| state.complete(ctx, outcome))
                    .await;
            });
        }
    }
}

async fn fetch_batch(
    distributor: &RequestDistributor,
    hashes: Vec<Hash>,
    kind: ItemKind,
    capability: Capability,
) -> FetchOutcome {
    if hashes.is_empty() {
        return FetchOutcome::default();
    }
    let request = FetchRequest::new(hashes.iter().map(|&hash| FetchItem { hash, kind }).collect());

    match distributor.distribute(request, capability).await {
        Ok(delivered) => FetchOutcome {
            delivered,
            failed: Vec::new(),
        },
        Err(DistributeError::NoPeerAvailable {
            delivered,
            unresolved,
            attempts,
        }) => FetchOutcome {
            delivered,
            failed: unresolved
                .into_iter()
                .map(|hash| (hash, SyncError::NoPeerAvailable { hash, attempts }))
                .collect(),
        },
        Err(DistributeError::Closed) => {
            warn!(items = hashes.len(), "request distributor closed during fetch");
            FetchOutcome {
                delivered: Vec::new(),
                failed: hashes
                    .into_iter()
                    .map(|hash| (hash, SyncError::NoPeerAvailable { hash, attempts: 0 }))
                    .collect(),
            }
        }
    }
}

// ============================================================================
// Dispatch Context
// ============================================================================

/// Everything a task needs to reach the queue, the network and the runtime
struct Dispatch<S: NodeStore> {
    queue: ExecQueue<OdrState<S>>,
    distributor: Arc<RequestDistributor>,
    runtime: Handle,
    config: Arc<OdrConfig>,
}

impl<S: NodeStore> Clone for Dispatch<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            distributor: self.distributor.clone(),
            runtime: self.runtime.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: NodeStore> Dispatch<S> {
    /// Queue a caller task, failing fast if the queue refuses it
    fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut OdrState<S>, &Dispatch<S>) + Send + 'static,
    {
        let ctx = self.clone();
        if self.queue.enqueue(move |state| task(state, &ctx)) {
            return Ok(());
        }
        if self.queue.is_closed() {
            Err(OdrError::Closed)
        } else {
            Err(OdrError::QueueSaturated)
        }
    }

    /// Queue an internal task, retrying until it is accepted or the queue closes
    async fn deliver<F>(&self, task: F)
    where
        F: FnOnce(&mut OdrState<S>, &Dispatch<S>) + Send + 'static,
    {
        let ctx = self.clone();
        let mut task: Task<OdrState<S>> = Box::new(move |state| task(state, &ctx));
        loop {
            match self.queue.try_enqueue(task) {
                Ok(()) => return,
                Err(_) if self.queue.is_closed() => return,
                Err(refused) => {
                    task = refused;
                    tokio::time::sleep(self.config.enqueue_retry).await;
                }
            }
        }
    }
}

// ============================================================================
// Retrieval Coordinator
// ============================================================================

/// On-demand retrieval of state from peers
pub struct LightOdr<S: NodeStore> {
    store: Arc<S>,
    ctx: Dispatch<S>,
    next_waiter: AtomicU64,
}

impl<S: NodeStore> std::fmt::Debug for LightOdr<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightOdr")
            .field("config", &self.ctx.config)
            .field("queue", &self.ctx.queue)
            .finish()
    }
}

impl<S: NodeStore> LightOdr<S> {
    /// Create a coordinator over `store`, fetching through `distributor`.
    ///
    /// Must be called from within a tokio runtime; fetches are spawned on it.
    pub fn new(
        config: OdrConfig,
        store: Arc<S>,
        distributor: Arc<RequestDistributor>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| OdrError::NoRuntime)?;
        let bloom = Arc::new(SyncBloom::new(config.bloom_bits));
        let state = OdrState {
            sync: TrieSync::new(store.clone(), bloom).with_max_depth(config.max_sync_depth),
            waiters: HashMap::new(),
            fetches: 0,
        };
        let queue = ExecQueue::with_state(config.queue_capacity, state)
            .map_err(|e| OdrError::Spawn(e.to_string()))?;

        info!(
            queue_capacity = config.queue_capacity,
            batch_size = config.batch_size,
            max_concurrent_fetches = config.max_concurrent_fetches,
            "retrieval coordinator started"
        );
        Ok(Self {
            store,
            ctx: Dispatch {
                queue,
                distributor,
                runtime,
                config: Arc::new(config),
            },
            next_waiter: AtomicU64::new(0),
        })
    }

    /// Coordinator configuration
    pub fn config(&self) -> &OdrConfig {
        &self.ctx.config
    }

    /// Local store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Distributor used for fetches
    pub fn distributor(&self) -> &Arc<RequestDistributor> {
        &self.ctx.distributor
    }

    /// Value stored under `key` in the trie rooted at `root`, fetching
    /// whatever part of the key path is not held locally. `None` means the
    /// trie proves the key absent.
    pub async fn retrieve(
        &self,
        root: Hash,
        key: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        if root == EMPTY_ROOT {
            return Ok(None);
        }
        let path = Nibbles::from_bytes(key);

        for round in 0..self.ctx.config.max_lookup_rounds {
            let (hash, depth) = match lookup(self.store.as_ref(), root, key)? {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Absent => return Ok(None),
                Lookup::Missing { hash, depth } => (hash, depth),
            };
            trace!(
                root = %short_hex(&root),
                missing = %short_hex(&hash),
                depth,
                round,
                "key path incomplete"
            );
            let remaining = path.slice(depth);
            let waited = remaining.clone();
            self.wait_for(hash, Some(waited), cancel, move |sync| {
                sync.add_nibble_path(hash, remaining)
            })
            .await?;
        }

        match lookup(self.store.as_ref(), root, key)? {
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::Absent => Ok(None),
            Lookup::Missing { hash, .. } => {
                warn!(root = %short_hex(&root), missing = %short_hex(&hash), "key path still incomplete");
                Err(OdrError::RetrievalFailed {
                    hash,
                    reason: format!(
                        "still missing after {} lookup rounds",
                        self.ctx.config.max_lookup_rounds
                    ),
                })
            }
        }
    }

    /// Account stored for `address` in the state trie rooted at `state_root`
    pub async fn retrieve_account(
        &self,
        state_root: Hash,
        address: &Address,
        cancel: &CancellationToken,
    ) -> Result<Option<Account>> {
        let key = account_key(address);
        match self.retrieve(state_root, &key, cancel).await? {
            Some(data) => Account::decode(&data)
                .map(Some)
                .map_err(|e| OdrError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Value of storage `slot` in the storage trie rooted at `storage_root`
    pub async fn retrieve_storage(
        &self,
        storage_root: Hash,
        slot: &Hash,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        self.retrieve(storage_root, &storage_key(slot), cancel).await
    }

    /// Contract code with hash `code_hash`
    pub async fn retrieve_code(&self, code_hash: Hash, cancel: &CancellationToken) -> Result<Bytes> {
        if code_hash == EMPTY_HASH {
            return Ok(Bytes::new());
        }
        for _ in 0..self.ctx.config.max_lookup_rounds {
            if let Some(code) = self.store.get(&code_hash)? {
                return Ok(code);
            }
            self.wait_for(code_hash, None, cancel, move |sync| {
                sync.add_raw_entry(code_hash, 0, None)
            })
            .await?;
        }
        self.store
            .get(&code_hash)?
            .ok_or_else(|| OdrError::RetrievalFailed {
                hash: code_hash,
                reason: "code missing after commit".to_string(),
            })
    }

    /// Synchronize the whole state below `root`, including every storage
    /// trie and contract code it references
    pub async fn sync_state(&self, root: Hash, cancel: &CancellationToken) -> Result<()> {
        if is_empty_reference(&root) {
            return Ok(());
        }
        info!(root = %short_hex(&root), "starting state sync");
        self.wait_for(root, None, cancel, move |sync| {
            sync.add_sub_trie(root, 0, None, Some(Arc::new(AccountLeafDecoder)))
        })
        .await?;
        info!(root = %short_hex(&root), "state sync complete");
        Ok(())
    }

    /// Number of unresolved scheduler requests
    pub async fn pending(&self) -> Result<usize> {
        Ok(self.status().await?.pending_requests)
    }

    /// Progress snapshot, read on the queue
    pub async fn status(&self) -> Result<OdrStatus> {
        let (tx, rx) = oneshot::channel();
        self.ctx.submit(move |state, _| {
            let _ = tx.send(state.status());
        })?;
        rx.await.map_err(|_| OdrError::Closed)
    }

    /// Stop the coordinator. Every waiting caller receives `Closed`.
    pub async fn close(&self) {
        let queue = self.ctx.queue.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || queue.close()).await {
            warn!(error = %e, "execution queue shutdown failed");
        }
        info!("retrieval coordinator closed");
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.ctx.queue.is_closed()
    }

    /// Register a request through `add` and wait until `hash` resolves, or
    /// until `path` below it is dropped
    async fn wait_for<F>(
        &self,
        hash: Hash,
        path: Option<Nibbles>,
        cancel: &CancellationToken,
        add: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut TrieSync<S>) -> std::result::Result<(), SyncError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(OdrError::Canceled);
        }
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.ctx
            .submit(move |state, ctx| state.register(ctx, hash, Waiter { id, path, tx }, add))?;

        tokio::select! {
            result = rx => result.unwrap_or(Err(OdrError::Closed)),
            _ = cancel.cancelled() => {
                debug!(hash = %short_hex(&hash), "retrieval canceled");
                let ctx = self.ctx.clone();
                self.ctx.runtime.spawn(async move {
                    ctx.deliver(move |state, _| state.cancel(hash, id)).await;
                });
                Err(OdrError::Canceled)
            }
        }
    }
}

impl<S: NodeStore> Drop for LightOdr<S> {
    fn drop(&mut self) {
        self.ctx.queue.begin_close();
    }
}
