//! Trie synchronization scheduler
//!
//! [`TrieSync`] tracks the frontier of content-addressed nodes that are needed
//! to complete one or more tries and are not yet in the local store:
//! - a hash referenced by many parents is requested once and fanned out
//! - fetched nodes are verified against their hash before anything else
//! - children are discovered from fetched nodes through a worklist, never recursion
//! - leaf values are handed to a [`LeafDecoder`], whose nested references
//!   (storage roots, code hashes) become further requests
//! - a node is written to the store only after everything below it is written,
//!   so a stored node always implies a stored subtree for the part that was requested
//! - a failed node fails only the paths that route through it; a node synced
//!   in full fails with any of its children
//!
//! The scheduler is a plain single-owner state machine; callers serialize
//! access to it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use lightcore_storage::{is_empty_reference, keccak256, short_hex, Hash, Nibbles, NodeStore, TrieNode};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bloom::SyncBloom;

/// Upper bound on the recorded request depth
pub const MAX_SYNC_DEPTH: u32 = 128;

/// What a request fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// A trie node
    Node,
    /// An opaque blob such as contract code
    RawEntry,
}

/// An outstanding fetch handed out by [`TrieSync::missing`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Content hash to fetch
    pub hash: Hash,
    /// Requests that referenced this hash
    pub parents: Vec<Hash>,
    /// Distance from the nearest registered root
    pub depth: u32,
    /// Node or raw entry
    pub kind: RequestKind,
}

/// Which part of a node's subtree a request covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// The whole subtree
    Full,
    /// Only the nodes along these nibble paths, relative to the node
    Paths(BTreeSet<Nibbles>),
}

impl Expansion {
    /// Expansion along a single key
    pub fn path(key: &[u8]) -> Self {
        Expansion::Paths(BTreeSet::from([Nibbles::from_bytes(key)]))
    }

    /// Merge `other` into `self`, returning the part that was not yet covered
    fn merge(&mut self, other: Expansion) -> Option<Expansion> {
        let Expansion::Paths(mine) = self else {
            return None;
        };
        match other {
            Expansion::Full => {
                *self = Expansion::Full;
                Some(Expansion::Full)
            }
            Expansion::Paths(theirs) => {
                let added: BTreeSet<Nibbles> =
                    theirs.into_iter().filter(|p| !mine.contains(p)).collect();
                if added.is_empty() {
                    return None;
                }
                mine.extend(added.iter().cloned());
                Some(Expansion::Paths(added))
            }
        }
    }
}

/// A reference discovered inside a leaf value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NestedRef {
    /// Root of a nested trie to synchronize in full
    SubTrie(Hash),
    /// A single blob to fetch
    RawEntry(Hash),
}

/// Decodes leaf values of a trie into the references they carry.
///
/// Returned references are scheduled with the leaf's node as parent, so the
/// node only commits once they are all stored.
pub trait LeafDecoder: Send + Sync {
    /// Decode a leaf value. An error marks the node carrying it as corrupt.
    fn decode(&self, leaf: &[u8]) -> std::result::Result<Vec<NestedRef>, String>;

    /// Depth at which nested references are scheduled
    fn nested_depth(&self, leaf_depth: u32) -> u32 {
        leaf_depth.saturating_add(1)
    }
}

/// Errors produced by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Content does not match its hash or cannot be decoded
    #[error("corrupt response for {}: {reason}", short_hex(.hash))]
    CorruptResponse {
        /// Requested hash
        hash: Hash,
        /// What was wrong
        reason: String,
    },

    /// No outstanding request for this hash (stale or abandoned)
    #[error("hash {} was not requested", short_hex(.hash))]
    NotRequested {
        /// Delivered hash
        hash: Hash,
    },

    /// The request already has its content
    #[error("hash {} already processed", short_hex(.hash))]
    AlreadyProcessed {
        /// Delivered hash
        hash: Hash,
    },

    /// Every eligible peer failed to deliver the content
    #[error("no peer available for {} after {attempts} attempts", short_hex(.hash))]
    NoPeerAvailable {
        /// Requested hash
        hash: Hash,
        /// Distinct peers tried
        attempts: u32,
    },

    /// Local store failure
    #[error("store error: {0}")]
    Store(String),

    /// A request this one depends on failed
    #[error("dependency {} failed: {cause}", short_hex(.hash))]
    DependencyFailed {
        /// The failed dependency
        hash: Hash,
        /// Why it failed
        cause: Box<SyncError>,
    },
}

impl SyncError {
    /// The error at the bottom of a chain of dependency failures
    pub fn root_cause(&self) -> &SyncError {
        let mut error = self;
        while let SyncError::DependencyFailed { cause, .. } = error {
            error = cause;
        }
        error
    }
}

/// Completion events, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The request and everything below it is in the store
    Committed(Hash),
    /// The request can no longer complete
    Failed {
        /// Failed request
        hash: Hash,
        /// Why
        error: SyncError,
    },
    /// Some paths of a request can no longer complete. The request stays
    /// pending for its other paths.
    PathsFailed {
        /// Narrowed request
        hash: Hash,
        /// Dropped paths, relative to the request
        paths: BTreeSet<Nibbles>,
        /// Why
        error: SyncError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    InFlight,
    Processed,
}

struct Request {
    kind: RequestKind,
    depth: u32,
    seq: u64,
    parents: Vec<Hash>,
    /// Uncommitted requests this one waits on
    children: HashSet<Hash>,
    expansion: Expansion,
    decoder: Option<Arc<dyn LeafDecoder>>,
    status: Status,
    node: Option<TrieNode>,
    data: Option<Bytes>,
    /// Content came from the local store
    local: bool,
    /// Registered directly by a caller
    external: bool,
    /// Queued worklist entries for this request
    expanding: usize,
}

impl Request {
    fn ready_key(&self, hash: Hash) -> (u32, u64, Hash) {
        (self.depth, self.seq, hash)
    }

    fn can_commit(&self) -> bool {
        self.status == Status::Processed && self.children.is_empty() && self.expanding == 0
    }

    /// Drop the paths that route through `child`, given the paths below
    /// `child` that failed (`None` for all of them)
    fn prune(&mut self, child: Hash, lost: Option<&BTreeSet<Nibbles>>) -> Loss {
        let (Expansion::Paths(paths), Some(node)) = (&mut self.expansion, self.node.as_ref())
        else {
            return Loss::Whole;
        };
        let dropped: BTreeSet<Nibbles> = paths
            .iter()
            .filter(|path| match route(node, path) {
                Some((next, rest)) => next == child && lost.map_or(true, |l| l.contains(&rest)),
                None => false,
            })
            .cloned()
            .collect();

        if dropped.is_empty() {
            // A failed child no path leads to is a leaf reference
            return if lost.is_none() { Loss::Whole } else { Loss::Nothing };
        }
        paths.retain(|path| !dropped.contains(path));
        if paths.is_empty() {
            Loss::Whole
        } else {
            Loss::Paths(dropped)
        }
    }
}

/// What a request loses when one of its children fails
enum Loss {
    Nothing,
    Paths(BTreeSet<Nibbles>),
    Whole,
}

struct Schedule {
    hash: Hash,
    kind: RequestKind,
    depth: u32,
    parent: Option<Hash>,
    expansion: Expansion,
    decoder: Option<Arc<dyn LeafDecoder>>,
}

/// Scheduler for content-addressed trie synchronization
pub struct TrieSync<S: NodeStore + ?Sized> {
    store: Arc<S>,
    bloom: Arc<SyncBloom>,
    requests: HashMap<Hash, Request>,
    /// Requests waiting for dispatch, ordered by (depth, registration)
    ready: BTreeSet<(u32, u64, Hash)>,
    worklist: VecDeque<(Hash, Expansion)>,
    events: Vec<SyncEvent>,
    /// Requests failed during the current call
    failures: Vec<(Hash, SyncError)>,
    next_seq: u64,
    max_depth: u32,
}

impl<S: NodeStore + ?Sized> fmt::Debug for TrieSync<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieSync")
            .field("pending", &self.requests.len())
            .field("ready", &self.ready.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl<S: NodeStore + ?Sized> TrieSync<S> {
    /// Create a scheduler writing into `store`
    pub fn new(store: Arc<S>, bloom: Arc<SyncBloom>) -> Self {
        Self {
            store,
            bloom,
            requests: HashMap::new(),
            ready: BTreeSet::new(),
            worklist: VecDeque::new(),
            events: Vec::new(),
            failures: Vec::new(),
            next_seq: 0,
            max_depth: MAX_SYNC_DEPTH,
        }
    }

    /// Cap the recorded depth of requests
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// The store nodes are committed to
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The filter of committed hashes
    pub fn bloom(&self) -> &Arc<SyncBloom> {
        &self.bloom
    }

    /// Register a sub-trie root for full synchronization.
    ///
    /// `decoder` receives every leaf value below `root`. Registering an
    /// already pending root merges into the existing request.
    pub fn add_sub_trie(
        &mut self,
        root: Hash,
        depth: u32,
        parent: Option<Hash>,
        decoder: Option<Arc<dyn LeafDecoder>>,
    ) -> Result<(), SyncError> {
        self.register(Schedule {
            hash: root,
            kind: RequestKind::Node,
            depth,
            parent,
            expansion: Expansion::Full,
            decoder,
        })
    }

    /// Register the nodes along `key` below `root`
    pub fn add_path(&mut self, root: Hash, key: &[u8]) -> Result<(), SyncError> {
        self.add_nibble_path(root, Nibbles::from_bytes(key))
    }

    /// Register the nodes along `path` below `node`, where `path` is what
    /// remains of a key once the nibbles above `node` are consumed
    pub fn add_nibble_path(&mut self, node: Hash, path: Nibbles) -> Result<(), SyncError> {
        self.register(Schedule {
            hash: node,
            kind: RequestKind::Node,
            depth: 0,
            parent: None,
            expansion: Expansion::Paths(BTreeSet::from([path])),
            decoder: None,
        })
    }

    /// Register a single opaque blob
    pub fn add_raw_entry(
        &mut self,
        hash: Hash,
        depth: u32,
        parent: Option<Hash>,
    ) -> Result<(), SyncError> {
        self.register(Schedule {
            hash,
            kind: RequestKind::RawEntry,
            depth,
            parent,
            expansion: Expansion::Full,
            decoder: None,
        })
    }

    /// Up to `max` requests ready for dispatch (0 for all), shallowest first.
    /// Returned requests are marked in flight.
    pub fn missing(&mut self, max: usize) -> Vec<SyncRequest> {
        let limit = if max == 0 { usize::MAX } else { max };
        let keys: Vec<(u32, u64, Hash)> = self.ready.iter().take(limit).copied().collect();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.ready.remove(&key);
            if let Some(req) = self.requests.get_mut(&key.2) {
                req.status = Status::InFlight;
                out.push(SyncRequest {
                    hash: key.2,
                    parents: req.parents.clone(),
                    depth: req.depth,
                    kind: req.kind,
                });
            }
        }
        out
    }

    /// Apply fetched content for `hash`.
    ///
    /// Content that does not hash to `hash` puts the request back in the
    /// ready set. Content that hashes correctly but cannot be decoded fails
    /// the request for good.
    pub fn process(&mut self, hash: Hash, data: Bytes) -> Result<(), SyncError> {
        self.failures.clear();
        let req = self
            .requests
            .get_mut(&hash)
            .ok_or(SyncError::NotRequested { hash })?;
        if req.status == Status::Processed {
            return Err(SyncError::AlreadyProcessed { hash });
        }

        if keccak256(&data) != hash {
            if req.status == Status::InFlight {
                req.status = Status::Ready;
                self.ready.insert(req.ready_key(hash));
            }
            return Err(SyncError::CorruptResponse {
                hash,
                reason: "content hash mismatch".to_string(),
            });
        }
        if req.status == Status::Ready {
            self.ready.remove(&req.ready_key(hash));
        }

        match req.kind {
            RequestKind::RawEntry => {
                req.status = Status::Processed;
                req.data = Some(data);
            }
            RequestKind::Node => match TrieNode::decode(&data) {
                Ok(node) => {
                    req.status = Status::Processed;
                    req.node = Some(node);
                    req.data = Some(data);
                    req.expanding += 1;
                    self.worklist.push_back((hash, req.expansion.clone()));
                }
                Err(e) => {
                    let error = SyncError::CorruptResponse {
                        hash,
                        reason: format!("undecodable node: {e}"),
                    };
                    self.fail(hash, error.clone());
                    return Err(error);
                }
            },
        }
        trace!(hash = %short_hex(&hash), "processed sync response");

        if self.requests.get(&hash).is_some_and(Request::can_commit) {
            self.commit(hash);
        }
        self.run_worklist();
        self.take_failure(hash)
    }

    /// Fail `hash` for good. Returns false if the hash was not pending.
    ///
    /// A parent covering only some paths loses just the paths that route
    /// through the failed request and stays pending for the rest. Any other
    /// parent fails too. Requests left without any interest are dropped.
    pub fn fail(&mut self, hash: Hash, error: SyncError) -> bool {
        if !self.requests.contains_key(&hash) {
            return false;
        }

        // `None` fails the whole request, `Some` only the listed paths
        let mut stack: Vec<(Hash, Option<BTreeSet<Nibbles>>, SyncError)> =
            vec![(hash, None, error)];
        let mut orphans = Vec::new();
        let mut narrowed = Vec::new();
        while let Some((hash, lost, error)) = stack.pop() {
            let parents = match &lost {
                None => {
                    let Some(req) = self.requests.remove(&hash) else {
                        continue;
                    };
                    if req.status == Status::Ready {
                        self.ready.remove(&req.ready_key(hash));
                    }
                    debug!(hash = %short_hex(&hash), %error, "sync request failed");
                    orphans.extend(req.children.into_iter().map(|child| (child, hash)));
                    req.parents
                }
                Some(paths) => {
                    let Some(req) = self.requests.get(&hash) else {
                        continue;
                    };
                    debug!(
                        hash = %short_hex(&hash),
                        paths = paths.len(),
                        %error,
                        "sync paths failed"
                    );
                    narrowed.push(hash);
                    req.parents.clone()
                }
            };

            let cause = error.root_cause().clone();
            for parent in parents {
                let Some(parent_req) = self.requests.get_mut(&parent) else {
                    continue;
                };
                if lost.is_none() {
                    parent_req.children.remove(&hash);
                }
                let parent_lost = match parent_req.prune(hash, lost.as_ref()) {
                    Loss::Nothing => continue,
                    Loss::Paths(paths) => Some(paths),
                    Loss::Whole => None,
                };
                stack.push((
                    parent,
                    parent_lost,
                    SyncError::DependencyFailed {
                        hash,
                        cause: Box::new(cause.clone()),
                    },
                ));
            }

            self.events.push(match lost {
                None => SyncEvent::Failed { hash, error },
                Some(paths) => SyncEvent::PathsFailed { hash, paths, error },
            });
        }

        for (child, parent) in orphans {
            self.detach(child, parent);
        }
        for hash in narrowed {
            if self.requests.get(&hash).is_some_and(Request::can_commit) {
                self.commit(hash);
            }
        }
        true
    }

    /// Drop caller interest in `hash`. The request and any descendants that
    /// nothing else needs are removed without events. Returns whether the
    /// request was removed.
    pub fn abandon(&mut self, hash: Hash) -> bool {
        let Some(req) = self.requests.get_mut(&hash) else {
            return false;
        };
        req.external = false;
        if !req.parents.is_empty() {
            return false;
        }
        self.remove_subtree(hash);
        true
    }

    /// Number of unresolved requests
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// Whether `hash` is still unresolved
    pub fn is_pending(&self, hash: &Hash) -> bool {
        self.requests.contains_key(hash)
    }

    /// Take the events recorded since the last call
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    fn register(&mut self, schedule: Schedule) -> Result<(), SyncError> {
        let hash = schedule.hash;
        self.failures.clear();
        self.schedule(schedule)?;
        self.run_worklist();
        self.take_failure(hash)
    }

    /// Report the failure of `hash` during the current call, if any
    fn take_failure(&mut self, hash: Hash) -> Result<(), SyncError> {
        match std::mem::take(&mut self.failures)
            .into_iter()
            .find(|(h, _)| *h == hash)
        {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }

    fn fail_now(&mut self, hash: Hash, error: SyncError) {
        self.fail(hash, error.clone());
        self.failures.push((hash, error));
    }

    fn schedule(&mut self, s: Schedule) -> Result<(), SyncError> {
        if is_empty_reference(&s.hash) {
            return Ok(());
        }
        let parent = s.parent.filter(|p| self.requests.contains_key(p));
        let depth = s.depth.min(self.max_depth);

        if let Some(req) = self.requests.get_mut(&s.hash) {
            match parent {
                Some(p) if !req.parents.contains(&p) => req.parents.push(p),
                Some(_) => {}
                None => req.external = true,
            }
            if req.decoder.is_none() {
                req.decoder = s.decoder;
            }
            if depth < req.depth {
                if req.status == Status::Ready {
                    self.ready.remove(&req.ready_key(s.hash));
                    self.ready.insert((depth, req.seq, s.hash));
                }
                req.depth = depth;
            }
            if let Some(delta) = req.expansion.merge(s.expansion) {
                if req.status == Status::Processed && req.kind == RequestKind::Node {
                    req.expanding += 1;
                    self.worklist.push_back((s.hash, delta));
                }
            }
            if let Some(p) = parent {
                if let Some(parent_req) = self.requests.get_mut(&p) {
                    parent_req.children.insert(s.hash);
                }
            }
            return Ok(());
        }

        // Filter positives are only hints; the store is authoritative
        let local = if self.bloom.contains(&s.hash) {
            self.store
                .get(&s.hash)
                .map_err(|e| SyncError::Store(e.to_string()))?
        } else {
            None
        };
        let local_node = match (s.kind, local) {
            (RequestKind::RawEntry, Some(_)) => return Ok(()),
            (RequestKind::Node, Some(data)) => match TrieNode::decode(&data) {
                Ok(node) => Some((data, node)),
                Err(e) => {
                    warn!(hash = %short_hex(&s.hash), error = %e, "undecodable local node, fetching again");
                    None
                }
            },
            (_, None) => None,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let mut req = Request {
            kind: s.kind,
            depth,
            seq,
            parents: parent.into_iter().collect(),
            children: HashSet::new(),
            expansion: s.expansion.clone(),
            decoder: s.decoder,
            status: Status::Ready,
            node: None,
            data: None,
            local: false,
            external: parent.is_none(),
            expanding: 0,
        };
        match local_node {
            Some((data, node)) => {
                req.status = Status::Processed;
                req.node = Some(node);
                req.data = Some(data);
                req.local = true;
                req.expanding = 1;
                self.worklist.push_back((s.hash, s.expansion));
            }
            None => {
                self.ready.insert(req.ready_key(s.hash));
                trace!(hash = %short_hex(&s.hash), depth, kind = ?s.kind, "scheduled sync request");
            }
        }

        if let Some(p) = parent {
            if let Some(parent_req) = self.requests.get_mut(&p) {
                parent_req.children.insert(s.hash);
            }
        }
        self.requests.insert(s.hash, req);
        Ok(())
    }

    /// Expand queued nodes until the worklist is empty
    fn run_worklist(&mut self) {
        while let Some((hash, expansion)) = self.worklist.pop_front() {
            if let Err(error) = self.expand(hash, &expansion) {
                self.fail_now(hash, error);
            }
        }
    }

    fn expand(&mut self, hash: Hash, expansion: &Expansion) -> Result<(), SyncError> {
        let Some(req) = self.requests.get(&hash) else {
            return Ok(());
        };
        let (children, leaves) = match req.node.as_ref() {
            Some(node) => select(node, expansion),
            None => (Vec::new(), Vec::new()),
        };
        let depth = req.depth;
        let decoder = req.decoder.clone();

        for (child, child_expansion) in children {
            self.schedule(Schedule {
                hash: child,
                kind: RequestKind::Node,
                depth: depth.saturating_add(1),
                parent: Some(hash),
                expansion: child_expansion,
                decoder: decoder.clone(),
            })?;
        }

        if let Some(decoder) = decoder {
            let nested_depth = decoder.nested_depth(depth);
            for leaf in leaves {
                let nested = decoder
                    .decode(&leaf)
                    .map_err(|reason| SyncError::CorruptResponse { hash, reason })?;
                for reference in nested {
                    let (hash_ref, kind) = match reference {
                        NestedRef::SubTrie(root) => (root, RequestKind::Node),
                        NestedRef::RawEntry(entry) => (entry, RequestKind::RawEntry),
                    };
                    self.schedule(Schedule {
                        hash: hash_ref,
                        kind,
                        depth: nested_depth,
                        parent: Some(hash),
                        expansion: Expansion::Full,
                        decoder: None,
                    })?;
                }
            }
        }

        if let Some(req) = self.requests.get_mut(&hash) {
            req.expanding = req.expanding.saturating_sub(1);
            if req.can_commit() {
                self.commit(hash);
            }
        }
        Ok(())
    }

    /// Commit `hash` and every ancestor that becomes complete
    fn commit(&mut self, hash: Hash) {
        let mut stack = vec![hash];
        while let Some(hash) = stack.pop() {
            let Some(req) = self.requests.get(&hash) else {
                continue;
            };
            if !req.local {
                if let Some(data) = req.data.clone() {
                    if let Err(e) = self.store.put(hash, data) {
                        warn!(hash = %short_hex(&hash), error = %e, "failed to store synced content");
                        self.fail_now(hash, SyncError::Store(e.to_string()));
                        continue;
                    }
                }
            }

            let Some(req) = self.requests.remove(&hash) else {
                continue;
            };
            self.bloom.add(&hash);
            trace!(hash = %short_hex(&hash), local = req.local, "committed sync request");
            self.events.push(SyncEvent::Committed(hash));

            for parent in req.parents {
                if let Some(parent_req) = self.requests.get_mut(&parent) {
                    parent_req.children.remove(&hash);
                    if parent_req.can_commit() {
                        stack.push(parent);
                    }
                }
            }
        }
    }

    /// Remove `parent` from `child`'s parents, dropping it and its
    /// descendants once nothing needs them
    fn detach(&mut self, child: Hash, parent: Hash) {
        let Some(req) = self.requests.get_mut(&child) else {
            return;
        };
        req.parents.retain(|p| *p != parent);
        if req.parents.is_empty() && !req.external {
            self.remove_subtree(child);
        }
    }

    fn remove_subtree(&mut self, hash: Hash) {
        let mut stack = vec![hash];
        while let Some(hash) = stack.pop() {
            let Some(req) = self.requests.remove(&hash) else {
                continue;
            };
            if req.status == Status::Ready {
                self.ready.remove(&req.ready_key(hash));
            }
            trace!(hash = %short_hex(&hash), "abandoned sync request");

            for child in req.children {
                if let Some(child_req) = self.requests.get_mut(&child) {
                    child_req.parents.retain(|p| *p != hash);
                    if child_req.parents.is_empty() && !child_req.external {
                        stack.push(child);
                    }
                }
            }
        }
    }
}

/// The child `path` descends into below `node`, with the rest of the path
fn route(node: &TrieNode, path: &Nibbles) -> Option<(Hash, Nibbles)> {
    match node {
        TrieNode::Extension { path: compact, child } => {
            let (prefix, _) = Nibbles::decode_compact(compact);
            path.starts_with(&prefix).then(|| (*child, path.slice(prefix.len())))
        }
        TrieNode::Branch { children, .. } => {
            let nibble = path.first()?;
            children[nibble as usize].map(|child| (child, path.slice(1)))
        }
        TrieNode::Empty | TrieNode::Leaf { .. } => None,
    }
}

/// Children and leaf values of `node` covered by `expansion`
fn select(node: &TrieNode, expansion: &Expansion) -> (Vec<(Hash, Expansion)>, Vec<Vec<u8>>) {
    let mut children = Vec::new();
    let mut leaves = Vec::new();

    match (node, expansion) {
        (TrieNode::Empty, _) => {}
        (TrieNode::Leaf { value, .. }, Expansion::Full) => leaves.push(value.clone()),
        (TrieNode::Leaf { path, value }, Expansion::Paths(paths)) => {
            let (leaf_path, _) = Nibbles::decode_compact(path);
            if paths.contains(&leaf_path) {
                leaves.push(value.clone());
            }
        }
        (TrieNode::Extension { child, .. }, Expansion::Full) => {
            children.push((*child, Expansion::Full));
        }
        (TrieNode::Extension { path, child }, Expansion::Paths(paths)) => {
            let (prefix, _) = Nibbles::decode_compact(path);
            let below: BTreeSet<Nibbles> = paths
                .iter()
                .filter(|p| p.starts_with(&prefix))
                .map(|p| p.slice(prefix.len()))
                .collect();
            if !below.is_empty() {
                children.push((*child, Expansion::Paths(below)));
            }
        }
        (TrieNode::Branch { children: slots, value }, Expansion::Full) => {
            children.extend(slots.iter().flatten().map(|c| (*c, Expansion::Full)));
            leaves.extend(value.clone());
        }
        (TrieNode::Branch { children: slots, value }, Expansion::Paths(paths)) => {
            let mut below: BTreeMap<u8, BTreeSet<Nibbles>> = BTreeMap::new();
            for path in paths {
                match path.first() {
                    None => leaves.extend(value.clone()),
                    Some(nibble) if slots[nibble as usize].is_some() => {
                        below.entry(nibble).or_default().insert(path.slice(1));
                    }
                    Some(_) => {}
                }
            }
            for (nibble, paths) in below {
                if let Some(child) = slots[nibble as usize] {
                    children.push((child, Expansion::Paths(paths)));
                }
            }
        }
    }

    (children, leaves)
}
