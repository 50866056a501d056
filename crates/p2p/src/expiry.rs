//! Set with per-entry expiry
//!
//! Entries are kept in a min-heap ordered by expiry instant and dropped
//! lazily by [`ExpiringSet::expire_before`], so no timer is needed per entry.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

struct Entry<K> {
    expiry: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.seq == other.seq
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    // Reversed so the max-heap pops the earliest expiry first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expiry
            .cmp(&self.expiry)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Membership set whose entries expire.
///
/// Duplicate keys may coexist; each `add` creates a separate entry.
pub struct ExpiringSet<K> {
    heap: BinaryHeap<Entry<K>>,
    next_seq: u64,
}

impl<K> Default for ExpiringSet<K> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Eq> std::fmt::Debug for ExpiringSet<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringSet")
            .field("len", &self.heap.len())
            .field("next_expiry", &self.next_expiry())
            .finish()
    }
}

impl<K: Eq> ExpiringSet<K> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key` until `expiry`
    pub fn add(&mut self, key: K, expiry: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { expiry, seq, key });
    }

    /// Remove the first entry for `key`
    pub fn remove(&mut self, key: &K) -> bool {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let found = match entries.iter().position(|e| e.key == *key) {
            Some(index) => {
                entries.swap_remove(index);
                true
            }
            None => false,
        };
        self.heap = BinaryHeap::from(entries);
        found
    }

    /// Check whether `key` has an entry
    pub fn contains(&self, key: &K) -> bool {
        self.heap.iter().any(|e| e.key == *key)
    }

    /// Drop every entry whose expiry precedes `now`
    pub fn expire_before(&mut self, now: Instant) {
        while self.heap.peek().is_some_and(|e| e.expiry < now) {
            self.heap.pop();
        }
    }

    /// Earliest expiry in the set
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.expiry)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
