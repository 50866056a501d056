//! Probabilistic filter over content hashes
//!
//! The filter remembers which hashes the scheduler has committed to the local
//! store so that re-registrations can skip the store lookup for content that
//! is definitely absent. A positive answer is only a hint and is always
//! confirmed against the store before it is trusted.

use std::sync::atomic::{AtomicU64, Ordering};

use lightcore_storage::Hash;

/// Default filter size in bits (512 KiB)
pub const DEFAULT_BLOOM_BITS: usize = 1 << 22;

/// Bit positions derived per hash
const BLOOM_HASHES: usize = 4;

/// Append-only bloom filter keyed by content hash.
///
/// Content hashes are already uniformly distributed, so bit positions are
/// taken directly from consecutive 8-byte windows of the hash.
#[derive(Debug)]
pub struct SyncBloom {
    words: Box<[AtomicU64]>,
    bits: u64,
    added: AtomicU64,
}

impl Default for SyncBloom {
    fn default() -> Self {
        Self::new(DEFAULT_BLOOM_BITS)
    }
}

impl SyncBloom {
    /// Create a filter with at least `bits` bits
    pub fn new(bits: usize) -> Self {
        let words = bits.max(64).div_ceil(64);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits: (words * 64) as u64,
            added: AtomicU64::new(0),
        }
    }

    /// Record `hash` as present
    pub fn add(&self, hash: &Hash) {
        for (word, mask) in self.positions(hash) {
            self.words[word].fetch_or(mask, Ordering::Release);
        }
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether `hash` may be present. Never false for an added hash.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.positions(hash)
            .all(|(word, mask)| self.words[word].load(Ordering::Acquire) & mask != 0)
    }

    /// Number of `add` calls so far
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    /// Filter size in bits
    pub fn bits(&self) -> u64 {
        self.bits
    }

    fn positions<'a>(&'a self, hash: &'a Hash) -> impl Iterator<Item = (usize, u64)> + 'a {
        (0..BLOOM_HASHES).map(move |i| {
            let mut window = [0u8; 8];
            window.copy_from_slice(&hash[i * 8..i * 8 + 8]);
            let bit = u64::from_le_bytes(window) % self.bits;
            ((bit / 64) as usize, 1u64 << (bit % 64))
        })
    }
}
