//! Per-peer reputation
//!
//! Every registered peer carries a small [`PeerStats`] record:
//! - a score that rises on success and drops on failure, bounded by the policy;
//!   a peer scoring below a new peer is picked only after healthy ones
//! - an exponential moving average of round-trip time
//! - the number of requests currently outstanding
//! - a status that puts a failing peer in cooldown for a bounded time

use std::time::{Duration, Instant};

/// Reputation tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationPolicy {
    /// Score of a newly registered peer
    pub initial_score: u32,
    /// Upper bound on the score
    pub max_score: u32,
    /// Added on every successful response
    pub success_reward: u32,
    /// Subtracted on every failed attempt
    pub failure_penalty: u32,
    /// How long a failing peer is deprioritized
    pub failure_cooldown: Duration,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            initial_score: 100,
            max_score: 200,
            success_reward: 10,
            failure_penalty: 20,
            failure_cooldown: Duration::from_secs(10),
        }
    }
}

/// Selection status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Selected normally
    Active,
    /// Recently failed; only used when no active peer is left
    CoolingDown {
        /// End of the cooldown
        until: Instant,
    },
}

/// Reputation record of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    /// Current score
    pub score: u32,
    /// Successful responses
    pub successes: u64,
    /// Failed attempts (timeouts, send errors, invalid responses)
    pub failures: u64,
    /// Bytes of valid content received
    pub bytes_received: u64,
    /// Requests currently outstanding
    pub in_flight: usize,
    /// Smoothed round-trip time
    pub rtt: Option<Duration>,
    /// Selection status
    pub status: PeerStatus,
}

impl PeerStats {
    /// Create stats for a newly registered peer
    pub fn new(policy: &ReputationPolicy) -> Self {
        Self {
            score: policy.initial_score.min(policy.max_score),
            successes: 0,
            failures: 0,
            bytes_received: 0,
            in_flight: 0,
            rtt: None,
            status: PeerStatus::Active,
        }
    }

    /// Record a successful response
    pub fn record_success(&mut self, rtt: Duration, bytes: u64, policy: &ReputationPolicy) {
        self.successes += 1;
        self.bytes_received += bytes;

        // Exponential moving average, 70% history
        self.rtt = Some(match self.rtt {
            None => rtt,
            Some(prev) => (prev * 7 + rtt * 3) / 10,
        });

        self.score = self
            .score
            .saturating_add(policy.success_reward)
            .min(policy.max_score);
        self.status = PeerStatus::Active;
    }

    /// Record a failed attempt and start a cooldown
    pub fn record_failure(&mut self, now: Instant, policy: &ReputationPolicy) {
        self.failures += 1;
        self.score = self.score.saturating_sub(policy.failure_penalty);
        self.status = PeerStatus::CoolingDown {
            until: now + policy.failure_cooldown,
        };
    }

    /// Whether the peer is in cooldown at `now`
    pub fn is_cooling_down(&self, now: Instant) -> bool {
        matches!(self.status, PeerStatus::CoolingDown { until } if until > now)
    }

    /// Whether failures have pushed the score below that of a new peer
    pub fn is_penalized(&self, policy: &ReputationPolicy) -> bool {
        self.score < policy.initial_score.min(policy.max_score)
    }

    /// Whether another request may be sent to the peer
    pub fn has_capacity(&self, max_in_flight: usize) -> bool {
        self.in_flight < max_in_flight
    }

    /// Share of attempts that succeeded, 1.0 before any attempt
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 1.0;
        }
        self.successes as f64 / total as f64
    }
}
