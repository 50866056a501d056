//! Main configuration module for lightcore
//!
//! All settings live in one `lightcore.toml` file. Durations are given in
//! milliseconds; the binary turns the sections into the runtime structs of
//! the individual crates.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Main configuration struct containing all lightcore settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Retrieval coordinator
    #[serde(default)]
    pub odr: OdrConfig,

    /// Request distribution over peers
    #[serde(default)]
    pub distributor: DistributorConfig,

    /// Trie synchronization
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulated network for `lightcore simulate`
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use lightcore_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::load(Path::new("lightcore.toml"))?;
    /// ```
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!("Loading configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content)?;

        debug!("Configuration parsed successfully, validating...");
        config.validate()?;

        info!(
            "Configuration loaded: request_timeout={}ms, max_attempts={}, queue_capacity={}",
            config.distributor.request_timeout_ms,
            config.distributor.max_attempts,
            config.odr.queue_capacity
        );

        Ok(config)
    }

    /// Load configuration from a TOML string.
    ///
    /// Useful for testing or when configuration is provided as a string.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        self.odr.validate()?;
        self.distributor.validate()?;
        self.sync.validate()?;
        self.logging.validate()?;
        self.simulation.validate()?;

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

fn require_positive(name: &'static str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::ZeroValue(name));
    }
    Ok(())
}

fn require_rate(name: &'static str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidRate { name, value });
    }
    Ok(())
}

// =============================================================================
// Retrieval Configuration
// =============================================================================

/// Retrieval coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdrConfig {
    /// Execution queue capacity (queued plus running tasks)
    pub queue_capacity: usize,

    /// Scheduler requests per fetch batch
    pub batch_size: usize,

    /// Fetch batches in flight at once
    pub max_concurrent_fetches: usize,

    /// Fetch rounds per lookup before giving up
    pub max_lookup_rounds: u32,

    /// Backoff between attempts to hand fetch results to a full queue
    pub enqueue_retry_ms: u64,
}

impl OdrConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        require_positive("odr.queue_capacity", self.queue_capacity as u64)?;
        require_positive("odr.batch_size", self.batch_size as u64)?;
        require_positive("odr.max_concurrent_fetches", self.max_concurrent_fetches as u64)?;
        require_positive("odr.max_lookup_rounds", self.max_lookup_rounds as u64)?;
        require_positive("odr.enqueue_retry_ms", self.enqueue_retry_ms)?;
        Ok(())
    }
}

impl Default for OdrConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            batch_size: 64,
            max_concurrent_fetches: 8,
            max_lookup_rounds: 4,
            enqueue_retry_ms: 5,
        }
    }
}

// =============================================================================
// Distributor Configuration
// =============================================================================

/// Request distribution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// How long an attempt waits for its response
    pub request_timeout_ms: u64,

    /// Distinct peers tried per request
    pub max_attempts: u32,

    /// Concurrent requests per peer
    pub max_in_flight_per_peer: usize,

    /// How long to wait for a free peer slot
    pub peer_wait_ms: u64,

    /// Lowest protocol version accepted from peers
    pub min_protocol_version: u32,

    /// How long timed-out request ids are remembered
    pub late_response_window_ms: u64,

    /// Peer scoring
    pub reputation: ReputationConfig,
}

impl DistributorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        require_positive("distributor.request_timeout_ms", self.request_timeout_ms)?;
        require_positive("distributor.max_attempts", self.max_attempts as u64)?;
        require_positive(
            "distributor.max_in_flight_per_peer",
            self.max_in_flight_per_peer as u64,
        )?;
        self.reputation.validate()
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_attempts: 5,
            max_in_flight_per_peer: 4,
            peer_wait_ms: 2_000,
            min_protocol_version: 1,
            late_response_window_ms: 30_000,
            reputation: ReputationConfig::default(),
        }
    }
}

/// Peer scoring configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Score of a newly registered peer
    pub initial_score: u32,

    /// Upper bound on the score
    pub max_score: u32,

    /// Added on every successful response
    pub success_reward: u32,

    /// Subtracted on every failed attempt
    pub failure_penalty: u32,

    /// How long a failing peer is deprioritized
    pub failure_cooldown_ms: u64,
}

impl ReputationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.initial_score > self.max_score {
            return Err(ConfigError::InvalidReputation {
                initial: self.initial_score,
                max: self.max_score,
            });
        }
        Ok(())
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 100,
            max_score: 200,
            success_reward: 10,
            failure_penalty: 20,
            failure_cooldown_ms: 10_000,
        }
    }
}

// =============================================================================
// Sync Configuration
// =============================================================================

/// Trie synchronization configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Size of the committed-hash filter in bits
    pub bloom_bits: usize,

    /// Cap on the recorded depth of scheduler requests
    pub max_depth: u32,
}

impl SyncConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.bloom_bits < 64 {
            return Err(ConfigError::InvalidBloomBits(self.bloom_bits));
        }
        require_positive("sync.max_depth", self.max_depth as u64)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bloom_bits: 1 << 22,
            max_depth: 128,
        }
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.level.clone()));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.format.clone()));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

// =============================================================================
// Simulation Configuration
// =============================================================================

/// Simulated network used by `lightcore simulate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Serving peers
    pub peers: usize,

    /// Accounts in the generated state
    pub accounts: u32,

    /// Every n-th account is a contract with storage and code
    pub contract_every: u32,

    /// Storage slots per contract
    pub storage_slots: u32,

    /// Account lookups issued concurrently
    pub lookups: usize,

    /// Base response latency of a peer
    pub latency_ms: u64,

    /// Extra random latency of a peer, up to this bound
    pub jitter_ms: u64,

    /// Probability that a peer never answers a request
    pub drop_rate: f64,

    /// Probability that a peer answers with corrupted content
    pub corruption_rate: f64,

    /// Synchronize the whole state after the lookups
    pub full_sync: bool,

    /// Seed for state generation and peer behavior
    pub seed: u64,
}

impl SimulationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        require_positive("simulation.peers", self.peers as u64)?;
        require_positive("simulation.contract_every", self.contract_every as u64)?;
        require_rate("simulation.drop_rate", self.drop_rate)?;
        require_rate("simulation.corruption_rate", self.corruption_rate)?;
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peers: 4,
            accounts: 500,
            contract_every: 5,
            storage_slots: 4,
            lookups: 64,
            latency_ms: 20,
            jitter_ms: 30,
            drop_rate: 0.05,
            corruption_rate: 0.02,
            full_sync: true,
            seed: 42,
        }
    }
}
