//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write configuration file
    #[error("Failed to write config file at {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to render TOML configuration
    #[error("Failed to serialize TOML config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A count or duration that must be positive is zero
    #[error("Invalid {0}: must be positive")]
    ZeroValue(&'static str),

    /// A probability outside [0, 1]
    #[error("Invalid {name}: must be between 0.0 and 1.0, got {value}")]
    InvalidRate { name: &'static str, value: f64 },

    /// Reputation bounds that contradict each other
    #[error("Invalid reputation: initial_score {initial} exceeds max_score {max}")]
    InvalidReputation { initial: u32, max: u32 },

    /// Filter size that is not a usable number of bits
    #[error("Invalid bloom_bits: must be at least 64, got {0}")]
    InvalidBloomBits(usize),

    /// Invalid log level
    #[error("Invalid log level: {0}. Valid values: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Invalid log format
    #[error("Invalid log format: {0}. Valid values: json, pretty, compact")]
    InvalidLogFormat(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
