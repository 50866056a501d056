//! # Lightcore Configuration
//!
//! This crate provides configuration parsing for the lightcore light client.
//!
//! Every tunable of the retrieval stack lives in one `lightcore.toml` file.
//! Missing sections and fields fall back to their defaults, so an empty file
//! is a valid configuration.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lightcore_config::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("lightcore.toml"))?;
//! println!("Request timeout: {}ms", config.distributor.request_timeout_ms);
//! ```
//!
//! ## Configuration Sections
//!
//! - `[odr]` - Retrieval coordinator (queue capacity, batching, lookup rounds)
//! - `[distributor]` - Request distribution (timeouts, attempts, per-peer limits)
//! - `[distributor.reputation]` - Peer scoring and failure cooldown
//! - `[sync]` - Trie scheduler (filter size, depth cap)
//! - `[logging]` - Logging settings (level, format)
//! - `[simulation]` - Simulated network used by `lightcore simulate`

mod config;
mod error;

pub use config::*;
pub use error::*;
