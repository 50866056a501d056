//! # Lightcore
//!
//! Main entry point for the lightcore light client.
//!
//! This binary provides:
//! - A simulated serving network to exercise on-demand retrieval
//! - Configuration file generation and validation

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use lightcore::sim;
use lightcore_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Lightcore light client and tools
#[derive(Parser, Debug)]
#[command(name = "lightcore")]
#[command(version)]
#[command(about = "Lightcore light client - on-demand state retrieval over untrusted peers")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (overrides config): text, json, or compact
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the light client against simulated peers
    Simulate {
        /// Number of serving peers (overrides config)
        #[arg(long)]
        peers: Option<usize>,

        /// Accounts in the generated state (overrides config)
        #[arg(long)]
        accounts: Option<u32>,

        /// Concurrent account lookups (overrides config)
        #[arg(long)]
        lookups: Option<usize>,

        /// Probability that a peer drops a request (overrides config)
        #[arg(long)]
        drop_rate: Option<f64>,

        /// Probability that a peer corrupts an answer (overrides config)
        #[arg(long)]
        corruption_rate: Option<f64>,

        /// Random seed (overrides config)
        #[arg(long)]
        seed: Option<u64>,

        /// Skip the full state sync after the lookups
        #[arg(long)]
        no_sync: bool,
    },

    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "lightcore.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    init_tracing(&cli, &config);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting lightcore");

    match cli.command {
        Commands::Simulate {
            peers,
            accounts,
            lookups,
            drop_rate,
            corruption_rate,
            seed,
            no_sync,
        } => {
            let mut config = config;
            let sim = &mut config.simulation;
            if let Some(peers) = peers {
                sim.peers = peers;
            }
            if let Some(accounts) = accounts {
                sim.accounts = accounts;
            }
            if let Some(lookups) = lookups {
                sim.lookups = lookups;
            }
            if let Some(rate) = drop_rate {
                sim.drop_rate = rate;
            }
            if let Some(rate) = corruption_rate {
                sim.corruption_rate = rate;
            }
            if let Some(seed) = seed {
                sim.seed = seed;
            }
            if no_sync {
                sim.full_sync = false;
            }
            config.validate().context("invalid simulation settings")?;
            handle_simulate(config).await
        }
        Commands::Init { output, force } => handle_init(&output, force),
        Commands::CheckConfig => handle_check_config(&config),
        Commands::Version => handle_version(),
    }
}

/// Load the configuration file, or the defaults when none is given
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

/// Initialize tracing with the configured format and verbosity
fn init_tracing(cli: &Cli, config: &Config) {
    let level = config.logging.level.to_lowercase();
    let filter = match cli.verbose {
        0 => level,
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let format = cli.log_format.unwrap_or(match config.logging.format.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        "compact" => LogFormat::Compact,
        _ => LogFormat::Text,
    });

    match format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(env_filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(env_filter)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(fmt::layer().compact())
                .with(env_filter)
                .init();
        }
    }
}

/// Handle the `simulate` command
async fn handle_simulate(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, canceling simulation");
                cancel.cancel();
            }
        })
    };

    let report = sim::run(&config, cancel).await;
    ctrl_c.abort();
    print!("{}", report?);
    Ok(())
}

/// Handle the `init` command
fn handle_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    Config::default().save(output)?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

/// Handle the `check-config` command
fn handle_check_config(config: &Config) -> Result<()> {
    config.validate()?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn handle_version() -> Result<()> {
    println!("lightcore {}", env!("CARGO_PKG_VERSION"));
    println!("  Rust: {}", env!("CARGO_PKG_RUST_VERSION"));
    Ok(())
}
