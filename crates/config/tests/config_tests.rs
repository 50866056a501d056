//! Tests for Config module

use std::io::Write;
use std::path::Path;

use lightcore_config::{
    Config, ConfigError, DistributorConfig, LoggingConfig, OdrConfig, ReputationConfig,
    SimulationConfig, SyncConfig,
};

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.odr.queue_capacity, 1024);
    assert_eq!(config.distributor.request_timeout_ms, 5_000);
    assert_eq!(config.distributor.max_attempts, 5);
    assert_eq!(config.distributor.reputation.failure_penalty, 20);
    assert_eq!(config.sync.bloom_bits, 1 << 22);
    assert_eq!(config.logging.level, "info");
    assert!(config.validate().is_ok());
}

#[test]
fn test_toml_roundtrip() {
    let mut config = Config::default();
    config.distributor.max_attempts = 3;
    config.simulation.drop_rate = 0.25;
    config.logging.format = "json".to_string();

    let rendered = config.to_toml().unwrap();
    assert!(rendered.contains("[distributor.reputation]"));
    assert_eq!(Config::from_str(&rendered).unwrap(), config);
}

#[test]
fn test_partial_sections_use_defaults() {
    let config = Config::from_str(
        r#"
        [distributor]
        request_timeout_ms = 750

        [distributor.reputation]
        failure_cooldown_ms = 500

        [simulation]
        peers = 9
        "#,
    )
    .unwrap();

    assert_eq!(config.distributor.request_timeout_ms, 750);
    assert_eq!(config.distributor.max_attempts, 5);
    assert_eq!(config.distributor.reputation.failure_cooldown_ms, 500);
    assert_eq!(config.distributor.reputation.initial_score, 100);
    assert_eq!(config.simulation.peers, 9);
    assert_eq!(config.odr, OdrConfig::default());
}

#[test]
fn test_zero_values_rejected() {
    let mut config = OdrConfig::default();
    config.queue_capacity = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ZeroValue("odr.queue_capacity"))
    ));

    let mut config = DistributorConfig::default();
    config.max_attempts = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ZeroValue("distributor.max_attempts"))
    ));

    let mut config = DistributorConfig::default();
    config.request_timeout_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_reputation() {
    let config = ReputationConfig {
        initial_score: 300,
        max_score: 200,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidReputation {
            initial: 300,
            max: 200
        })
    ));
}

#[test]
fn test_invalid_bloom_bits() {
    let config = SyncConfig {
        bloom_bits: 8,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidBloomBits(8))
    ));
}

#[test]
fn test_invalid_rates() {
    let config = SimulationConfig {
        drop_rate: 1.5,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidRate {
            name: "simulation.drop_rate",
            ..
        })
    ));

    let config = SimulationConfig {
        corruption_rate: -0.5,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_logging() {
    let mut config = LoggingConfig::default();
    config.level = "verbose".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidLogLevel(_))
    ));

    let mut config = LoggingConfig::default();
    config.format = "xml".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidLogFormat(_))
    ));

    let mut config = LoggingConfig::default();
    config.level = "DEBUG".to_string();
    config.format = "Compact".to_string();
    assert!(config.validate().is_ok());
}

#[test]
fn test_from_str_validates() {
    let result = Config::from_str(
        r#"
        [odr]
        batch_size = 0
        "#,
    );
    assert!(matches!(result, Err(ConfigError::ZeroValue("odr.batch_size"))));
}

#[test]
fn test_malformed_toml() {
    let result = Config::from_str("[odr\nqueue_capacity = ");
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));

    let result = Config::from_str("[odr]\nqueue_capacity = \"many\"");
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[odr]\nmax_concurrent_fetches = 2").unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.odr.max_concurrent_fetches, 2);
}

#[test]
fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lightcore.toml");

    let mut config = Config::default();
    config.simulation.seed = 1234;
    config.save(&path).unwrap();

    assert_eq!(Config::load(&path).unwrap(), config);
}

#[test]
fn test_missing_file() {
    let result = Config::load(Path::new("/nonexistent/lightcore.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead { .. })));
}
