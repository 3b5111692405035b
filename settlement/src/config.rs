//! Configuration for settlement and the init pipeline

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Chain configuration (storage, block policy)
    pub ledger: chain_core::Config,

    /// Directory holding the issuer's key files
    pub keys_dir: PathBuf,

    /// Genesis parameters
    pub genesis: GenesisConfig,

    /// Queue processing
    pub queue: QueueConfig,

    /// Pipeline switches
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "settlement".to_string(),
            ledger: chain_core::Config::default(),
            keys_dir: PathBuf::from("./data/keys"),
            genesis: GenesisConfig::default(),
            queue: QueueConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Genesis parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Total supply allocated to the issuer
    pub total_supply: Decimal,

    /// Default validator collateral stated in the genesis event
    pub collateral: Decimal,

    /// Description attached to the genesis event
    pub description: String,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            total_supply: Decimal::from(1_000_000),
            collateral: Decimal::from(10_000),
            description: "Initial coin allocation".to_string(),
        }
    }
}

/// Queue processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Shortest settlement hash accepted by validation
    pub min_hash_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { min_hash_len: 32 }
    }
}

/// Pipeline switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Wipe the store before running
    pub reset: bool,

    /// Append a demo block of transfers and a validator registration
    pub simulation: bool,

    /// Amount moved by each simulated transfer
    pub simulation_amount: Decimal,

    /// IP address reported by the simulated validator
    pub simulation_validator_ip: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reset: false,
            simulation: false,
            simulation_amount: Decimal::from(100_000),
            simulation_validator_ip: "127.0.0.1".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `LEDGER_*` / `SETTLEMENT_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        self.ledger.apply_env()?;

        if let Ok(dir) = std::env::var("SETTLEMENT_KEYS_DIR") {
            self.keys_dir = PathBuf::from(dir);
        }

        if let Ok(value) = std::env::var("SETTLEMENT_RESET") {
            self.pipeline.reset = parse_flag("SETTLEMENT_RESET", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_SIMULATION") {
            self.pipeline.simulation = parse_flag("SETTLEMENT_SIMULATION", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_MIN_HASH_LEN") {
            self.queue.min_hash_len = value.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid SETTLEMENT_MIN_HASH_LEN '{}': {}", value, e))
            })?;
        }

        self.validate()
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        self.ledger.validate()?;
        if self.genesis.total_supply <= Decimal::ZERO {
            return Err(crate::Error::Config("genesis.total_supply must be positive".into()));
        }
        if self.genesis.collateral.is_sign_negative() {
            return Err(crate::Error::Config("genesis.collateral must not be negative".into()));
        }
        if self.queue.min_hash_len == 0 || self.queue.min_hash_len > 64 {
            return Err(crate::Error::Config(format!(
                "queue.min_hash_len must be within 1..=64, got {}",
                self.queue.min_hash_len
            )));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> crate::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(crate::Error::Config(format!("Invalid {} '{}'", name, other))),
    }
}
