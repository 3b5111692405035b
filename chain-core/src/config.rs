//! Configuration for the chain

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// How new blocks are sealed
    pub block_policy: BlockPolicy,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/chain"),
            service_name: "chain-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            block_policy: BlockPolicy::default(),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// Block sealing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockPolicy {
    /// Hash once; blocks are vouched for by the validator identity
    #[default]
    ProofOfStake,
    /// Search nonces until the hash has `difficulty` leading zero hex digits
    ProofOfWork {
        /// Required zero prefix length
        difficulty: u32,
    },
}

impl BlockPolicy {
    /// Difficulty recorded in blocks sealed under this policy
    pub fn difficulty(&self) -> u32 {
        match self {
            BlockPolicy::ProofOfStake => 0,
            BlockPolicy::ProofOfWork { difficulty } => *difficulty,
        }
    }

    /// Name used in stats and logs
    pub fn name(&self) -> &'static str {
        match self {
            BlockPolicy::ProofOfStake => "proof_of_stake",
            BlockPolicy::ProofOfWork { .. } => "proof_of_work",
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            enable_statistics: false,
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

    /// Reject settings blocks cannot be sealed under
    pub fn validate(&self) -> crate::Result<()> {
        let difficulty = self.block_policy.difficulty();
        if difficulty > crate::block::MAX_DIFFICULTY {
            return Err(crate::Error::Config(format!(
                "proof-of-work difficulty {} exceeds {}",
                difficulty,
                crate::block::MAX_DIFFICULTY
            )));
        }
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `LEDGER_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        let difficulty = match std::env::var("LEDGER_POW_DIFFICULTY") {
            Ok(raw) => Some(raw.parse::<u32>().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_POW_DIFFICULTY '{}': {}", raw, e))
            })?),
            Err(_) => None,
        };

        if let Ok(policy) = std::env::var("LEDGER_BLOCK_POLICY") {
            self.block_policy = match policy.as_str() {
                "proof_of_stake" | "pos" => BlockPolicy::ProofOfStake,
                "proof_of_work" | "pow" => BlockPolicy::ProofOfWork {
                    difficulty: difficulty.unwrap_or(2),
                },
                other => {
                    return Err(crate::Error::Config(format!(
                        "Unknown LEDGER_BLOCK_POLICY '{}'",
                        other
                    )))
                }
            };
        } else if let (BlockPolicy::ProofOfWork { .. }, Some(difficulty)) =
            (self.block_policy, difficulty)
        {
            self.block_policy = BlockPolicy::ProofOfWork { difficulty };
        }

        self.validate()
    }
}
