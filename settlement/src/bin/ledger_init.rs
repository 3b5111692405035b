//! Ledger initialization binary
//!
//! Usage: `ledger-init [CONFIG.toml] [--reset] [--simulate]`
//!
//! Without a config file, settings come from `LEDGER_*` / `SETTLEMENT_*`
//! environment variables. `LOG_FORMAT=json` switches to JSON log lines.

use anyhow::Context;
use chain_core::{LedgerStore, RocksStore};
use clap::Parser;
use settlement::{Config, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "ledger-init")]
#[command(about = "Initialize the ledger and settle its events", long_about = None)]
struct Args {
    /// TOML config file; environment variables apply on top
    config: Option<PathBuf>,

    /// Wipe the store before running
    #[arg(long)]
    reset: bool,

    /// Append demo transfers and a validator registration
    #[arg(long)]
    simulate: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = match &args.config {
        Some(path) => {
            let mut config = Config::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            config.apply_env().context("applying environment overrides")?;
            config
        }
        None => Config::from_env().context("loading config from environment")?,
    };
    config.pipeline.reset |= args.reset;
    config.pipeline.simulation |= args.simulate;

    tracing::info!(
        service = %config.service_name,
        data_dir = %config.ledger.data_dir.display(),
        consensus = config.ledger.block_policy.name(),
        reset = config.pipeline.reset,
        simulation = config.pipeline.simulation,
        "Starting ledger initialization"
    );

    let store: Arc<dyn LedgerStore> = Arc::new(
        RocksStore::open(&config.ledger)
            .with_context(|| format!("opening store at {}", config.ledger.data_dir.display()))?,
    );

    let report = Pipeline::new(config, store).run()?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.chain.is_valid {
        anyhow::bail!("chain failed validation after initialization");
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
