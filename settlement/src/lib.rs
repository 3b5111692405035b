//! Stakechain settlement
//!
//! Replays committed chain events into settled state exactly once.
//!
//! # Architecture
//!
//! 1. **Extraction**: scan committed blocks, queue every settlement entry not
//!    yet queued or settled
//! 2. **Processing**: validate, re-authenticate and apply each item, recording
//!    the settled transaction and wallet changes atomically
//! 3. **Reconciliation**: compare settled balances with a replay of the chain
//!
//! The [`Pipeline`] runs these after creating genesis, optionally simulating
//! some activity first.
//!
//! # Example
//!
//! ```no_run
//! use chain_core::{LedgerStore, MemoryStore};
//! use settlement::{Config, Pipeline};
//! use std::sync::Arc;
//!
//! fn main() -> settlement::Result<()> {
//!     let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
//!     let report = Pipeline::new(Config::default(), store).run()?;
//!     println!("{} items settled", report.queue.completed);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod wallet;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineReport, Stage, StageOutcome};
pub use queue::{QueueStats, SettlementQueue};
pub use wallet::{Reconciliation, WalletBook};
