//! Stakechain core
//!
//! Single-writer, proof-of-stake flavoured ledger: an append-only chain of
//! blocks carrying signed economic events, plus the validator registry.
//!
//! # Architecture
//!
//! - **Signed events**: allocations, transfers and validator registrations
//!   are secp256k1-signed over a canonical form
//! - **Merkle commitments**: every block commits to its events in order
//! - **Single writer**: one logical writer, blocks persisted before they are
//!   visible
//! - **Pluggable store**: [`LedgerStore`] over RocksDB or memory
//!
//! # Invariants
//!
//! - Hash linking: `chain[i].previous_hash == chain[i - 1].hash`
//! - Blocks are never mutated after sealing
//! - Validators are never deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod merkle;
pub mod metrics;
pub mod registry;
pub mod storage;
pub mod types;

// Re-exports
pub use block::Block;
pub use chain::{Chain, ChainStats};
pub use config::{BlockPolicy, Config};
pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use event::{
    Allocation, Event, EventKind, GenesisAllocation, SettlementEntry, Transfer,
    ValidatorRegistration,
};
pub use metrics::Metrics;
pub use registry::{RegistrySync, ValidatorRegistry, ValidatorStats};
pub use storage::{LedgerStore, MemoryStore, RocksStore};
pub use types::{QueueItem, QueueStatus, SettledTransaction, Validator, Wallet};
