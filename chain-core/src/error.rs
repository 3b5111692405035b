//! Error types for the chain core

use thiserror::Error;

/// Result type for chain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Chain errors
#[derive(Error, Debug)]
pub enum Error {
    /// Hash or Merkle root does not match recomputation
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Signature missing, malformed, or not produced by the claimed key
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Event hash already queued or settled
    #[error("Duplicate event: {0}")]
    DuplicateEvent(String),

    /// Malformed amount, address, or hash
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Slash amount exceeds the validator's collateral
    #[error("Insufficient collateral: requested {requested}, available {available}")]
    InsufficientCollateral {
        /// Amount requested
        requested: String,
        /// Collateral held
        available: String,
    },

    /// Store call failed (RocksDB, lock, missing column family)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A required piece of chain data is absent
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Queue item status change not allowed by the settlement state machine
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key parsing or signing failure
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Errors that leave the chain or store in an unknown state
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::Persistence(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}
