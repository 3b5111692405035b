//! Error types for settlement

use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Chain, registry or store error
    #[error("Chain error: {0}")]
    Chain(#[from] chain_core::Error),

    /// A pipeline stage failed and the remaining stages were skipped
    #[error("Pipeline stage '{stage}' failed: {reason}")]
    Pipeline {
        /// Stage name
        stage: String,
        /// Underlying failure
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Underlying chain error, if any
    pub fn as_chain(&self) -> Option<&chain_core::Error> {
        match self {
            Error::Chain(e) => Some(e),
            _ => None,
        }
    }
}
