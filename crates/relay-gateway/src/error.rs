//! Gateway error types.

use thiserror::Error;

/// Errors raised while configuring or running the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A configuration value failed validation.
    #[error("invalid gateway config: {0}")]
    InvalidConfig(String),
    /// The HTTP listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The metrics recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
