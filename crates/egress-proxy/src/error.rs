//! Error types for the proxy engine.

use egress_core::StoreError;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Blacklist store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The reactor thread failed or could not be started.
    #[error("Reactor error: {0}")]
    Reactor(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
