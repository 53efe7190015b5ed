//! Error types for the core crate.

use thiserror::Error;

/// Errors raised while classifying the first line of a client request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    /// The line does not split into at least a method and a target.
    #[error("malformed request line: {0:?}")]
    MalformedLine(String),

    /// The request target could not be turned into a host.
    #[error("invalid request target: {0:?}")]
    InvalidTarget(String),

    /// The port is not a valid TCP port.
    #[error("invalid port in target: {0:?}")]
    InvalidPort(String),
}

/// Errors raised while parsing a host pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// The pattern is empty after trimming.
    #[error("empty host pattern")]
    Empty,

    /// The pattern contains characters that cannot appear in a host name.
    #[error("invalid host pattern: {0:?}")]
    Invalid(String),
}

/// Errors surfaced by a blacklist store backend.
///
/// The engine logs these and keeps serving the last-known-good snapshot.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or returned an error.
    #[error("blacklist store unavailable: {0}")]
    Unavailable(String),

    /// A stored or submitted pattern is not a valid host pattern.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while importing a blacklist file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A line of the file is not a valid pattern.
    #[error("line {line}: {source}")]
    Line {
        /// One-based line number.
        line: usize,
        /// The underlying pattern error.
        source: PatternError,
    },

    /// IO error while reading or writing the file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
