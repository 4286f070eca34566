//! Error types for the Bulwark service.

use thiserror::Error;

/// Main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Gossip cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] crate::mesh::ClusterError),

    /// Upstream client construction errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

/// Errors reported by a shared-counter adapter.
///
/// The distributed limiter never surfaces these to its callers; they only
/// decide whether a check falls back to local state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The backing service cannot be reached.
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),

    /// The backing service answered with an error.
    #[error("counter backend failed: {0}")]
    Backend(String),
}
