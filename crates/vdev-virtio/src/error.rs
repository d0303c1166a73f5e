//! Error types for VirtIO devices.

use thiserror::Error;

/// Result type alias for VirtIO operations.
pub type Result<T> = std::result::Result<T, VirtioError>;

/// Errors that can occur during VirtIO operations.
#[derive(Debug, Error)]
pub enum VirtioError {
    /// Invalid queue configuration or index.
    #[error("invalid queue: {0}")]
    InvalidQueue(String),

    /// Malformed descriptor chain.
    #[error("invalid descriptor chain: {0}")]
    InvalidChain(String),

    /// Device-specific error.
    #[error("{device} error: {message}")]
    Device { device: String, message: String },
}
