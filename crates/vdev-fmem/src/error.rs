//! Error types for the FMEM side-band channels.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur on the FMEM side-band channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A side-band device file could not be opened.
    #[error("failed to open fmem device {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The underlying descriptor refused a read or write.
    #[error("fmem I/O error: {0}")]
    Io(#[from] std::io::Error),
}
