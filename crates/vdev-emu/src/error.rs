//! Error types for the emulator layer.

use thiserror::Error;

/// Result type alias for emulator operations.
pub type Result<T> = std::result::Result<T, EmuError>;

/// Errors that can occur while running the emulator.
#[derive(Debug, Error)]
pub enum EmuError {
    /// Side-band channel failure.
    #[error("host channel error: {0}")]
    Channel(#[from] vdev_fmem::ChannelError),

    /// Invalid memory-map registration.
    #[error("memory map error: {0}")]
    MemoryMap(String),

    /// I/O plumbing failure (stop pipe, thread lifecycle).
    #[error("I/O control error: {0}")]
    IoControl(String),
}
