//! Error types for kafkatap.

use thiserror::Error;

/// Result type alias for kafkatap operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for kafkatap.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet capture errors
    #[error("Capture error: {0}")]
    Capture(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),
}
