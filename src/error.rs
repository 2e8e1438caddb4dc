//! Error types for the Modelgate service.

use thiserror::Error;

/// Main error type for Modelgate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Modelgate operations.
pub type Result<T> = std::result::Result<T, GateError>;
