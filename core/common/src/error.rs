//! Common error types for Tandem.

use thiserror::Error;

/// Top-level error type for Tandem operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable backend operation failed (read, write, delete or flush).
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Publishing on the broadcast channel failed.
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error came from the durable backend.
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
