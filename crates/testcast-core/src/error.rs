//! Error types for `testcast` core library.

use thiserror::Error;

use crate::envelope::EnvelopeError;

/// Result type alias using `testcast` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `testcast` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Envelope failed validation
    #[error("Invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Test catalog error
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
