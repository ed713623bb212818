//! Error types for triage-stream

use thiserror::Error;

/// Result type alias using triage-stream Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling the event stream
#[derive(Error, Debug)]
pub enum Error {
    /// A transport frame could not be parsed into a valid envelope
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a malformed-envelope error from any displayable cause
    pub fn malformed(cause: impl std::fmt::Display) -> Self {
        Self::MalformedEnvelope(cause.to_string())
    }
}
