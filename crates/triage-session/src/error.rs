//! Error types for triage-session

use thiserror::Error;

/// Result type alias using triage-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a stream session
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the stream core
    #[error(transparent)]
    Stream(#[from] triage_stream::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server-push transport failed
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Create a transport error from any displayable cause
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }
}
