//! Relay client error types.

use thiserror::Error;

/// Relay client error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// HTTP client construction or transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;
