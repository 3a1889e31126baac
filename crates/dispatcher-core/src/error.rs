//! Core error types.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Event store call failed (claim or settle)
    #[error("Store error: {0}")]
    Store(String),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
