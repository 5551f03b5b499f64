//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Input is not a well-formed account address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Unknown join request status string.
    #[error("Unknown request status: {0}")]
    InvalidStatus(String),
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
