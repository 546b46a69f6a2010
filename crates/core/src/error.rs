//! Error types for configuration and task model.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid account id: {0}")]
    InvalidAccountId(String),

    #[error("filter file error: {0}")]
    FilterFile(#[from] std::io::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
