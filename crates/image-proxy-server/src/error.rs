//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Invalid listen address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
