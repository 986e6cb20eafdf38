//! Relay error types.

use crate::store::StoreError;
use thiserror::Error;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] common::ProtocolError),

    /// Backing store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Outbound buffer to a client is full.
    #[error("outbound buffer full")]
    SlowClient,

    /// The client's outbound channel is closed.
    #[error("connection gone")]
    ConnectionGone,

    /// Connection not found in the registry.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
