//! Protocol error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
