//! Client error types.

use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] common::ProtocolError),

    /// JSON error decoding a response payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered a call with `ok: false`.
    #[error("call failed: {0}")]
    Call(String),

    /// The connection dropped before a response arrived.
    #[error("disconnected")]
    Disconnected,

    /// The server rejected this session's credentials; the session will
    /// not reconnect.
    #[error("authentication rejected")]
    AuthRejected,

    /// The session has been shut down.
    #[error("session closed")]
    Closed,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
