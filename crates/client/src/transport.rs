//! Pluggable client transport.
//!
//! The session depends only on the [`Transport`] trait; the shipped
//! implementation speaks WebSocket via tokio-tungstenite. An
//! authentication rejection during the handshake is classified
//! separately from ordinary connect failures so the session can stop
//! retrying.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The server rejected this session's credentials at the handshake.
    #[error("authentication rejected")]
    AuthRejected,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("invalid endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Outbound half of a connection. Exactly one writer exists per
/// connection, so frames never interleave.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: &str) -> Result<(), TransportError>;
    async fn ping(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame; `None` once the connection is gone.
    async fn next(&mut self) -> Option<Result<String, TransportError>>;
}

/// Factory for connections to the relay.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

/// Append the session token to a relay endpoint URL.
pub fn endpoint_with_token(url: &str, token: &str) -> Result<String, TransportError> {
    let mut url = Url::parse(url)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

// ============================================================================
// WebSocket implementation
// ============================================================================

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket transport backed by tokio-tungstenite.
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        match connect_async(url).await {
            Ok((socket, response)) => {
                debug!("WebSocket handshake complete, status {:?}", response.status());
                let (write, read) = socket.split();
                Ok((
                    Box::new(WsFrameSink { write }),
                    Box::new(WsFrameStream { read }),
                ))
            }
            Err(WsError::Http(response)) => {
                let status = response.status();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    Err(TransportError::AuthRejected)
                } else {
                    Err(TransportError::Connect(format!("HTTP {}", status)))
                }
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

struct WsFrameSink {
    write: WsWrite,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}

struct WsFrameStream {
    read: WsRead,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        debug!("Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                // Control frames are answered by the protocol layer.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => return None,
                Some(Err(e)) => return Some(Err(TransportError::WebSocket(e.to_string()))),
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_with_token() {
        let endpoint = endpoint_with_token("ws://localhost:8082/ws", "secret").unwrap();
        assert_eq!(endpoint, "ws://localhost:8082/ws?token=secret");
    }

    #[test]
    fn test_endpoint_rejects_bad_url() {
        assert!(endpoint_with_token("not a url", "t").is_err());
    }
}
