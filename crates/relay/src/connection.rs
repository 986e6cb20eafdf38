//! Connection state and the subscription registry.
//!
//! Uses DashMap for concurrent access: per-connection document sets for
//! cleanup on disconnect, plus a reverse index from document key to
//! subscriber ids so dispatch is O(targets × subscribers-per-target)
//! rather than O(all connections).

use crate::error::{RelayError, Result};
use axum::extract::ws::Message;
use chrono::Utc;
use common::{DocumentKey, PrincipalId, ServerFrame};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Buffer size for per-connection outbound channels. A full buffer marks
/// the client as slow; the message is dropped rather than blocking the
/// dispatcher.
pub const OUTBOUND_BUFFER_SIZE: usize = 1024;

/// State for a single connected client.
pub struct ConnectionState {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Principal resolved from the auth token at upgrade time.
    pub principal: PrincipalId,
    /// Channel to the task that owns this connection's WebSocket sink.
    /// All outbound writes funnel through it, so frames never interleave.
    pub tx: mpsc::Sender<Message>,
    /// Documents this connection currently has open.
    pub documents: DashSet<DocumentKey>,
    /// Timestamp when the connection was established.
    pub connected_at: i64,
    /// Timestamp of the last ping/pong received.
    pub last_ping: AtomicI64,
}

impl ConnectionState {
    pub fn new(principal: PrincipalId, tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            principal,
            tx,
            documents: DashSet::new(),
            connected_at: now,
            last_ping: AtomicI64::new(now),
        }
    }

    /// Serialize and send a frame to this connection.
    pub fn send_frame(&self, frame: &ServerFrame) -> Result<()> {
        self.send_text(frame.encode()?)
    }

    /// Send pre-serialized frame text to this connection.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => RelayError::SlowClient,
                TrySendError::Closed(_) => RelayError::ConnectionGone,
            })
    }

    /// Update the last ping timestamp.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the last ping timestamp.
    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }
}

/// Registry of connected clients and their open documents.
///
/// Maintains:
/// - Connection ID → Connection State
/// - Document key → subscriber connection IDs (reverse index for fan-out)
pub struct ConnectionRegistry {
    /// Connection ID → Connection State.
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
    /// Document key → subscriber connection IDs.
    subscribers: DashMap<DocumentKey, DashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    /// Register a new connection.
    pub fn register(&self, conn: Arc<ConnectionState>) -> ConnectionId {
        let id = conn.id;
        self.connections.insert(id, conn);
        info!("Connection {} registered", id);
        id
    }

    /// Unregister a connection and clean up all of its subscriptions.
    pub fn unregister(&self, conn_id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            for entry in conn.documents.iter() {
                let key = entry.key();
                if let Some(subs) = self.subscribers.get(key) {
                    subs.remove(conn_id);
                }
                self.subscribers.remove_if(key, |_, subs| subs.is_empty());
            }
            info!("Connection {} unregistered", conn_id);
        }
    }

    /// Get a connection by ID.
    pub fn get(&self, conn_id: &ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.get(conn_id).map(|r| r.clone())
    }

    /// Open a document for a connection. Idempotent: re-opening a key a
    /// connection already has open leaves exactly one entry.
    pub fn open(&self, conn_id: &ConnectionId, key: DocumentKey) -> Result<()> {
        let conn = self
            .connections
            .get(conn_id)
            .ok_or_else(|| RelayError::ConnectionNotFound(conn_id.to_string()))?;

        conn.documents.insert(key.clone());
        self.subscribers
            .entry(key.clone())
            .or_default()
            .insert(*conn_id);

        debug!("Connection {} opened {}", conn_id, key);
        Ok(())
    }

    /// Close a document for a connection. Closing a key that is not open
    /// is not an error.
    pub fn close(&self, conn_id: &ConnectionId, key: &DocumentKey) {
        if let Some(conn) = self.connections.get(conn_id) {
            conn.documents.remove(key);
        }
        if let Some(subs) = self.subscribers.get(key) {
            subs.remove(conn_id);
        }
        self.subscribers.remove_if(key, |_, subs| subs.is_empty());
        debug!("Connection {} closed {}", conn_id, key);
    }

    /// Whether a connection currently has a document open. Polled by the
    /// streaming-page loop between pages.
    pub fn is_open(&self, conn_id: &ConnectionId, key: &DocumentKey) -> bool {
        self.subscribers
            .get(key)
            .map(|subs| subs.contains(conn_id))
            .unwrap_or(false)
    }

    /// Snapshot of the live connections subscribed to a document key.
    /// A concurrent close cannot invalidate iteration over the snapshot.
    pub fn subscribers(&self, key: &DocumentKey) -> Vec<Arc<ConnectionState>> {
        match self.subscribers.get(key) {
            Some(subs) => subs
                .iter()
                .filter_map(|id| self.connections.get(&id).map(|c| c.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Total number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of document keys with at least one subscriber.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Remove connections that have not ponged within the idle window.
    pub fn cleanup_stale(&self, max_idle_ms: i64) {
        let now = Utc::now().timestamp_millis();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| now - entry.value().last_ping_time() > max_idle_ms)
            .map(|entry| *entry.key())
            .collect();

        for id in stale {
            warn!("Removing stale connection {}", id);
            self.unregister(&id);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
