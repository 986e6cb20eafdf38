//! Relay server for real-time document subscriptions.
//!
//! This service:
//! - Accepts WebSocket connections, resolving an auth token to a principal
//! - Tracks which documents each connection currently has open
//! - Consumes the backing store's changefeed and fans each change out to
//!   the connections subscribed to its target document keys
//! - Serves request/response calls and cursor pagination (one page inline,
//!   or all pages streamed in the background)
//!
//! ## Architecture
//!
//! ```text
//! BackingStore changefeed
//!         ↓
//! ChangeDispatcher (one consumer task)
//!         ↓
//! ConnectionRegistry (DashMap key → subscribers)
//!         ↓
//! WebSocket connections
//! ```
//!
//! Notifications are serialized once per target and delivered once per
//! (connection, target) pair.

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod pages;
pub mod store;
pub mod ws_server;

pub use auth::{AuthError, StaticTokenAuth, TokenAuth};
pub use connection::{ConnectionId, ConnectionRegistry, ConnectionState};
pub use dispatch::ChangeDispatcher;
pub use error::{RelayError, Result};
pub use memory::MemoryStore;
pub use store::{BackingStore, ChangeStream, StoreError, StoreResult};
pub use ws_server::{create_router, AppState};
