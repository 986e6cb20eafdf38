//! Client library for the document-subscription relay.
//!
//! This crate provides:
//! - A reactive core: [`Signal`], [`Effect`], [`Computed`], and
//!   [`batch`], with automatic dependency tracking
//! - A structural merge engine that applies incremental change
//!   notifications into previously fetched document trees
//! - A [`Session`]: one logical connection to the relay, with
//!   reconnect/backoff, a pending-call table, and the per-document
//!   signal registry the merge engine writes into
//!
//! ## Data flow
//!
//! ```text
//! Session::open ──► relay registers key, pushes snapshot
//!        ▲                        │
//!        │                 notify frames
//!        │                        ▼
//!   application ◄── Effect ◄── Signal<DocumentState> ◄── merge engine
//! ```

pub mod error;
pub mod merge;
pub mod reactive;
pub mod session;
pub mod transport;

pub use error::ClientError;
pub use merge::{merge, DocShape, DocumentState};
pub use reactive::{batch, Computed, Effect, Signal};
pub use session::{
    ConnectionStatus, DocumentHandle, OpenOptions, PageStatus, Session, SessionConfig,
};
pub use transport::{FrameSink, FrameStream, Transport, TransportError, WsTransport};
