//! Backing store boundary.
//!
//! The relay treats the business-logic store as an opaque function-call
//! service plus a changefeed. Payload semantics are never interpreted
//! here; `data` values pass through to subscribers untouched.

use async_trait::async_trait;
use common::{PageRequest, PageResult, PrincipalId, StoreChange};
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a backing store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("changefeed unavailable: {0}")]
    Changefeed(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Asynchronous stream of change events from the store.
pub type ChangeStream = BoxStream<'static, StoreChange>;

/// Trait implemented by changefeed-capable backing stores.
///
/// # Example
///
/// ```ignore
/// #[async_trait]
/// impl BackingStore for SqlStore {
///     async fn invoke(&self, function: &str, principal: PrincipalId, args: Vec<Value>) -> StoreResult<Value> {
///         // Dispatch to the named stored function.
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Invoke a named function on behalf of a principal.
    async fn invoke(
        &self,
        function: &str,
        principal: PrincipalId,
        args: Vec<Value>,
    ) -> StoreResult<Value>;

    /// Invoke a paginated function, returning one page plus cursor state.
    async fn invoke_paged(
        &self,
        function: &str,
        principal: PrincipalId,
        doc_id: i64,
        page: PageRequest,
    ) -> StoreResult<PageResult>;

    /// Principal-scoped startup payload pushed once per connection.
    async fn profile(&self, principal: PrincipalId) -> StoreResult<Value>;

    /// Subscribe to the store's changefeed.
    async fn changes(&self) -> StoreResult<ChangeStream>;
}
