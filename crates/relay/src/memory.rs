//! In-memory reference implementation of the backing store.
//!
//! Backs the binary and the test suites: named handler closures for
//! calls and snapshots, item lists sliced into cursor pages, and a
//! broadcast changefeed fed by [`MemoryStore::emit`].

use crate::store::{BackingStore, ChangeStream, StoreError, StoreResult};
use async_trait::async_trait;
use common::{PageRequest, PageResult, PrincipalId, StoreChange};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Handler for one named backing function.
pub type Handler = Arc<dyn Fn(PrincipalId, &[Value]) -> StoreResult<Value> + Send + Sync>;

/// Capacity of the changefeed buffer; slow consumers skip lagged events.
const CHANGEFEED_CAPACITY: usize = 256;

pub struct MemoryStore {
    handlers: DashMap<String, Handler>,
    items: DashMap<String, Vec<Value>>,
    profiles: DashMap<PrincipalId, Value>,
    changes_tx: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGEFEED_CAPACITY);
        Self {
            handlers: DashMap::new(),
            items: DashMap::new(),
            profiles: DashMap::new(),
            changes_tx,
        }
    }

    /// Register a handler closure for a named function.
    pub fn register<F>(&self, function: impl Into<String>, handler: F)
    where
        F: Fn(PrincipalId, &[Value]) -> StoreResult<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(function.into(), Arc::new(handler));
    }

    /// Register a function that always returns a fixed value.
    pub fn register_value(&self, function: impl Into<String>, value: Value) {
        self.register(function, move |_, _| Ok(value.clone()));
    }

    /// Set the full item list behind a paginated function. Pages are cut
    /// from this list; the cursor is the offset of the next item.
    pub fn set_items(&self, function: impl Into<String>, items: Vec<Value>) {
        self.items.insert(function.into(), items);
    }

    /// Set the startup payload for a principal.
    pub fn set_profile(&self, principal: PrincipalId, value: Value) {
        self.profiles.insert(principal, value);
    }

    /// Publish a change event to every changefeed subscriber.
    pub fn emit(&self, change: StoreChange) {
        // No subscribers yet is fine; the event is simply unobserved.
        let _ = self.changes_tx.send(change);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn invoke(
        &self,
        function: &str,
        principal: PrincipalId,
        args: Vec<Value>,
    ) -> StoreResult<Value> {
        let handler = self
            .handlers
            .get(function)
            .map(|h| h.clone())
            .ok_or_else(|| StoreError::UnknownFunction(function.to_string()))?;
        handler(principal, &args)
    }

    async fn invoke_paged(
        &self,
        function: &str,
        _principal: PrincipalId,
        _doc_id: i64,
        page: PageRequest,
    ) -> StoreResult<PageResult> {
        let items = self
            .items
            .get(function)
            .map(|entry| entry.clone())
            .ok_or_else(|| StoreError::UnknownFunction(function.to_string()))?;

        let offset: usize = match &page.cursor {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| StoreError::Invocation(format!("bad cursor: {}", cursor)))?,
            None => 0,
        };

        if offset >= items.len() {
            return Ok(PageResult::exhausted());
        }

        let end = (offset + page.limit as usize).min(items.len());
        let slice = items[offset..end].to_vec();
        let has_more = end < items.len();

        Ok(PageResult {
            data: json!({ function: slice }),
            cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }

    async fn profile(&self, principal: PrincipalId) -> StoreResult<Value> {
        Ok(self
            .profiles
            .get(&principal)
            .map(|entry| entry.clone())
            .unwrap_or(Value::Null))
    }

    async fn changes(&self) -> StoreResult<ChangeStream> {
        let rx = self.changes_tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(change) => return Some((change, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Changefeed consumer lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
