//! Document opens, snapshots, and cursor pagination.
//!
//! An open registers the subscription, then pushes the initial snapshot:
//! a plain invocation for ordinary documents, or page one for
//! cursor-aware opens. Streaming opens continue pushing pages from a
//! background task until the result set is exhausted or the document
//! closes. Non-streaming clients request further pages with `fetch`,
//! answered inline on the request/response channel.

use crate::connection::ConnectionState;
use crate::error::{RelayError, Result};
use crate::ws_server::AppState;
use common::{
    ChangeOp, DocumentKey, NotifyFrame, PageRequest, PushFrame, ResponseFrame, ServerFrame,
};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle an `open` frame: register the key and push the initial
/// snapshot (or page one, in cursor-aware mode).
///
/// A failed backing invocation pushes a scoped error instead of a
/// snapshot. The registry entry stays open either way, so later
/// changefeed events for the key still reach this connection.
pub async fn open_document(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    function: &str,
    doc_id: i64,
    cursor: Option<String>,
    limit: Option<u32>,
    stream: bool,
) -> Result<()> {
    let key = DocumentKey::new(function, doc_id);
    state.registry.open(&conn.id, key.clone())?;
    counter!("relay_documents_opened_total").increment(1);

    let paged = cursor.is_some() || limit.is_some() || stream;
    if !paged {
        return match state
            .store
            .invoke(function, conn.principal, vec![json!(doc_id)])
            .await
        {
            Ok(data) => conn.send_frame(&snapshot_frame(&key, data, None, None)),
            Err(e) => send_open_error(conn, &key, e.to_string()),
        };
    }

    let request = PageRequest::new(cursor, limit);
    let limit = request.limit;
    match state
        .store
        .invoke_paged(function, conn.principal, doc_id, request)
        .await
    {
        Ok(page) => {
            conn.send_frame(&snapshot_frame(
                &key,
                page.data,
                page.cursor.clone(),
                Some(page.has_more),
            ))?;
            if stream && page.has_more {
                let state = state.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    stream_pages(state, conn, key, page.cursor, limit).await;
                });
            }
            Ok(())
        }
        Err(e) => send_open_error(conn, &key, e.to_string()),
    }
}

/// Handle a `fetch` frame: one page, answered inline. Does not touch the
/// subscription registry.
pub async fn fetch_page(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    id: u64,
    function: &str,
    doc_id: i64,
    cursor: Option<String>,
    limit: Option<u32>,
) -> Result<()> {
    let frame = match state
        .store
        .invoke_paged(function, conn.principal, doc_id, PageRequest::new(cursor, limit))
        .await
    {
        Ok(page) => ResponseFrame::page(id, &page)?,
        Err(e) => ResponseFrame::failure(id, e.to_string()),
    };
    conn.send_frame(&ServerFrame::Response(frame))
}

/// Background loop for streaming opens: push every remaining page.
///
/// Subscription liveness is polled before each iteration, and again
/// after each backing call so a page fetched across a close is
/// discarded rather than delivered.
pub(crate) async fn stream_pages(
    state: Arc<AppState>,
    conn: Arc<ConnectionState>,
    key: DocumentKey,
    mut cursor: Option<String>,
    limit: u32,
) {
    loop {
        if !state.registry.is_open(&conn.id, &key) || conn.tx.is_closed() {
            debug!("Streaming for {} cancelled", key);
            break;
        }

        let request = PageRequest {
            cursor: cursor.clone(),
            limit,
        };
        let page = match state
            .store
            .invoke_paged(&key.function, conn.principal, key.doc_id, request)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Streaming page for {} failed: {}", key, e);
                break;
            }
        };

        if !state.registry.is_open(&conn.id, &key) {
            debug!("Discarding page for {} fetched across close", key);
            break;
        }

        let frame = ServerFrame::Push(PushFrame::Notify(NotifyFrame {
            doc: key.function.clone(),
            doc_id: key.doc_id,
            op: ChangeOp::Append,
            collection: None,
            parent_ids: None,
            data: page.data,
            cursor: page.cursor.clone(),
            has_more: Some(page.has_more),
        }));
        match conn.send_frame(&frame) {
            Ok(()) => {
                counter!("relay_pages_streamed_total").increment(1);
            }
            Err(RelayError::SlowClient) => {
                warn!("Dropping streamed page to slow connection {}", conn.id);
            }
            Err(_) => {
                state.registry.unregister(&conn.id);
                break;
            }
        }

        match (page.has_more, page.cursor) {
            (true, Some(next)) => cursor = Some(next),
            _ => break,
        }
    }
}

fn snapshot_frame(
    key: &DocumentKey,
    data: serde_json::Value,
    cursor: Option<String>,
    has_more: Option<bool>,
) -> ServerFrame {
    ServerFrame::Push(PushFrame::Notify(NotifyFrame {
        doc: key.function.clone(),
        doc_id: key.doc_id,
        op: ChangeOp::Set,
        collection: None,
        parent_ids: None,
        data,
        cursor,
        has_more,
    }))
}

fn send_open_error(
    conn: &Arc<ConnectionState>,
    key: &DocumentKey,
    error: String,
) -> Result<()> {
    warn!("Open of {} for connection {} failed: {}", key, conn.id, error);
    counter!("relay_open_errors_total").increment(1);
    conn.send_frame(&ServerFrame::Push(PushFrame::Error {
        function: key.function.clone(),
        doc_id: key.doc_id,
        error,
    }))
}
