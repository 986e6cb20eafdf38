//! WebSocket endpoint using Axum.
//!
//! The upgrade handler resolves the auth token before upgrading; a bad
//! token rejects the connection with 401 and no session is created.
//! After the upgrade the connection pushes the principal's profile
//! payload, then serves frames in arrival order.

use crate::connection::{ConnectionRegistry, ConnectionState, OUTBOUND_BUFFER_SIZE};
use crate::error::Result;
use crate::pages;
use crate::store::BackingStore;
use crate::auth::TokenAuth;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use common::{
    protocol, CallFrame, ClientFrame, ControlFrame, DocumentKey, PushFrame, ResponseFrame,
    ServerFrame,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn BackingStore>,
    pub auth: Arc<dyn TokenAuth>,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.registry.connection_count();
    let subscriptions = state.registry.subscription_count();
    format!(
        r#"{{"status":"ok","connections":{},"subscriptions":{}}}"#,
        connections, subscriptions
    )
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

/// WebSocket upgrade handler. Token resolution happens before the
/// upgrade so an unauthorized peer never gets a socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.auth.resolve(&query.token).await {
        Ok(principal) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, principal))
            .into_response(),
        Err(e) => {
            warn!("Rejected connection: {}", e);
            counter!("relay_auth_rejections_total").increment(1);
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, principal: i64) {
    // Split the socket into sender and receiver
    let (mut ws_tx, mut ws_rx) = socket.split();

    // All outbound frames funnel through one channel so the sink never
    // interleaves writes from the dispatcher, the page streamer, and
    // request handling.
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER_SIZE);

    let conn = Arc::new(ConnectionState::new(principal, tx));
    let conn_id = state.registry.register(conn.clone());

    counter!("relay_connections_total").increment(1);
    gauge!("relay_active_connections").set(state.registry.connection_count() as f64);

    info!("Connection {} established for principal {}", conn_id, principal);

    // Forward outbound messages from the channel to the WebSocket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Principal-scoped startup payload.
    match state.store.profile(principal).await {
        Ok(data) => {
            let _ = conn.send_frame(&ServerFrame::Push(PushFrame::Profile { data }));
        }
        Err(e) => debug!("No profile for principal {}: {}", principal, e),
    }

    // Ping interval for keepalive.
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &conn, msg).await {
                            warn!("Error handling message from {}: {:?}", conn_id, e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", conn_id, e);
                        break;
                    }
                    None => {
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if conn.tx.try_send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup
    state.registry.unregister(&conn_id);
    send_task.abort();

    counter!("relay_disconnections_total").increment(1);
    gauge!("relay_active_connections").set(state.registry.connection_count() as f64);

    info!("Connection {} closed", conn_id);
}

/// Handle a single WebSocket message.
async fn handle_message(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => handle_text(state, conn, &text).await,
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => handle_text(state, conn, text).await,
            Err(_) => {
                debug!("Dropping non-UTF-8 binary frame from {}", conn.id);
                Ok(())
            }
        },
        Message::Ping(data) => {
            conn.update_ping();
            let _ = conn.tx.try_send(Message::Pong(data));
            Ok(())
        }
        Message::Pong(_) => {
            conn.update_ping();
            Ok(())
        }
        Message::Close(_) => Ok(()),
    }
}

/// Decode and dispatch one text frame. A malformed frame gets a scoped
/// error reply when a request id can be recovered, and is otherwise
/// dropped.
async fn handle_text(state: &Arc<AppState>, conn: &Arc<ConnectionState>, text: &str) -> Result<()> {
    let frame = match ClientFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            counter!("relay_malformed_frames_total").increment(1);
            return match protocol::request_id(text) {
                Some(id) => conn.send_frame(&ServerFrame::Response(ResponseFrame::failure(
                    id,
                    format!("malformed frame: {}", e),
                ))),
                None => {
                    debug!("Dropping malformed frame from {}: {}", conn.id, e);
                    Ok(())
                }
            };
        }
    };
    handle_frame(state, conn, frame).await
}

/// Handle a decoded client frame.
async fn handle_frame(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    frame: ClientFrame,
) -> Result<()> {
    match frame {
        ClientFrame::Call(CallFrame { id, function, args }) => {
            debug!("Connection {} calling {}", conn.id, function);
            counter!("relay_calls_total").increment(1);
            let response = match state.store.invoke(&function, conn.principal, args).await {
                Ok(data) => ResponseFrame::success(id, data),
                Err(e) => ResponseFrame::failure(id, e.to_string()),
            };
            conn.send_frame(&ServerFrame::Response(response))
        }
        ClientFrame::Control(ControlFrame::Open {
            function,
            args,
            cursor,
            limit,
            stream,
        }) => {
            let doc_id = args.first().copied().unwrap_or(0);
            debug!("Connection {} opening {}:{}", conn.id, function, doc_id);
            pages::open_document(
                state,
                conn,
                &function,
                doc_id,
                cursor,
                limit,
                stream.unwrap_or(false),
            )
            .await
        }
        ClientFrame::Control(ControlFrame::Close { function, args }) => {
            let doc_id = args.first().copied().unwrap_or(0);
            let key = DocumentKey::new(function, doc_id);
            debug!("Connection {} closing {}", conn.id, key);
            state.registry.close(&conn.id, &key);
            Ok(())
        }
        ClientFrame::Control(ControlFrame::Fetch {
            id,
            function,
            args,
            cursor,
            limit,
        }) => {
            let doc_id = args.first().copied().unwrap_or(0);
            debug!("Connection {} fetching {}:{}", conn.id, function, doc_id);
            pages::fetch_page(state, conn, id, &function, doc_id, cursor, limit).await
        }
    }
}
