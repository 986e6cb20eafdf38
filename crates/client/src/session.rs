//! Connection session: reconnect state machine, pending calls, and the
//! per-document signal registry.
//!
//! One [`Session`] owns one logical connection to the relay. It is
//! created explicitly with [`Session::connect`] and torn down with
//! [`Session::shutdown`]; consumers receive it by reference, there is no
//! process-wide singleton.
//!
//! The connection lifecycle is an explicit state machine:
//!
//! ```text
//! Connecting ──ok──► Open ──close/error──► Backoff(delay) ──timer──► Connecting
//!     │                                        (delay doubles up to the cap,
//!     └──auth rejected──► AuthFailed            resets to base on success)
//! ```
//!
//! Frames sent while disconnected queue up (unbounded, per the baseline
//! contract) and flush after the next successful connect, after every
//! registered document has been re-opened. All pending calls are
//! rejected whenever the connection drops.

use crate::error::ClientError;
use crate::merge::{merge, DocShape, DocumentState};
use crate::reactive::Signal;
use crate::transport::{
    endpoint_with_token, FrameSink, FrameStream, Transport, TransportError, WsTransport,
};
use common::{
    CallFrame, ChangeOp, ClientFrame, ControlFrame, DocumentKey, NotifyFrame, PageResult,
    PushFrame, ServerFrame,
};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for a relay session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint, e.g. `ws://localhost:8082/ws`.
    pub url: String,
    /// Bearer token resolved to a principal by the relay.
    pub token: String,
    /// Initial reconnect delay.
    pub base_delay: Duration,
    /// Reconnect delay cap.
    pub max_delay: Duration,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ping_interval: Duration::from_secs(20),
        }
    }
}

/// Connection lifecycle states, driven by transport events and the
/// backoff timer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Backoff(Duration),
    /// Credentials were rejected; the session will not retry.
    AuthFailed,
    /// Shut down by the application.
    Closed,
}

/// Options for opening a document.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub stream: bool,
}

/// Cursor state of a paginated document.
#[derive(Debug, Clone, Default)]
pub struct PageStatus {
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Client-side handle for one open document: its reactive state signal,
/// its shape descriptor, and its pagination cursor.
pub struct DocumentHandle {
    key: DocumentKey,
    options: OpenOptions,
    signal: Signal<DocumentState>,
    shape: Mutex<Option<DocShape>>,
    pages: Mutex<PageStatus>,
}

impl DocumentHandle {
    fn new(key: DocumentKey, options: OpenOptions) -> Self {
        Self {
            key,
            options,
            signal: Signal::new(DocumentState::Empty),
            shape: Mutex::new(None),
            pages: Mutex::new(PageStatus::default()),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// The document's state signal; read it from effects to react to
    /// merges.
    pub fn state(&self) -> Signal<DocumentState> {
        self.signal.clone()
    }

    pub fn page_status(&self) -> PageStatus {
        self.pages.lock().unwrap().clone()
    }

    /// Apply one notification. The shape lock is held across the merge,
    /// so exactly one merge runs per document at a time, in arrival
    /// order.
    fn apply_notify(&self, frame: &NotifyFrame) {
        if frame.cursor.is_some() || frame.has_more.is_some() {
            let mut pages = self.pages.lock().unwrap();
            pages.cursor = frame.cursor.clone();
            pages.has_more = frame.has_more.unwrap_or(false);
        }
        let mut shape = self.shape.lock().unwrap();
        let next = merge(self.signal.peek(), &mut shape, frame);
        self.signal.set(next);
    }

    /// Merge an explicitly fetched page as an append.
    fn apply_page(&self, page: &PageResult) {
        self.apply_notify(&NotifyFrame {
            doc: self.key.function.clone(),
            doc_id: self.key.doc_id,
            op: ChangeOp::Append,
            collection: None,
            parent_ids: None,
            data: page.data.clone(),
            cursor: page.cursor.clone(),
            has_more: Some(page.has_more),
        });
    }

    fn apply_error(&self, error: String) {
        self.signal.set(DocumentState::Failed(error));
    }

    fn open_frame(&self) -> ClientFrame {
        ClientFrame::Control(ControlFrame::Open {
            function: self.key.function.clone(),
            args: vec![self.key.doc_id],
            cursor: self.options.cursor.clone(),
            limit: self.options.limit,
            stream: self.options.stream.then_some(true),
        })
    }
}

/// Items on the outbound queue. Document opens and closes travel as
/// keys, not pre-encoded frames, so the connection loop can deduplicate
/// them against the re-open pass that runs after every reconnect.
enum Outbound {
    Frame(String),
    OpenDoc(DocumentKey),
    CloseDoc(DocumentKey),
}

struct SessionInner {
    config: SessionConfig,
    pending: DashMap<u64, oneshot::Sender<Result<Value, ClientError>>>,
    next_id: AtomicU64,
    documents: DashMap<DocumentKey, Arc<DocumentHandle>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    status: Signal<ConnectionStatus>,
    profile: Signal<Option<Value>>,
}

impl SessionInner {
    fn reject_pending(&self, error: impl Fn() -> ClientError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(error()));
            }
        }
    }

    /// Route one inbound frame. Events for a document are applied in
    /// arrival order; a malformed frame is logged and dropped.
    fn handle_text(&self, text: &str) {
        match ServerFrame::decode(text) {
            Ok(ServerFrame::Response(response)) => {
                let Some((_, tx)) = self.pending.remove(&response.id) else {
                    debug!("Response for unknown call {}", response.id);
                    return;
                };
                let result = if response.ok {
                    Ok(response.data.unwrap_or(Value::Null))
                } else {
                    Err(ClientError::Call(
                        response.error.unwrap_or_else(|| "unknown error".into()),
                    ))
                };
                let _ = tx.send(result);
            }
            Ok(ServerFrame::Push(PushFrame::Notify(frame))) => {
                let key = DocumentKey::new(frame.doc.clone(), frame.doc_id);
                let handle = self.documents.get(&key).map(|h| h.clone());
                match handle {
                    Some(handle) => handle.apply_notify(&frame),
                    None => debug!("Notification for closed document {}", key),
                }
            }
            Ok(ServerFrame::Push(PushFrame::Error {
                function,
                doc_id,
                error,
            })) => {
                let key = DocumentKey::new(function, doc_id);
                let handle = self.documents.get(&key).map(|h| h.clone());
                if let Some(handle) = handle {
                    handle.apply_error(error);
                }
            }
            Ok(ServerFrame::Push(PushFrame::Profile { data })) => {
                self.profile.set(Some(data));
            }
            Err(e) => warn!("Dropping malformed server frame: {}", e),
        }
    }
}

/// One logical connection to the relay.
pub struct Session {
    inner: Arc<SessionInner>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect over WebSocket and return the session handle. The
    /// connection is established (and re-established) in the
    /// background.
    pub fn connect(config: SessionConfig) -> Arc<Self> {
        Self::with_transport(config, Arc::new(WsTransport::new()))
    }

    /// Connect through a custom transport.
    pub fn with_transport(config: SessionConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            config,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            documents: DashMap::new(),
            outbound_tx,
            status: Signal::new(ConnectionStatus::Connecting),
            profile: Signal::new(None),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(
            inner.clone(),
            transport,
            outbound_rx,
            shutdown_rx,
        ));
        Arc::new(Self {
            inner,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Connection status signal. `AuthFailed` is terminal.
    pub fn status(&self) -> Signal<ConnectionStatus> {
        self.inner.status.clone()
    }

    /// Principal-scoped startup payload, set once per connection.
    pub fn profile(&self) -> Signal<Option<Value>> {
        self.inner.profile.clone()
    }

    /// Invoke a named backing function and await its response.
    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        self.request(|id| {
            ClientFrame::Call(CallFrame {
                id,
                function: function.to_string(),
                args,
            })
        })
        .await
    }

    /// Fetch one page inline without touching the subscription.
    pub async fn fetch(
        &self,
        function: &str,
        doc_id: i64,
        cursor: Option<String>,
        limit: Option<u32>,
    ) -> Result<PageResult, ClientError> {
        let data = self
            .request(|id| {
                ClientFrame::Control(ControlFrame::Fetch {
                    id,
                    function: function.to_string(),
                    args: vec![doc_id],
                    cursor,
                    limit,
                })
            })
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Open a document subscription. Idempotent: opening an already-open
    /// key returns the existing handle.
    pub fn open(&self, function: &str, doc_id: i64, options: OpenOptions) -> Arc<DocumentHandle> {
        let key = DocumentKey::new(function, doc_id);
        let mut created = false;
        let handle = self
            .inner
            .documents
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(DocumentHandle::new(key.clone(), options))
            })
            .clone();
        if created {
            let _ = self.inner.outbound_tx.send(Outbound::OpenDoc(key));
        }
        handle
    }

    /// Close a document subscription. Closing a document that is not
    /// open is a no-op.
    pub fn close(&self, function: &str, doc_id: i64) {
        let key = DocumentKey::new(function, doc_id);
        if self.inner.documents.remove(&key).is_some() {
            let _ = self.inner.outbound_tx.send(Outbound::CloseDoc(key));
        }
    }

    /// Fetch the next page for a paginated document and merge it locally
    /// as an append. Returns whether more pages remain; calling with no
    /// pages left is a safe no-op.
    pub async fn load_more(&self, doc: &DocumentHandle) -> Result<bool, ClientError> {
        let pages = doc.page_status();
        if !pages.has_more {
            return Ok(false);
        }
        let page = self
            .fetch(
                &doc.key().function,
                doc.key().doc_id,
                pages.cursor,
                doc.options().limit,
            )
            .await?;
        doc.apply_page(&page);
        Ok(page.has_more)
    }

    /// Tear the session down: close the connection, stop reconnecting,
    /// reject anything still pending.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<Value, ClientError> {
        match self.inner.status.peek() {
            ConnectionStatus::AuthFailed => return Err(ClientError::AuthRejected),
            ConnectionStatus::Closed => return Err(ClientError::Closed),
            _ => {}
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        match build(id).encode() {
            Ok(text) => {
                if self.inner.outbound_tx.send(Outbound::Frame(text)).is_err() {
                    self.inner.pending.remove(&id);
                    return Err(ClientError::Closed);
                }
            }
            Err(e) => {
                self.inner.pending.remove(&id);
                return Err(e.into());
            }
        }

        rx.await.map_err(|_| ClientError::Disconnected)?
    }
}

/// Next reconnect delay: double, capped.
pub(crate) fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Send one outbound item, tracking which documents have already been
/// opened on this connection. On a send failure the item is handed back
/// so it can retry on the next connection.
async fn deliver(
    sink: &mut Box<dyn FrameSink>,
    inner: &SessionInner,
    opened: &mut std::collections::HashSet<DocumentKey>,
    item: Outbound,
) -> Result<(), Outbound> {
    match item {
        Outbound::Frame(text) => {
            if sink.send(&text).await.is_err() {
                return Err(Outbound::Frame(text));
            }
        }
        Outbound::OpenDoc(key) => {
            if opened.contains(&key) {
                return Ok(());
            }
            let Some(handle) = inner.documents.get(&key).map(|h| h.clone()) else {
                return Ok(());
            };
            match handle.open_frame().encode() {
                Ok(text) => {
                    if sink.send(&text).await.is_err() {
                        return Err(Outbound::OpenDoc(key));
                    }
                    opened.insert(key);
                }
                Err(e) => warn!("Failed to encode open frame for {}: {}", key, e),
            }
        }
        Outbound::CloseDoc(key) => {
            opened.remove(&key);
            let frame = ClientFrame::Control(ControlFrame::Close {
                function: key.function.clone(),
                args: vec![key.doc_id],
            });
            match frame.encode() {
                Ok(text) => {
                    if sink.send(&text).await.is_err() {
                        return Err(Outbound::CloseDoc(key));
                    }
                }
                Err(e) => warn!("Failed to encode close frame for {}: {}", key, e),
            }
        }
    }
    Ok(())
}

async fn run_session(
    inner: Arc<SessionInner>,
    transport: Arc<dyn Transport>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let endpoint = match endpoint_with_token(&inner.config.url, &inner.config.token) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("Invalid relay endpoint {}: {}", inner.config.url, e);
            inner.reject_pending(|| ClientError::Closed);
            inner.status.set(ConnectionStatus::Closed);
            return;
        }
    };

    let mut delay = inner.config.base_delay;
    // Items that failed mid-send; they go out first after reconnecting.
    let mut retry_queue: VecDeque<Outbound> = VecDeque::new();

    'reconnect: loop {
        if *shutdown_rx.borrow() {
            break;
        }
        inner.status.set(ConnectionStatus::Connecting);

        let result = tokio::select! {
            _ = shutdown_rx.changed() => break 'reconnect,
            result = transport.connect(&endpoint) => result,
        };

        let (mut sink, mut stream) = match result {
            Ok(pair) => pair,
            Err(TransportError::AuthRejected) => {
                warn!("Authentication rejected, giving up");
                inner.reject_pending(|| ClientError::AuthRejected);
                inner.status.set(ConnectionStatus::AuthFailed);
                return;
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                inner.status.set(ConnectionStatus::Backoff(delay));
                tokio::select! {
                    _ = shutdown_rx.changed() => break 'reconnect,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_delay(delay, inner.config.max_delay);
                continue;
            }
        };

        info!("Connected to {}", inner.config.url);
        delay = inner.config.base_delay;
        inner.status.set(ConnectionStatus::Open);

        // Re-open every registered document so the relay repopulates its
        // registry and pushes fresh snapshots, then flush anything that
        // failed to send on the previous connection. Queued opens for
        // documents covered by the re-open pass deduplicate against it.
        let mut opened = std::collections::HashSet::new();
        let mut failed = false;
        let reopen: Vec<DocumentKey> = inner
            .documents
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in reopen {
            if let Err(item) = deliver(&mut sink, &inner, &mut opened, Outbound::OpenDoc(key)).await
            {
                retry_queue.push_front(item);
                failed = true;
                break;
            }
        }
        while !failed {
            let Some(item) = retry_queue.pop_front() else {
                break;
            };
            if let Err(item) = deliver(&mut sink, &inner, &mut opened, item).await {
                retry_queue.push_front(item);
                failed = true;
            }
        }

        if !failed {
            let mut ping = tokio::time::interval(inner.config.ping_interval);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ping.reset();

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        sink.close().await;
                        inner.reject_pending(|| ClientError::Closed);
                        inner.status.set(ConnectionStatus::Closed);
                        return;
                    }

                    msg = stream.next() => {
                        match msg {
                            Some(Ok(text)) => inner.handle_text(&text),
                            Some(Err(e)) => {
                                warn!("Connection error: {}", e);
                                break;
                            }
                            None => {
                                info!("Connection closed by server");
                                break;
                            }
                        }
                    }

                    out = outbound_rx.recv() => {
                        match out {
                            Some(item) => {
                                if let Err(item) =
                                    deliver(&mut sink, &inner, &mut opened, item).await
                                {
                                    warn!("Send failed, reconnecting");
                                    retry_queue.push_back(item);
                                    break;
                                }
                            }
                            None => {
                                sink.close().await;
                                inner.status.set(ConnectionStatus::Closed);
                                return;
                            }
                        }
                    }

                    _ = ping.tick() => {
                        if sink.ping().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        // Disconnected: in-flight calls are rejected, then back off.
        inner.reject_pending(|| ClientError::Disconnected);
        inner.status.set(ConnectionStatus::Backoff(delay));
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay, inner.config.max_delay);
    }

    inner.reject_pending(|| ClientError::Closed);
    inner.status.set(ConnectionStatus::Closed);
}
