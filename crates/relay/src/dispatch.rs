//! Change dispatcher: backing-store changefeed → WebSocket fan-out.
//!
//! Consumes the store's change stream and routes each event to the
//! connections subscribed to its target document keys.

use crate::connection::ConnectionRegistry;
use crate::error::{RelayError, Result};
use crate::store::BackingStore;
use common::{NotifyFrame, PushFrame, ServerFrame, StoreChange};
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Routes store changes to subscribed WebSocket connections.
pub struct ChangeDispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn BackingStore>,
}

impl ChangeDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn BackingStore>) -> Self {
        Self { registry, store }
    }

    /// Run the dispatcher until the changefeed ends or shutdown is
    /// signaled.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let mut changes = self.store.changes().await?;
        info!("ChangeDispatcher running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("ChangeDispatcher received shutdown signal");
                    break;
                }

                change = changes.next() => {
                    match change {
                        Some(change) => self.dispatch(&change),
                        None => {
                            warn!("Changefeed ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        info!("ChangeDispatcher stopped");
        Ok(())
    }

    /// Fan one change event out to its subscribers.
    ///
    /// A change may name several targets; each target is serialized once
    /// and delivered once per (connection, target) pair. A connection
    /// holding two of the event's keys open receives two notifications.
    pub fn dispatch(&self, change: &StoreChange) {
        counter!("relay_changes_received_total").increment(1);

        for target in &change.targets {
            let key = target.key();
            let subscribers = self.registry.subscribers(&key);
            if subscribers.is_empty() {
                debug!("No subscribers for {}", key);
                continue;
            }

            let frame = ServerFrame::Push(PushFrame::Notify(NotifyFrame {
                doc: target.doc.clone(),
                doc_id: target.doc_id,
                op: change.op,
                collection: target.collection.clone(),
                parent_ids: target.parent_ids.clone(),
                data: change.data.clone(),
                cursor: None,
                has_more: None,
            }));
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize notification for {}: {}", key, e);
                    counter!("relay_dispatch_errors_total").increment(1);
                    continue;
                }
            };

            debug!("Routing {} change to {} connections", key, subscribers.len());

            for conn in subscribers {
                match conn.send_text(text.clone()) {
                    Ok(()) => {
                        counter!("relay_notifications_sent_total").increment(1);
                    }
                    Err(RelayError::SlowClient) => {
                        warn!("Dropping notification to slow connection {}", conn.id);
                        counter!("relay_dispatch_errors_total").increment(1);
                    }
                    Err(_) => {
                        warn!("Connection {} gone, removing from registry", conn.id);
                        counter!("relay_dispatch_errors_total").increment(1);
                        self.registry.unregister(&conn.id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, OUTBOUND_BUFFER_SIZE};
    use crate::memory::MemoryStore;
    use axum::extract::ws::Message;
    use common::{ChangeOp, ChangeTarget, DocumentKey};
    use serde_json::json;

    fn make_conn(
        registry: &ConnectionRegistry,
    ) -> (Arc<ConnectionState>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let conn = Arc::new(ConnectionState::new(1, tx));
        registry.register(conn.clone());
        (conn, rx)
    }

    fn make_dispatcher(registry: Arc<ConnectionRegistry>) -> ChangeDispatcher {
        ChangeDispatcher::new(registry, Arc::new(MemoryStore::new()))
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                frames.push(text.to_string());
            }
        }
        frames
    }

    #[test]
    fn test_fanout_completeness() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, mut rx_a) = make_conn(&registry);
        let (b, mut rx_b) = make_conn(&registry);
        let (_c, mut rx_c) = make_conn(&registry);

        let key = DocumentKey::new("thing", 7);
        registry.open(&a.id, key.clone()).unwrap();
        registry.open(&b.id, key).unwrap();

        let dispatcher = make_dispatcher(registry);
        dispatcher.dispatch(&StoreChange::new(
            ChangeOp::Upsert,
            vec![ChangeTarget::new("thing", 7).with_collection("items", vec![])],
            json!({"id": 5}),
        ));

        // Exactly one notification per subscribed connection, none for
        // the connection without the key open.
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 0);
    }

    #[test]
    fn test_multi_target_delivers_once_per_target() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = make_conn(&registry);
        registry.open(&conn.id, DocumentKey::new("thing", 7)).unwrap();
        registry.open(&conn.id, DocumentKey::new("things", 0)).unwrap();

        let dispatcher = make_dispatcher(registry);
        dispatcher.dispatch(&StoreChange::new(
            ChangeOp::Upsert,
            vec![
                ChangeTarget::new("thing", 7),
                ChangeTarget::new("things", 0).with_collection("things", vec![]),
            ],
            json!({"id": 7, "name": "A"}),
        ));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"doc\":\"thing\""));
        assert!(frames[1].contains("\"doc\":\"things\""));
    }

    #[test]
    fn test_dead_connection_is_dropped_from_registry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (dead, rx_dead) = make_conn(&registry);
        let (live, mut rx_live) = make_conn(&registry);

        let key = DocumentKey::new("posts", 0);
        registry.open(&dead.id, key.clone()).unwrap();
        registry.open(&live.id, key.clone()).unwrap();
        drop(rx_dead);

        let dispatcher = make_dispatcher(registry.clone());
        dispatcher.dispatch(&StoreChange::new(
            ChangeOp::Append,
            vec![ChangeTarget::new("posts", 0)],
            json!({"posts": [{"id": 3}]}),
        ));

        // The live connection still got its notification and the dead
        // one no longer subscribes.
        assert_eq!(drain(&mut rx_live).len(), 1);
        let remaining = registry.subscribers(&key);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, live.id);
    }

    #[test]
    fn test_notify_carries_target_location() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = make_conn(&registry);
        registry.open(&conn.id, DocumentKey::new("thing", 1)).unwrap();

        let dispatcher = make_dispatcher(registry);
        dispatcher.dispatch(&StoreChange::new(
            ChangeOp::Upsert,
            vec![ChangeTarget::new("thing", 1)
                .with_collection("packages.allocations.options", vec![2, 3])],
            json!({"id": 7, "label": "L"}),
        ));

        let frames = drain(&mut rx);
        let frame = common::ServerFrame::decode(&frames[0]).unwrap();
        match frame {
            ServerFrame::Push(PushFrame::Notify(n)) => {
                assert_eq!(n.collection.as_deref(), Some("packages.allocations.options"));
                assert_eq!(n.parent_ids, Some(vec![2, 3]));
                assert_eq!(n.op, ChangeOp::Upsert);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
