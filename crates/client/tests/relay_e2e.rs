//! End-to-end tests: a real relay server and a WebSocket client session
//! talking over loopback.

use client::{ConnectionStatus, DocumentState, Effect, OpenOptions, Session, SessionConfig};
use common::{ChangeOp, ChangeTarget, StoreChange};
use relay::{
    create_router, AppState, ChangeDispatcher, ConnectionRegistry, MemoryStore, StaticTokenAuth,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn start_relay(store: Arc<MemoryStore>) -> (String, Arc<AppState>, mpsc::Sender<()>) {
    let auth = Arc::new(StaticTokenAuth::new());
    auth.insert("secret", 1);

    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher = Arc::new(ChangeDispatcher::new(registry.clone(), store.clone()));
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let _ = dispatcher.run(shutdown_rx).await;
    });

    let state = Arc::new(AppState {
        registry,
        store,
        auth,
    });
    let app = create_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{}/ws", addr), state, shutdown_tx)
}

async fn wait_for(mut pred: impl FnMut() -> bool) {
    for _ in 0..300 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

#[tokio::test]
async fn test_snapshot_change_fanout_and_call() {
    let store = Arc::new(MemoryStore::new());
    store.register("thing", |_, args| {
        Ok(json!({"thing": {"id": args[0], "name": "A", "items": []}}))
    });
    store.register("rename_thing", |_, _| Ok(json!({"ok": true})));
    store.set_profile(1, json!({"principal": 1, "name": "dev"}));
    let (url, _state, _dispatcher) = start_relay(store.clone()).await;

    let session = Session::connect(SessionConfig::new(url, "secret"));
    wait_for(|| session.status().peek() == ConnectionStatus::Open).await;
    wait_for(|| session.profile().peek().is_some()).await;

    // Observe the document through an effect, the way application code
    // would.
    let doc = session.open("thing", 1, OpenOptions::default());
    let observed: Arc<Mutex<Vec<DocumentState>>> = Arc::new(Mutex::new(Vec::new()));
    let _effect = {
        let signal = doc.state();
        let observed = observed.clone();
        Effect::new(move || {
            observed.lock().unwrap().push(signal.get());
        })
    };

    wait_for(|| doc.state().peek().is_ready()).await;
    assert_eq!(
        doc.state().peek().value().unwrap(),
        &json!({"thing": {"id": 1, "name": "A", "items": []}})
    );

    // A changefeed event reaches the open document and merges in.
    store.emit(StoreChange::new(
        ChangeOp::Upsert,
        vec![ChangeTarget::new("thing", 1).with_collection("items", vec![])],
        json!({"id": 5, "title": "x"}),
    ));
    wait_for(|| {
        doc.state()
            .peek()
            .value()
            .map(|tree| tree["thing"]["items"] == json!([{"id": 5, "title": "x"}]))
            .unwrap_or(false)
    })
    .await;

    // The effect observed the merged states as they landed.
    {
        let observed = observed.lock().unwrap();
        assert!(!observed.is_empty());
        assert!(observed.iter().any(|state| state.is_ready()));
    }

    // Request/response calls share the connection.
    let result = session.call("rename_thing", vec![json!({"id": 1})]).await.unwrap();
    assert_eq!(result, json!({"ok": true}));

    session.shutdown().await;
    assert_eq!(session.status().peek(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_bad_token_is_rejected_permanently() {
    let store = Arc::new(MemoryStore::new());
    let (url, _state, _dispatcher) = start_relay(store).await;

    let session = Session::connect(SessionConfig::new(url, "wrong"));
    wait_for(|| session.status().peek() == ConnectionStatus::AuthFailed).await;

    match session.call("anything", vec![]).await {
        Err(client::ClientError::AuthRejected) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    session.shutdown().await;
}

#[tokio::test]
async fn test_streaming_pagination_delivers_every_page() {
    let store = Arc::new(MemoryStore::new());
    store.set_items("posts", (1..=5).map(|id| json!({"id": id})).collect());
    let (url, _state, _dispatcher) = start_relay(store).await;

    let session = Session::connect(SessionConfig::new(url, "secret"));
    let doc = session.open(
        "posts",
        0,
        OpenOptions {
            limit: Some(2),
            stream: true,
            ..OpenOptions::default()
        },
    );

    wait_for(|| {
        doc.state()
            .peek()
            .value()
            .and_then(|tree| tree["posts"].as_array().map(|items| items.len() == 5))
            .unwrap_or(false)
    })
    .await;
    assert!(!doc.page_status().has_more);

    // Streamed pages never duplicate ids.
    let tree = doc.state().peek().value().unwrap().clone();
    let ids: Vec<i64> = tree["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    session.shutdown().await;
}

#[tokio::test]
async fn test_load_more_pages_through_cursor() {
    let store = Arc::new(MemoryStore::new());
    store.set_items("posts", (1..=5).map(|id| json!({"id": id})).collect());
    let (url, _state, _dispatcher) = start_relay(store).await;

    let session = Session::connect(SessionConfig::new(url, "secret"));
    let doc = session.open(
        "posts",
        0,
        OpenOptions {
            limit: Some(2),
            ..OpenOptions::default()
        },
    );
    wait_for(|| doc.state().peek().is_ready()).await;
    assert_eq!(doc.state().peek().value().unwrap()["posts"], json!([{"id": 1}, {"id": 2}]));
    assert!(doc.page_status().has_more);

    assert!(session.load_more(&doc).await.unwrap());
    assert_eq!(
        doc.state().peek().value().unwrap()["posts"],
        json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}])
    );

    assert!(!session.load_more(&doc).await.unwrap());
    assert_eq!(
        doc.state().peek().value().unwrap()["posts"],
        json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}, {"id": 5}])
    );

    // Exhausted: safe no-op.
    assert!(!session.load_more(&doc).await.unwrap());

    session.shutdown().await;
}

#[tokio::test]
async fn test_closed_document_receives_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.register("thing", |_, args| Ok(json!({"thing": {"id": args[0], "items": []}})));
    let (url, state, _dispatcher) = start_relay(store.clone()).await;

    let session = Session::connect(SessionConfig::new(url, "secret"));
    let doc = session.open("thing", 1, OpenOptions::default());
    wait_for(|| doc.state().peek().is_ready()).await;

    session.close("thing", 1);
    wait_for(|| state.registry.subscription_count() == 0).await;

    store.emit(StoreChange::new(
        ChangeOp::Upsert,
        vec![ChangeTarget::new("thing", 1).with_collection("items", vec![])],
        json!({"id": 9}),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        doc.state().peek().value().unwrap()["thing"]["items"],
        json!([])
    );

    session.shutdown().await;
}
