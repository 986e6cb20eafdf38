//! Relay service entry point.
//!
//! WebSocket relay for real-time document subscriptions, wired to the
//! in-memory reference store. Replace [`MemoryStore`] with a real
//! [`relay::BackingStore`] implementation to serve production data.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use relay::{
    create_router, AppState, ChangeDispatcher, ConnectionRegistry, MemoryStore, StaticTokenAuth,
};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Connections idle longer than this are dropped by the cleanup task.
const STALE_CONNECTION_MS: i64 = 120_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting relay service");

    // Read configuration from environment
    let http_port: u16 = env::var("RELAY_PORT")
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .expect("RELAY_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9093".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let token_spec = env::var("RELAY_TOKENS").unwrap_or_else(|_| "dev:1".to_string());

    info!("Configuration:");
    info!("  RELAY_PORT: {}", http_port);
    info!("  METRICS_PORT: {}", metrics_port);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Reference store; swap for a production BackingStore implementation.
    let store = Arc::new(MemoryStore::new());
    store.set_profile(1, json!({"principal": 1, "name": "dev"}));
    store.register_value("server_info", json!({"name": "relay", "version": env!("CARGO_PKG_VERSION")}));

    let auth = Arc::new(StaticTokenAuth::from_spec(&token_spec));
    let registry = Arc::new(ConnectionRegistry::new());

    // Changefeed dispatcher
    let dispatcher = Arc::new(ChangeDispatcher::new(registry.clone(), store.clone()));
    let (dispatcher_shutdown_tx, dispatcher_shutdown_rx) = mpsc::channel(1);
    let dispatcher_handle = tokio::spawn(async move {
        if let Err(e) = dispatcher.run(dispatcher_shutdown_rx).await {
            error!("Dispatcher error: {:?}", e);
        }
    });

    // Stale connection cleanup
    let cleanup_registry = registry.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            cleanup_registry.cleanup_stale(STALE_CONNECTION_MS);
        }
    });

    // Create application state
    let state = Arc::new(AppState {
        registry,
        store,
        auth,
    });

    // Create HTTP router
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown dispatcher
    info!("Shutting down dispatcher...");
    let _ = dispatcher_shutdown_tx.send(()).await;
    let _ = dispatcher_handle.await;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
