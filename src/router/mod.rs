// Router module - HTTP entry point for client traffic and the admin surface
//
// Every client request lands in the catch-all handler, which classifies
// it, picks a target instance, rewrites collection identifiers, records
// write transactions and WAL entries, and forwards. Admin endpoints for
// operators are mounted above the catch-all.

pub mod admin;
pub mod classify;
pub mod error;
pub mod forward;
pub mod handler;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::any, routing::delete, routing::get, routing::post, Router};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::automap::CreatedCollection;
use crate::config::Config;
use crate::db::{Database, MappingStore, TransactionLog, WalStore};
use crate::events::RouterEvent;
use crate::health::InstanceRegistry;
use crate::memory::MemoryWatcher;
use forward::Forwarder;
use handler::route_request;

/// Shared state for the router
#[derive(Clone)]
pub struct RouterState {
    pub config: Arc<Config>,
    /// The backend pair with live health state
    pub registry: InstanceRegistry,
    pub db: Database,
    pub mappings: MappingStore,
    pub wal: WalStore,
    pub txn_log: TransactionLog,
    /// Outbound HTTP plumbing, bounded by the worker pool
    pub forwarder: Forwarder,
    pub memory: Arc<MemoryWatcher>,
    /// Operational events to the alert sink
    pub event_tx: mpsc::Sender<RouterEvent>,
    /// Successful collection creations handed to the auto-creator
    pub automap_tx: mpsc::Sender<CreatedCollection>,
    pub started_at: DateTime<Utc>,
}

/// Start the router server
pub async fn start_router(
    state: RouterState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = state.config.bind_addr;

    // Admin surface first, catch-all proxy handler last
    let app = Router::new()
        .route("/health", get(admin::health))
        .route("/status", get(admin::status))
        .route("/wal/status", get(admin::wal_status))
        .route("/wal/cleanup", post(admin::wal_cleanup))
        .route("/collection/mappings", get(admin::list_mappings))
        .route("/collection/mappings/:name", delete(admin::delete_mapping))
        .route("/transaction/safety/status", get(admin::txn_status))
        .route(
            "/transaction/safety/transaction/:id",
            get(admin::txn_get),
        )
        .route(
            "/transaction/safety/recovery/trigger",
            post(admin::txn_recover),
        )
        .route("/transaction/safety/cleanup", post(admin::txn_cleanup))
        // Legacy aliases kept for older operational tooling
        .route("/admin/wal_count", get(admin::wal_count))
        .route("/admin/transaction_safety_status", get(admin::txn_status))
        .route("/metrics/performance", get(admin::performance))
        // Proxy handler (catch-all)
        .route("/*path", any(route_request))
        .with_state(state);

    tracing::info!("Starting router on {}", bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Router listening on {}", bind_addr);

    // Stop accepting new connections on shutdown and drain in-flight
    // requests
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Router shut down gracefully");
    Ok(())
}

/// Cheap process-local randomness for the read-replica split.
///
/// RandomState gives a uniformly seeded hash without adding an RNG
/// dependency for a single coin flip per read.
pub(crate) fn pseudo_random() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}
