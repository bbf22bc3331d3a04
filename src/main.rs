// vecgate - HA router and WAL replication layer for a vector-database pair
//
// Clients talk to one endpoint; vecgate routes reads to a healthy
// instance, records every write durably before forwarding it, replays
// queued writes to instances that were unreachable, and keeps the
// name <-> identifier mapping between the two backends consistent.
//
// Architecture:
// - Router (axum): classifies, rewrites, and forwards client requests
// - Coordination DB (SQLite): mappings, WAL, transaction safety log
// - Health monitor: probes both instances, drives failover decisions
// - WAL replayer: drains deferred writes against recovered instances
// - Auto-creator: mirrors collection creations onto the other instance
// - Alert sink: operational events to Slack

mod alerts;
mod automap;
mod cli;
mod config;
mod db;
mod events;
mod health;
mod memory;
mod paths;
mod replayer;
mod router;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use config::Config;
use tokio::sync::{mpsc, oneshot, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long background tasks get to finish their current unit of work
/// after shutdown is signalled
const DRAIN_DEADLINE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    // Configuration errors must produce a clean non-zero exit before any
    // task is spawned
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vecgate: configuration error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    // Keep the file-appender guard alive for the life of the process
    let _log_guard = init_tracing(&config);

    if let Err(e) = run(config, args.check_config).await {
        tracing::error!("Fatal: {e:#}");
        std::process::exit(1);
    }
}

/// Initialize tracing with stdout output and optional rolling file logs.
/// Precedence: RUST_LOG env var > configured level.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = format!(
        "vecgate={},tower_http=debug,axum=debug",
        config.logging.level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    match &config.logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vecgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

async fn run(config: Config, check_only: bool) -> Result<()> {
    tracing::info!("vecgate {} starting", config::VERSION);
    tracing::info!(
        "Backends: primary={} replica={}",
        config.primary_url,
        config.replica_url
    );

    // The pool doubles as the write-stampede gate, so keep a few
    // connections beyond the worker count for admin reads
    let pool_size = (config.max_workers as u32).saturating_add(4);
    let database = db::Database::open(&config.database_path, pool_size)?;
    tracing::info!("Coordination database ready at {:?}", config.database_path);

    if check_only {
        println!("configuration ok; database reachable");
        return Ok(());
    }

    let registry =
        health::InstanceRegistry::new(config.primary_url.clone(), config.replica_url.clone());
    let mappings = db::MappingStore::new(database.clone());
    match mappings.preload() {
        Ok(n) => tracing::info!("Mapping cache warmed with {n} entries"),
        Err(e) => tracing::warn!("Mapping cache preload failed: {e:#}"),
    }
    let wal = db::WalStore::new(database.clone(), config.wal_retry_max);
    let txn_log = db::TransactionLog::new(database.clone(), config.wal_retry_max);
    let forwarder =
        router::forward::Forwarder::new(config.request_timeout, config.max_workers)?;
    let memory_watcher = memory::MemoryWatcher::new(config.memory_pressure_bytes());

    // Channels: operational events to the alert sink, creations to the
    // auto-creator, a watch for worker shutdown, a oneshot for the server
    let (event_tx, event_rx) = mpsc::channel(256);
    let (automap_tx, automap_rx) = mpsc::channel(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel();

    let alert_handle = {
        let sink = alerts::AlertSink::new(config.slack_webhook_url.clone(), event_rx)?;
        tokio::spawn(sink.run())
    };

    let monitor_handle = {
        let monitor = health::HealthMonitor::new(
            registry.clone(),
            database.clone(),
            config.health_check_interval,
            config.health_failure_threshold,
            event_tx.clone(),
        )?;
        tokio::spawn(monitor.run(shutdown_rx.clone()))
    };

    let replayer_handle = {
        let replayer = replayer::WalReplayer::new(
            registry.clone(),
            database.clone(),
            mappings.clone(),
            wal.clone(),
            forwarder.clone(),
            memory_watcher.clone(),
            event_tx.clone(),
            config.wal_batch_size,
            config.wal_sync_interval,
        );
        tokio::spawn(replayer.run(shutdown_rx.clone()))
    };

    let automap_handle = {
        let mapper = automap::AutoMapper::new(
            registry.clone(),
            mappings.clone(),
            wal.clone(),
            forwarder.clone(),
            automap_rx,
        );
        tokio::spawn(mapper.run(shutdown_rx.clone()))
    };

    let sampler_handle = tokio::spawn(memory::run_sampler(
        memory_watcher.clone(),
        event_tx.clone(),
        shutdown_rx.clone(),
    ));

    let cleanup_handle = tokio::spawn(replayer::run_retention_cleanup(
        database.clone(),
        config.retention.clone(),
        shutdown_rx.clone(),
    ));

    let state = router::RouterState {
        config: Arc::new(config),
        registry,
        db: database,
        mappings,
        wal,
        txn_log,
        forwarder,
        memory: memory_watcher,
        event_tx,
        automap_tx,
        started_at: chrono::Utc::now(),
    };

    let server_handle = tokio::spawn(router::start_router(state, server_shutdown_rx));

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down...");

    // Stop accepting traffic first, then drain the workers
    let _ = server_shutdown_tx.send(());
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = server_handle.await;
        for handle in [
            monitor_handle,
            replayer_handle,
            automap_handle,
            sampler_handle,
            cleanup_handle,
        ] {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
        tracing::warn!(
            "Drain deadline ({DRAIN_DEADLINE:?}) elapsed; abandoning remaining tasks"
        );
    }

    // The alert sink drains once every sender is gone; don't wait past
    // the deadline for it
    alert_handle.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (the platform sends SIGTERM on deploys)
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C");
    }
}
