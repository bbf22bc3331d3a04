// WAL replayer - drains deferred writes against recovered instances
//
// Each pass claims a batch per healthy target, groups entries by
// collection, and replays groups concurrently with strict order inside a
// group. A retryable failure stops its group for the pass (later entries
// in the same collection must not overtake), while other groups keep
// going. The batch size adapts to memory pressure and the pass interval
// shrinks under backlog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};

use crate::automap::{self, CreateError};
use crate::db::wal::{WalEntry, WalStatus};
use crate::db::{oplog, Database, MappingStore, RewriteOutcome, WalStore};
use crate::events::RouterEvent;
use crate::health::{Instance, InstanceName, InstanceRegistry};
use crate::memory::MemoryWatcher;
use crate::paths::{self, CollectionRef};
use crate::router::forward::{ForwardError, Forwarder};

/// Outcome of replaying one entry, controls the group loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replayed {
    Synced,
    /// Retryable failure - the group stops so order is preserved
    Retry,
    /// Permanent rejection - recorded, the group continues
    Permanent,
}

pub struct WalReplayer {
    registry: InstanceRegistry,
    db: Database,
    mappings: MappingStore,
    wal: WalStore,
    forwarder: Forwarder,
    memory: Arc<MemoryWatcher>,
    event_tx: mpsc::Sender<RouterEvent>,
    batch_size: usize,
    interval: Duration,
    worker_id: String,
}

impl WalReplayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: InstanceRegistry,
        db: Database,
        mappings: MappingStore,
        wal: WalStore,
        forwarder: Forwarder,
        memory: Arc<MemoryWatcher>,
        event_tx: mpsc::Sender<RouterEvent>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            db,
            mappings,
            wal,
            forwarder,
            memory,
            event_tx,
            batch_size,
            interval,
            worker_id: format!("replayer-{}", std::process::id()),
        }
    }

    /// Run until shutdown. The current entry is allowed to finish; the
    /// rest of the claimed batch stays `executed` and is re-claimed after
    /// the staleness window (replayed writes are idempotent by design).
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            "WAL replayer started (batch {}, interval {:?})",
            self.batch_size,
            self.interval
        );

        loop {
            let backlog = self.pass(&mut shutdown_rx).await;
            if *shutdown_rx.borrow() {
                tracing::info!("WAL replayer shutting down");
                return;
            }

            // Adaptive pacing: a deep backlog shrinks the sleep
            let sleep = if backlog > self.batch_size as u64 {
                (self.interval / 4).max(Duration::from_secs(1))
            } else {
                self.interval
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("WAL replayer shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over all healthy targets; returns the remaining backlog
    async fn pass(&self, shutdown_rx: &mut watch::Receiver<bool>) -> u64 {
        let batch = self.effective_batch();
        if let Err(e) = oplog::upsert_worker_heartbeat(
            &self.db,
            &self.worker_id,
            batch,
            self.memory.under_pressure(),
        ) {
            tracing::debug!("Worker heartbeat not recorded: {e:#}");
        }

        for instance in self.registry.healthy() {
            if *shutdown_rx.borrow() {
                return 0;
            }
            if let Err(e) = self.drain_target(&instance, batch, shutdown_rx).await {
                tracing::error!("Replay pass for {} failed: {e:#}", instance.name);
            }
        }

        self.wal.counts().map(|c| c.backlog()).unwrap_or(0)
    }

    /// Halve the claim size while the process is over its memory budget
    fn effective_batch(&self) -> usize {
        if self.memory.under_pressure() {
            (self.batch_size / 2).max(1)
        } else {
            self.batch_size
        }
    }

    async fn drain_target(
        &self,
        instance: &Arc<Instance>,
        batch: usize,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let started_at = Utc::now().to_rfc3339();
        let started = Instant::now();
        let entries = self.wal.claim_pending(instance.name, batch)?;
        if entries.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "Replaying {} entries against {}",
            entries.len(),
            instance.name
        );

        // Group by collection: order inside a group is the WAL order,
        // groups replay concurrently
        let mut groups: HashMap<Option<String>, Vec<WalEntry>> = HashMap::new();
        for entry in entries {
            groups
                .entry(entry.collection_identifier.clone())
                .or_default()
                .push(entry);
        }

        let claimed: usize = groups.values().map(Vec::len).sum();
        let tasks = groups.into_iter().map(|(collection, group)| {
            let instance = instance.clone();
            let shutdown = shutdown_rx.clone();
            async move {
                let count = group.len();
                let (synced, failed) = self.replay_group(&instance, &group, shutdown).await;
                let status = if failed == 0 { "completed" } else { "partial" };
                if let Err(e) = oplog::record_sync_task(
                    &self.db,
                    instance.name,
                    collection.as_deref(),
                    count,
                    status,
                    None,
                ) {
                    tracing::debug!("Sync task not recorded: {e:#}");
                }
                if let Some(name) = collection {
                    let _ = oplog::touch_sync_collection(
                        &self.db,
                        &name,
                        -(synced as i64),
                        synced > 0,
                    );
                }
                (synced, failed)
            }
        });
        let results = join_all(tasks).await;

        let synced: usize = results.iter().map(|(s, _)| s).sum();
        let failed: usize = results.iter().map(|(_, f)| f).sum();
        if let Err(e) = oplog::record_sync_cycle(
            &self.db,
            instance.name,
            claimed,
            synced,
            failed,
            started.elapsed().as_millis() as u64,
            &started_at,
        ) {
            tracing::debug!("Sync cycle not recorded: {e:#}");
        }
        Ok(())
    }

    /// Replay one collection's entries strictly in order. Returns
    /// (synced, failed) counts.
    async fn replay_group(
        &self,
        instance: &Arc<Instance>,
        group: &[WalEntry],
        shutdown: watch::Receiver<bool>,
    ) -> (usize, usize) {
        let mut synced = 0;
        let mut failed = 0;
        for entry in group {
            // Shutdown is observed between entries, never mid-forward
            if *shutdown.borrow() {
                break;
            }
            match self.replay_entry(instance, entry).await {
                Replayed::Synced => synced += 1,
                Replayed::Permanent => failed += 1,
                Replayed::Retry => {
                    failed += 1;
                    // Later entries in this collection must not overtake
                    break;
                }
            }
        }
        (synced, failed)
    }

    async fn replay_entry(&self, instance: &Arc<Instance>, entry: &WalEntry) -> Replayed {
        tracing::debug!(
            "Replaying WAL #{} ({} {}) against {}",
            entry.write_id,
            entry.method,
            entry.path,
            instance.name
        );

        if entry.method == "POST" && paths::is_collections_root(&entry.path) {
            return self.replay_creation(instance, entry).await;
        }

        // Make sure the target knows the collection before data
        // operations; creations remembered on the source side are applied
        // just in time
        if let Err(retry) = self.ensure_mapping(instance, entry).await {
            return retry;
        }

        let path = match self.mappings.rewrite_path(&entry.path, instance.name) {
            Ok(RewriteOutcome::Rewritten(p)) => p,
            Ok(RewriteOutcome::PassThrough) => entry.path.clone(),
            Ok(RewriteOutcome::Unmapped) => {
                // DELETE of an unknown identifier: the backend will 404,
                // which is the success we want. Anything else waits for
                // the mapping to appear.
                if entry.method == "DELETE" {
                    entry.path.clone()
                } else {
                    return self.fail_entry(instance, entry, "collection mapping incomplete");
                }
            }
            Err(e) => return self.fail_entry(instance, entry, &format!("mapping lookup: {e:#}")),
        };

        let Ok(method) = entry.method.parse::<Method>() else {
            let _ = self
                .wal
                .mark_failed_permanent(entry.write_id, "unparseable method");
            return Replayed::Permanent;
        };
        let url = format!("{}{}", instance.base_url, path);
        let headers = replay_header_map(entry);

        match self
            .forwarder
            .send(&method, &url, &headers, Bytes::from(entry.payload.clone()))
            .await
        {
            Ok(resp) if resp.is_success() => {
                if let Err(e) = self.wal.mark_synced(entry.write_id) {
                    tracing::error!("Failed to mark WAL #{} synced: {e:#}", entry.write_id);
                }
                if entry.method == "DELETE" {
                    self.cleanup_mapping_after_delete(entry).await;
                }
                Replayed::Synced
            }
            Ok(resp) if resp.status == reqwest::StatusCode::NOT_FOUND && entry.method == "DELETE" => {
                // Already gone on the target - deferred deletes are
                // idempotent
                if let Err(e) = self.wal.mark_synced(entry.write_id) {
                    tracing::error!("Failed to mark WAL #{} synced: {e:#}", entry.write_id);
                }
                self.cleanup_mapping_after_delete(entry).await;
                Replayed::Synced
            }
            Ok(resp) if resp.status.is_client_error() => {
                let reason = format!(
                    "{} rejected replay: {} {}",
                    instance.name,
                    resp.status,
                    String::from_utf8_lossy(&resp.body)
                );
                tracing::warn!("WAL #{}: {reason}", entry.write_id);
                let _ = self.wal.mark_failed_permanent(entry.write_id, &reason);
                Replayed::Permanent
            }
            Ok(resp) => self.fail_entry(instance, entry, &format!("returned {}", resp.status)),
            Err(ForwardError::Transport(msg)) => self.fail_entry(instance, entry, &msg),
            Err(ForwardError::InvalidRequest(msg)) => {
                let _ = self.wal.mark_failed_permanent(entry.write_id, &msg);
                Replayed::Permanent
            }
        }
    }

    /// Replay a deferred collection creation and record the identifier
    /// the target assigns
    async fn replay_creation(&self, instance: &Arc<Instance>, entry: &WalEntry) -> Replayed {
        let config: Option<serde_json::Value> = serde_json::from_slice(&entry.payload).ok();
        let name = entry
            .collection_identifier
            .clone()
            .or_else(|| {
                config
                    .as_ref()
                    .and_then(|c| c.get("name").and_then(|n| n.as_str()).map(String::from))
            });
        let Some(name) = name else {
            let _ = self
                .wal
                .mark_failed_permanent(entry.write_id, "creation entry has no name");
            return Replayed::Permanent;
        };

        match automap::create_collection_on(
            &self.forwarder,
            &instance.base_url,
            &name,
            config.as_ref(),
        )
        .await
        {
            Ok(id) => {
                if let Err(e) = self
                    .mappings
                    .upsert(&name, instance.name, &id, config.as_ref())
                    .await
                {
                    tracing::error!("Mapping upsert after deferred creation failed: {e:#}");
                }
                let _ = self.wal.mark_synced(entry.write_id);
                tracing::info!(
                    "Deferred creation of {name:?} applied on {} (id {id})",
                    instance.name
                );
                Replayed::Synced
            }
            Err(CreateError::Transport(msg)) => self.fail_entry(instance, entry, &msg),
            Err(CreateError::Rejected(status, body)) => {
                let reason = format!("creation rejected: {status} {body}");
                let _ = self.wal.mark_failed_permanent(entry.write_id, &reason);
                Replayed::Permanent
            }
        }
    }

    /// Just-in-time counterpart creation for data entries whose target
    /// does not know the collection yet
    async fn ensure_mapping(
        &self,
        instance: &Arc<Instance>,
        entry: &WalEntry,
    ) -> Result<(), Replayed> {
        let mapping = match paths::collection_ref(&entry.path) {
            Some(CollectionRef::Id(id)) => {
                match self
                    .mappings
                    .resolve_by_id_on_instance(&id, instance.name)
                {
                    Ok(Some(_)) => return Ok(()), // target already knows it
                    Ok(None) => self
                        .mappings
                        .resolve_by_id_on_instance(&id, instance.name.other())
                        .ok()
                        .flatten(),
                    Err(_) => None,
                }
            }
            Some(CollectionRef::Name(name)) => self.mappings.resolve_by_name(&name).ok().flatten(),
            None => return Ok(()),
        };

        let Some(mapping) = mapping else {
            // No mapping knowledge at all; DELETEs can proceed (404 is
            // success), anything else has nothing to create from
            return Ok(());
        };
        if mapping.id_on(instance.name).is_some() {
            return Ok(());
        }

        tracing::info!(
            "Collection {:?} missing on {}; creating before replay",
            mapping.name,
            instance.name
        );
        match automap::create_collection_on(
            &self.forwarder,
            &instance.base_url,
            &mapping.name,
            mapping.config.as_ref(),
        )
        .await
        {
            Ok(id) => {
                if let Err(e) = self
                    .mappings
                    .upsert(&mapping.name, instance.name, &id, None)
                    .await
                {
                    tracing::error!("Mapping upsert after JIT creation failed: {e:#}");
                }
                Ok(())
            }
            Err(CreateError::Transport(msg)) => Err(self.fail_entry(instance, entry, &msg)),
            Err(CreateError::Rejected(status, body)) => {
                tracing::warn!(
                    "JIT creation of {:?} on {} rejected ({status}): {body}",
                    mapping.name,
                    instance.name
                );
                Err(self.fail_entry(instance, entry, &format!("jit creation rejected: {status}")))
            }
        }
    }

    /// After a collection DELETE syncs, drop the mapping once neither
    /// backend still claims the collection
    async fn cleanup_mapping_after_delete(&self, entry: &WalEntry) {
        let Some(reference) = entry.collection_identifier.as_deref() else {
            return;
        };
        let mapping = match paths::collection_ref(&format!("/collections/{reference}")) {
            Some(CollectionRef::Name(name)) => self.mappings.resolve_by_name(&name).ok().flatten(),
            Some(CollectionRef::Id(id)) => [InstanceName::Primary, InstanceName::Replica]
                .into_iter()
                .find_map(|i| self.mappings.resolve_by_id_on_instance(&id, i).ok().flatten()),
            None => None,
        };
        let Some(mapping) = mapping else { return };

        // Only drop the row when no WAL entry still targets the other
        // side; otherwise the replayer needs the mapping to finish
        let other_pending = self
            .wal
            .backlog_for_collection(reference)
            .map(|n| n > 0)
            .unwrap_or(true);
        if !other_pending {
            if let Err(e) = self.mappings.delete(&mapping.name) {
                tracing::debug!("Mapping cleanup after replayed delete skipped: {e:#}");
            } else {
                tracing::info!("Mapping {:?} removed after replicated delete", mapping.name);
            }
        }
    }

    /// Record a retryable failure; emits an alert when the entry crosses
    /// into `abandoned`
    fn fail_entry(&self, instance: &Arc<Instance>, entry: &WalEntry, reason: &str) -> Replayed {
        tracing::warn!(
            "WAL #{} failed against {}: {reason}",
            entry.write_id,
            instance.name
        );
        match self.wal.mark_failed(entry.write_id, reason) {
            Ok(WalStatus::Abandoned) => {
                tracing::error!(
                    "WAL #{} abandoned after {} retries (target {})",
                    entry.write_id,
                    entry.max_retries,
                    instance.name
                );
                let _ = self.event_tx.try_send(RouterEvent::ReplayExhausted {
                    timestamp: Utc::now(),
                    write_id: entry.write_id,
                    target: instance.name,
                    error: reason.to_string(),
                });
                Replayed::Permanent
            }
            Ok(_) => Replayed::Retry,
            Err(e) => {
                tracing::error!("Failed to mark WAL #{} failed: {e:#}", entry.write_id);
                Replayed::Retry
            }
        }
    }
}

fn replay_header_map(entry: &WalEntry) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(ct) = entry
        .headers
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(axum::http::header::CONTENT_TYPE, ct);
    }
    if let Some(auth) = entry
        .headers
        .authorization
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(axum::http::header::AUTHORIZATION, auth);
    }
    headers
}

/// Low-frequency retention sweep over the auxiliary log tables
pub async fn run_retention_cleanup(
    db: Database,
    retention: crate::config::RetentionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!(
        "Retention cleanup started (every {:?})",
        retention.cleanup_interval
    );
    let mut ticker = tokio::time::interval(retention.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would sweep at startup; skip it
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match oplog::cleanup_aged(&db, &retention) {
                    Ok(report) => {
                        let total: usize = report.iter().map(|(_, n)| n).sum();
                        if total > 0 {
                            tracing::info!("Retention cleanup removed {total} rows");
                        }
                    }
                    Err(e) => tracing::warn!("Retention cleanup failed: {e:#}"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Retention cleanup shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::wal::ReplayHeaders;

    #[test]
    fn replay_headers_build_a_header_map() {
        let entry = WalEntry {
            write_id: 1,
            method: "POST".into(),
            path: "/x".into(),
            payload: vec![],
            headers: ReplayHeaders {
                content_type: Some("application/json".into()),
                authorization: None,
            },
            target_instance: InstanceName::Replica,
            collection_identifier: None,
            status: WalStatus::Executed,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let map = replay_header_map(&entry);
        assert_eq!(map.get("content-type").unwrap(), "application/json");
        assert!(map.get("authorization").is_none());
    }
}
