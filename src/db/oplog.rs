// Auxiliary operational logs
//
// Append-mostly tables operators read during incidents: health samples,
// failover events, replay cycle history, worker heartbeats, latency
// samples, and the per-collection sync ledger. All of them are bounded
// by the retention cleanup at the bottom of this file.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::Database;
use crate::config::RetentionConfig;
use crate::health::InstanceName;

/// One probe outcome appended by the health monitor
pub fn record_health_sample(
    db: &Database,
    instance: InstanceName,
    healthy: bool,
    response_time_ms: Option<u64>,
    error: Option<&str>,
) -> Result<()> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO health_metrics (instance_name, healthy, response_time_ms, checked_at, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            instance.as_str(),
            healthy as i64,
            response_time_ms.map(|v| v as i64),
            super::now(),
            error,
        ],
    )?;
    Ok(())
}

/// Health transitions and write failovers, for the incident timeline
pub fn record_failover_event(
    db: &Database,
    event_type: &str,
    instance: InstanceName,
    detail: &str,
) -> Result<()> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO failover_events (event_type, instance_name, detail, occurred_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_type, instance.as_str(), detail, super::now()],
    )?;
    Ok(())
}

/// One replayer pass that claimed at least one entry
pub fn record_sync_cycle(
    db: &Database,
    target: InstanceName,
    claimed: usize,
    synced: usize,
    failed: usize,
    duration_ms: u64,
    started_at: &str,
) -> Result<()> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO sync_history
             (target_instance, entries_claimed, entries_synced, entries_failed,
              duration_ms, sync_started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            target.as_str(),
            claimed as i64,
            synced as i64,
            failed as i64,
            duration_ms as i64,
            started_at,
        ],
    )?;
    Ok(())
}

/// Replayer liveness, one row per worker id, refreshed each pass
pub fn upsert_worker_heartbeat(
    db: &Database,
    worker_id: &str,
    batch_size: usize,
    memory_pressure: bool,
) -> Result<()> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO sync_workers (worker_id, pid, last_heartbeat, batch_size, memory_pressure)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(worker_id) DO UPDATE SET
             last_heartbeat = excluded.last_heartbeat,
             batch_size = excluded.batch_size,
             memory_pressure = excluded.memory_pressure",
        params![
            worker_id,
            std::process::id() as i64,
            super::now(),
            batch_size as i64,
            memory_pressure as i64,
        ],
    )?;
    Ok(())
}

/// One per-collection batch the replayer processed
pub fn record_sync_task(
    db: &Database,
    target: InstanceName,
    collection: Option<&str>,
    entry_count: usize,
    status: &str,
    error: Option<&str>,
) -> Result<()> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO sync_tasks
             (target_instance, collection_identifier, entry_count, status, error, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            target.as_str(),
            collection,
            entry_count as i64,
            status,
            error,
            super::now(),
        ],
    )?;
    Ok(())
}

/// Track per-collection sync progress (pending delta may be negative)
pub fn touch_sync_collection(db: &Database, name: &str, pending_delta: i64, synced: bool) -> Result<()> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO sync_collections (collection_name, last_synced_at, pending_writes)
         VALUES (?1, ?2, MAX(?3, 0))
         ON CONFLICT(collection_name) DO UPDATE SET
             last_synced_at = CASE WHEN ?4 THEN excluded.last_synced_at
                                   ELSE last_synced_at END,
             pending_writes = MAX(pending_writes + ?3, 0)",
        params![
            name,
            if synced { Some(super::now()) } else { None },
            pending_delta,
            synced,
        ],
    )?;
    Ok(())
}

/// One forward latency sample from the router
pub fn record_latency_sample(
    db: &Database,
    instance: InstanceName,
    operation: &str,
    latency_ms: u64,
) -> Result<()> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO performance_metrics (instance_name, operation, latency_ms, metric_timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![instance.as_str(), operation, latency_ms as i64, super::now()],
    )?;
    Ok(())
}

/// Latency distribution for one instance over the trailing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    pub instance: InstanceName,
    pub samples: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Percentiles over the last `window_hours` of samples
pub fn latency_summary(
    db: &Database,
    instance: InstanceName,
    window_hours: u32,
) -> Result<Option<LatencySummary>> {
    let cutoff = super::cutoff_hours(window_hours);
    let conn = db.conn()?;
    let mut stmt = conn.prepare(
        "SELECT latency_ms FROM performance_metrics
         WHERE instance_name = ?1 AND metric_timestamp >= ?2
         ORDER BY latency_ms",
    )?;
    let samples: Vec<u64> = stmt
        .query_map(params![instance.as_str(), cutoff], |row| {
            row.get::<_, i64>(0).map(|v| v as u64)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if samples.is_empty() {
        return Ok(None);
    }
    let pick = |q: f64| {
        let idx = ((samples.len() - 1) as f64 * q).round() as usize;
        samples[idx]
    };
    Ok(Some(LatencySummary {
        instance,
        samples: samples.len() as u64,
        p50_ms: pick(0.50),
        p95_ms: pick(0.95),
        p99_ms: pick(0.99),
        max_ms: *samples.last().unwrap_or(&0),
    }))
}

/// Result of one retention sweep, table name -> rows removed
pub type CleanupReport = Vec<(&'static str, usize)>;

/// Purge aged rows from every auxiliary table per the configured
/// retention windows. WAL and transaction cleanup have their own
/// operator-triggered paths and are not touched here.
pub fn cleanup_aged(db: &Database, retention: &RetentionConfig) -> Result<CleanupReport> {
    let conn = db.conn()?;
    let mut report = CleanupReport::new();

    let sweeps: [(&'static str, &'static str, u32); 6] = [
        ("health_metrics", "checked_at", retention.health_metrics_days),
        (
            "performance_metrics",
            "metric_timestamp",
            retention.performance_metrics_days,
        ),
        ("sync_history", "sync_started_at", retention.sync_history_days),
        ("failover_events", "occurred_at", retention.failover_events_days),
        ("sync_tasks", "created_at", retention.sync_tasks_days),
        ("sync_workers", "last_heartbeat", retention.sync_workers_days),
    ];

    for (table, column, days) in sweeps {
        let cutoff = super::cutoff_days(days);
        let deleted = conn
            .execute(
                &format!("DELETE FROM {table} WHERE {column} < ?1"),
                params![cutoff],
            )
            .with_context(|| format!("purging {table}"))?;
        if deleted > 0 {
            tracing::debug!("Retention sweep removed {deleted} rows from {table}");
        }
        report.push((table, deleted));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_db;

    #[test]
    fn health_samples_accumulate() {
        let (_dir, db) = temp_db();
        record_health_sample(&db, InstanceName::Primary, true, Some(12), None).unwrap();
        record_health_sample(&db, InstanceName::Primary, false, None, Some("timeout")).unwrap();

        let conn = db.conn().unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM health_metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn latency_percentiles_come_from_sorted_samples() {
        let (_dir, db) = temp_db();
        for ms in [10, 20, 30, 40, 1000] {
            record_latency_sample(&db, InstanceName::Replica, "read", ms).unwrap();
        }
        let summary = latency_summary(&db, InstanceName::Replica, 1)
            .unwrap()
            .unwrap();
        assert_eq!(summary.samples, 5);
        assert_eq!(summary.p50_ms, 30);
        assert_eq!(summary.max_ms, 1000);

        assert!(latency_summary(&db, InstanceName::Primary, 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn worker_heartbeat_upserts_one_row() {
        let (_dir, db) = temp_db();
        upsert_worker_heartbeat(&db, "replayer-1", 50, false).unwrap();
        upsert_worker_heartbeat(&db, "replayer-1", 25, true).unwrap();

        let conn = db.conn().unwrap();
        let (n, batch): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(batch_size) FROM sync_workers",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(batch, 25);
    }

    #[test]
    fn sync_collection_pending_never_goes_negative() {
        let (_dir, db) = temp_db();
        touch_sync_collection(&db, "docs", 3, false).unwrap();
        touch_sync_collection(&db, "docs", -5, true).unwrap();

        let conn = db.conn().unwrap();
        let pending: i64 = conn
            .query_row(
                "SELECT pending_writes FROM sync_collections WHERE collection_name='docs'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[test]
    fn cleanup_respects_retention_windows() {
        let (_dir, db) = temp_db();
        record_health_sample(&db, InstanceName::Primary, true, Some(5), None).unwrap();

        // Day-granular windows keep today's rows
        let report = cleanup_aged(&db, &RetentionConfig::default()).unwrap();
        let health = report.iter().find(|(t, _)| *t == "health_metrics").unwrap();
        assert_eq!(health.1, 0);

        // Zero-day retention removes them
        let zero = RetentionConfig {
            health_metrics_days: 0,
            ..RetentionConfig::default()
        };
        let report = cleanup_aged(&db, &zero).unwrap();
        let health = report.iter().find(|(t, _)| *t == "health_metrics").unwrap();
        assert_eq!(health.1, 1);
    }
}
