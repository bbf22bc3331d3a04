// Coordination database - SQLite behind an r2d2 pool
//
// The database exclusively owns all durable state: collection mappings,
// the unified WAL, the transaction safety log, and the auxiliary
// operational logs. All cross-process coordination happens here through
// transactional semantics; in-process caches are reconciled on read-miss.
//
// # Concurrency
//
// The database runs in WAL journal mode: many concurrent readers, one
// writer at a time with a busy timeout absorbing short contention. The
// pool is bounded, which also acts as the anti-stampede gate during
// incident recovery - excess callers queue on checkout.

pub mod mappings;
pub mod oplog;
pub mod transactions;
pub mod wal;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

pub use mappings::{CollectionMapping, MappingStore, RewriteOutcome};
pub use transactions::{TransactionLog, TransactionRecord, TxnStatus};
pub use wal::{WalEntry, WalStatus, WalStore};

/// Handle to the coordination database. Cheap to clone; all clones share
/// the same bounded connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (or create) the database file and run migrations.
    ///
    /// `max_connections` bounds the pool; writers queue on checkout when
    /// it is exhausted rather than stampeding SQLite.
    pub fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {parent:?}"))?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;
                 PRAGMA foreign_keys=ON;",
            )
        });

        let pool = Pool::builder()
            .max_size(max_connections)
            .build(manager)
            .context("building database connection pool")?;

        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    /// Check out a pooled connection
    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("database connection pool exhausted")
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .context("applying database schema")?;
        Ok(())
    }
}

/// Current wall-clock time as RFC 3339 (UTC, `+00:00` offset).
///
/// All timestamps are stored in this format so lexicographic comparison
/// in SQL matches chronological order.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339()
}

/// RFC 3339 timestamp `days` days in the past, for retention cutoffs
pub(crate) fn cutoff_days(days: u32) -> String {
    (Utc::now() - ChronoDuration::days(i64::from(days))).to_rfc3339()
}

/// RFC 3339 timestamp `hours` hours in the past
pub(crate) fn cutoff_hours(hours: u32) -> String {
    (Utc::now() - ChronoDuration::hours(i64::from(hours))).to_rfc3339()
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collection_id_mapping (
    collection_name        TEXT PRIMARY KEY,
    primary_collection_id  TEXT UNIQUE,
    replica_collection_id  TEXT UNIQUE,
    collection_config      TEXT,
    created_at             TEXT NOT NULL,
    updated_at             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS unified_wal_writes (
    write_id              INTEGER PRIMARY KEY AUTOINCREMENT,
    method                TEXT NOT NULL,
    path                  TEXT NOT NULL,
    payload               BLOB,
    headers               TEXT,
    target_instance       TEXT NOT NULL,
    collection_identifier TEXT,
    status                TEXT NOT NULL DEFAULT 'pending',
    retry_count           INTEGER NOT NULL DEFAULT 0,
    max_retries           INTEGER NOT NULL DEFAULT 3,
    error_message         TEXT,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL,
    timestamp             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_wal_claim
    ON unified_wal_writes(target_instance, status, write_id);
CREATE INDEX IF NOT EXISTS idx_wal_status
    ON unified_wal_writes(status, updated_at);

CREATE TABLE IF NOT EXISTS emergency_transaction_log (
    transaction_id TEXT PRIMARY KEY,
    method         TEXT NOT NULL,
    path           TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'ATTEMPTING',
    operation_type TEXT,
    client_session TEXT,
    attempted_at   TEXT NOT NULL,
    completed_at   TEXT,
    failure_reason TEXT,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    max_retries    INTEGER NOT NULL DEFAULT 3
);
CREATE INDEX IF NOT EXISTS idx_txn_status
    ON emergency_transaction_log(status, attempted_at);

CREATE TABLE IF NOT EXISTS health_metrics (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_name    TEXT NOT NULL,
    healthy          INTEGER NOT NULL,
    response_time_ms INTEGER,
    checked_at       TEXT NOT NULL,
    error_message    TEXT
);
CREATE INDEX IF NOT EXISTS idx_health_instance_time
    ON health_metrics(instance_name, checked_at);

CREATE TABLE IF NOT EXISTS failover_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type    TEXT NOT NULL,
    instance_name TEXT NOT NULL,
    detail        TEXT,
    occurred_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_history (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    target_instance TEXT NOT NULL,
    entries_claimed INTEGER NOT NULL,
    entries_synced  INTEGER NOT NULL,
    entries_failed  INTEGER NOT NULL,
    duration_ms     INTEGER NOT NULL,
    sync_started_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_workers (
    worker_id       TEXT PRIMARY KEY,
    pid             INTEGER,
    last_heartbeat  TEXT NOT NULL,
    batch_size      INTEGER NOT NULL,
    memory_pressure INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sync_tasks (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    target_instance       TEXT NOT NULL,
    collection_identifier TEXT,
    entry_count           INTEGER NOT NULL,
    status                TEXT NOT NULL,
    error                 TEXT,
    created_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_collections (
    collection_name TEXT PRIMARY KEY,
    last_synced_at  TEXT,
    pending_writes  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS performance_metrics (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_name    TEXT NOT NULL,
    operation        TEXT NOT NULL,
    latency_ms       INTEGER NOT NULL,
    metric_timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_perf_instance_time
    ON performance_metrics(instance_name, metric_timestamp);
";

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// On-disk fixture database; in-memory SQLite can't be shared across
    /// pooled connections, so tests use a tempdir-backed file.
    pub fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("coordination.db"), 4).expect("open db");
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_and_reapplies() {
        let (_dir, db) = testutil::temp_db();
        // Second migration run must be a no-op
        db.migrate().unwrap();
        let conn = db.conn().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='unified_wal_writes'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let older = cutoff_days(1);
        let newer = now();
        assert!(older < newer);
        assert!(cutoff_hours(2) < cutoff_hours(1));
    }
}
