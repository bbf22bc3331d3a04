// Unified write-ahead log
//
// Every write that could not be applied to an instance at request time is
// appended here and drained by the replayer. `write_id` is the SQLite
// rowid, so insertion order is the replay order. Claiming flips entries
// to `executed` inside an immediate transaction; with two router
// processes on the same database each entry is handed to exactly one
// claimer. An `executed` entry whose claimer died becomes re-claimable
// after a staleness window.
//
// Status machine:
//
//   pending ──claim──► executed ──2xx / DELETE-404──► synced
//      ▲                  │
//      └──retryable error─┤ (budget left)
//                         ├──retryable error────────► abandoned (budget spent)
//                         └──permanent 4xx──────────► failed

use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::Database;
use crate::health::InstanceName;

/// How long a claimed entry stays invisible to other claimers. A claimer
/// that dies mid-replay leaves its batch `executed`; after this window the
/// batch is claimable again.
const CLAIM_STALE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalStatus {
    Pending,
    Executed,
    Synced,
    Failed,
    Abandoned,
}

impl WalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WalStatus::Pending => "pending",
            WalStatus::Executed => "executed",
            WalStatus::Synced => "synced",
            WalStatus::Failed => "failed",
            WalStatus::Abandoned => "abandoned",
        }
    }

}

impl FromStr for WalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WalStatus::Pending),
            "executed" => Ok(WalStatus::Executed),
            "synced" => Ok(WalStatus::Synced),
            "failed" => Ok(WalStatus::Failed),
            "abandoned" => Ok(WalStatus::Abandoned),
            other => anyhow::bail!("unknown WAL status {other:?}"),
        }
    }
}

/// Header subset captured for replay. Everything else is dropped; the
/// replayer reconstructs the request from method + path + payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayHeaders {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

/// One row of `unified_wal_writes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub write_id: i64,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing)]
    pub payload: Vec<u8>,
    pub headers: ReplayHeaders,
    pub target_instance: InstanceName,
    pub collection_identifier: Option<String>,
    pub status: WalStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Aggregate counts for the admin surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalCounts {
    pub pending: u64,
    pub executed: u64,
    pub synced: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl WalCounts {
    /// Entries still awaiting replay
    pub fn backlog(&self) -> u64 {
        self.pending + self.executed
    }
}

#[derive(Clone)]
pub struct WalStore {
    db: Database,
    default_max_retries: u32,
}

impl WalStore {
    pub fn new(db: Database, default_max_retries: u32) -> Self {
        Self {
            db,
            default_max_retries,
        }
    }

    /// Append one deferred write. Fails only when the database is down,
    /// in which case the caller must refuse the client write.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        method: &str,
        path: &str,
        payload: &[u8],
        headers: &ReplayHeaders,
        target: InstanceName,
        collection_identifier: Option<&str>,
    ) -> Result<i64> {
        let now = super::now();
        let headers_json = serde_json::to_string(headers).context("encoding replay headers")?;
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO unified_wal_writes
                 (method, path, payload, headers, target_instance, collection_identifier,
                  status, retry_count, max_retries, created_at, updated_at, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?8, ?8)",
            params![
                method,
                path,
                payload,
                headers_json,
                target.as_str(),
                collection_identifier,
                self.default_max_retries,
                now,
            ],
        )
        .context("appending WAL entry")?;
        let write_id = conn.last_insert_rowid();
        tracing::debug!(
            "WAL append #{write_id}: {method} {path} target={target} collection={:?}",
            collection_identifier
        );
        Ok(write_id)
    }

    /// Transactionally claim up to `limit` replayable entries for `target`,
    /// in `write_id` order, marking them `executed`.
    ///
    /// Claimable: `pending` with budget left, or `executed` whose claim
    /// went stale. The immediate transaction makes concurrent claimers
    /// from other processes serialise; each entry goes to exactly one.
    pub fn claim_pending(&self, target: InstanceName, limit: usize) -> Result<Vec<WalEntry>> {
        let stale_cutoff =
            (chrono::Utc::now() - chrono::Duration::seconds(CLAIM_STALE_SECS)).to_rfc3339();
        let now = super::now();

        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let entries = {
            let mut stmt = tx.prepare(
                "SELECT write_id, method, path, payload, headers, target_instance,
                        collection_identifier, status, retry_count, max_retries,
                        error_message, created_at, updated_at
                 FROM unified_wal_writes
                 WHERE target_instance = ?1
                   AND retry_count < max_retries
                   AND (status = 'pending' OR (status = 'executed' AND updated_at < ?2))
                 ORDER BY write_id
                 LIMIT ?3",
            )?;
            let entries = stmt
                .query_map(params![target.as_str(), stale_cutoff, limit as i64], row_to_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            for entry in &entries {
                tx.execute(
                    "UPDATE unified_wal_writes
                     SET status = 'executed', updated_at = ?1
                     WHERE write_id = ?2",
                    params![now, entry.write_id],
                )?;
            }
            entries
        };
        tx.commit().context("committing WAL claim")?;

        Ok(entries
            .into_iter()
            .map(|mut e| {
                e.status = WalStatus::Executed;
                e.updated_at = now.clone();
                e
            })
            .collect())
    }

    /// Terminal success
    pub fn mark_synced(&self, write_id: i64) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE unified_wal_writes
             SET status = 'synced', error_message = NULL, updated_at = ?1
             WHERE write_id = ?2",
            params![super::now(), write_id],
        )?;
        Ok(())
    }

    /// Record a retryable failure. Returns the resulting status:
    /// `Pending` while budget remains, `Abandoned` once it is spent.
    pub fn mark_failed(&self, write_id: i64, error: &str) -> Result<WalStatus> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE unified_wal_writes
             SET retry_count = retry_count + 1,
                 status = CASE WHEN retry_count + 1 >= max_retries
                               THEN 'abandoned' ELSE 'pending' END,
                 error_message = ?1,
                 updated_at = ?2
             WHERE write_id = ?3",
            params![error, super::now(), write_id],
        )?;
        let status: String = conn.query_row(
            "SELECT status FROM unified_wal_writes WHERE write_id = ?1",
            params![write_id],
            |row| row.get(0),
        )?;
        status.parse()
    }

    /// Record a permanent backend rejection (4xx on replay). No retries.
    pub fn mark_failed_permanent(&self, write_id: i64, error: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE unified_wal_writes
             SET status = 'failed', error_message = ?1, updated_at = ?2
             WHERE write_id = ?3",
            params![error, super::now(), write_id],
        )?;
        Ok(())
    }

    /// Delete terminal entries older than `max_age_hours`. Returns the
    /// number of rows removed.
    pub fn purge(&self, max_age_hours: u32) -> Result<usize> {
        let cutoff = super::cutoff_hours(max_age_hours);
        let conn = self.db.conn()?;
        let deleted = conn.execute(
            "DELETE FROM unified_wal_writes
             WHERE status IN ('synced', 'failed', 'abandoned') AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    pub fn counts(&self) -> Result<WalCounts> {
        let conn = self.db.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM unified_wal_writes GROUP BY status")?;
        let mut counts = WalCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.parse::<WalStatus>() {
                Ok(WalStatus::Pending) => counts.pending = n,
                Ok(WalStatus::Executed) => counts.executed = n,
                Ok(WalStatus::Synced) => counts.synced = n,
                Ok(WalStatus::Failed) => counts.failed = n,
                Ok(WalStatus::Abandoned) => counts.abandoned = n,
                Err(_) => tracing::warn!("Unknown WAL status {status:?} in counts"),
            }
        }
        Ok(counts)
    }

    /// Whether a write covering (method, path prefix) reached `synced`.
    /// Used by transaction recovery to tell applied from lost writes.
    pub fn has_synced_write(&self, method: &str, path: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM unified_wal_writes
             WHERE method = ?1 AND path = ?2 AND status = 'synced'",
            params![method, path],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Outstanding (pending or claimed) entries for one collection,
    /// across both targets
    pub fn backlog_for_collection(&self, collection: &str) -> Result<u64> {
        let conn = self.db.conn()?;
        let n: u64 = conn.query_row(
            "SELECT COUNT(*) FROM unified_wal_writes
             WHERE collection_identifier = ?1 AND status IN ('pending', 'executed')",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Most recent entries for the admin surface (payloads omitted)
    pub fn list_recent(&self, limit: usize) -> Result<Vec<WalEntry>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT write_id, method, path, payload, headers, target_instance,
                    collection_identifier, status, retry_count, max_retries,
                    error_message, created_at, updated_at
             FROM unified_wal_writes
             ORDER BY write_id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<WalEntry> {
    let headers_json: Option<String> = row.get(4)?;
    let target: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(WalEntry {
        write_id: row.get(0)?,
        method: row.get(1)?,
        path: row.get(2)?,
        payload: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
        headers: headers_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        target_instance: target.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        collection_identifier: row.get(6)?,
        status: status.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        error_message: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_db;

    fn store() -> (tempfile::TempDir, WalStore) {
        let (dir, db) = temp_db();
        (dir, WalStore::new(db, 3))
    }

    fn append_n(store: &WalStore, target: InstanceName, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| {
                store
                    .append(
                        "POST",
                        &format!("/api/v2/tenants/t/databases/d/collections/c{i}/add"),
                        br#"{"ids":["1"]}"#,
                        &ReplayHeaders {
                            content_type: Some("application/json".into()),
                            authorization: None,
                        },
                        target,
                        Some(&format!("c{i}")),
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn claim_returns_in_insertion_order_and_marks_executed() {
        let (_dir, store) = store();
        let ids = append_n(&store, InstanceName::Replica, 5);

        let claimed = store.claim_pending(InstanceName::Replica, 3).unwrap();
        assert_eq!(
            claimed.iter().map(|e| e.write_id).collect::<Vec<_>>(),
            ids[..3]
        );
        assert!(claimed.iter().all(|e| e.status == WalStatus::Executed));

        // A second claim must not hand out the same entries
        let next = store.claim_pending(InstanceName::Replica, 10).unwrap();
        assert_eq!(next.iter().map(|e| e.write_id).collect::<Vec<_>>(), ids[3..]);
    }

    #[test]
    fn claim_filters_by_target() {
        let (_dir, store) = store();
        append_n(&store, InstanceName::Primary, 2);
        append_n(&store, InstanceName::Replica, 1);

        let claimed = store.claim_pending(InstanceName::Primary, 10).unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed
            .iter()
            .all(|e| e.target_instance == InstanceName::Primary));
    }

    #[test]
    fn failed_entries_return_to_pending_until_budget_spent() {
        let (_dir, store) = store();
        let ids = append_n(&store, InstanceName::Replica, 1);
        let id = ids[0];

        assert_eq!(
            store.mark_failed(id, "connect refused").unwrap(),
            WalStatus::Pending
        );
        assert_eq!(
            store.mark_failed(id, "connect refused").unwrap(),
            WalStatus::Pending
        );
        // Third failure exhausts max_retries = 3
        assert_eq!(
            store.mark_failed(id, "connect refused").unwrap(),
            WalStatus::Abandoned
        );

        // Abandoned entries are not claimable
        assert!(store.claim_pending(InstanceName::Replica, 10).unwrap().is_empty());

        let counts = store.counts().unwrap();
        assert_eq!(counts.abandoned, 1);
        assert_eq!(counts.backlog(), 0);
    }

    #[test]
    fn synced_entries_are_terminal_and_purgeable() {
        let (_dir, store) = store();
        let ids = append_n(&store, InstanceName::Replica, 2);
        store.mark_synced(ids[0]).unwrap();

        assert!(store
            .has_synced_write(
                "POST",
                "/api/v2/tenants/t/databases/d/collections/c0/add"
            )
            .unwrap());

        // Age 0 hours: everything terminal and older than "now" goes.
        // The non-terminal entry survives.
        let deleted = store.purge(0).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.counts().unwrap().pending, 1);
    }

    #[test]
    fn contending_claimers_each_get_an_entry_exactly_once() {
        // Two stores on the same database file stand in for two router
        // processes sharing the coordination database
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.db");
        let db_a = crate::db::Database::open(&path, 4).unwrap();
        let db_b = crate::db::Database::open(&path, 4).unwrap();
        let store_a = WalStore::new(db_a, 3);
        let store_b = WalStore::new(db_b, 3);

        append_n(&store_a, InstanceName::Replica, 40);

        let drain = |store: WalStore| {
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let batch = store.claim_pending(InstanceName::Replica, 3).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    seen.extend(batch.into_iter().map(|e| e.write_id));
                }
                seen
            })
        };
        let a = drain(store_a);
        let b = drain(store_b);
        let mut all: Vec<i64> = a.join().unwrap();
        all.extend(b.join().unwrap());

        // Every entry claimed by exactly one claimer
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before);
        assert_eq!(all.len(), 40);
    }

    #[test]
    fn headers_round_trip_through_the_row() {
        let (_dir, store) = store();
        store
            .append(
                "POST",
                "/api/v2/tenants/t/databases/d/collections/c/add",
                b"{}",
                &ReplayHeaders {
                    content_type: Some("application/json".into()),
                    authorization: Some("Bearer secret".into()),
                },
                InstanceName::Primary,
                Some("c"),
            )
            .unwrap();
        let claimed = store.claim_pending(InstanceName::Primary, 1).unwrap();
        assert_eq!(
            claimed[0].headers.content_type.as_deref(),
            Some("application/json")
        );
        assert_eq!(claimed[0].headers.authorization.as_deref(), Some("Bearer secret"));
    }
}
