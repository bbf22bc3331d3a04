// Transaction safety log
//
// Independent of the WAL: one row per client-visible write attempt, kept
// for audit and post-hoc recovery. The row is created before the forward
// and finalised after it, so a crash in between leaves an ATTEMPTING row
// that the recovery pass can classify later. Terminal statuses are never
// rewritten; recovery only ever advances ATTEMPTING rows.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::wal::WalStore;
use super::Database;
use crate::events::generate_transaction_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxnStatus {
    Attempting,
    Completed,
    Failed,
    Abandoned,
    Recovered,
}

impl TxnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnStatus::Attempting => "ATTEMPTING",
            TxnStatus::Completed => "COMPLETED",
            TxnStatus::Failed => "FAILED",
            TxnStatus::Abandoned => "ABANDONED",
            TxnStatus::Recovered => "RECOVERED",
        }
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxnStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ATTEMPTING" => Ok(TxnStatus::Attempting),
            "COMPLETED" => Ok(TxnStatus::Completed),
            "FAILED" => Ok(TxnStatus::Failed),
            "ABANDONED" => Ok(TxnStatus::Abandoned),
            "RECOVERED" => Ok(TxnStatus::Recovered),
            other => anyhow::bail!("unknown transaction status {other:?}"),
        }
    }
}

/// One row of `emergency_transaction_log`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub method: String,
    pub path: String,
    pub status: TxnStatus,
    pub operation_type: Option<String>,
    pub client_session: Option<String>,
    pub attempted_at: String,
    pub completed_at: Option<String>,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Aggregate counts for the admin surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnSummary {
    pub attempting: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub recovered: u64,
    /// FAILED or ATTEMPTING rows with retry budget remaining
    pub pending_recovery: u64,
}

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub examined: u64,
    pub recovered: u64,
    pub failed: u64,
    pub abandoned: u64,
}

#[derive(Clone)]
pub struct TransactionLog {
    db: Database,
    default_max_retries: u32,
}

impl TransactionLog {
    pub fn new(db: Database, default_max_retries: u32) -> Self {
        Self {
            db,
            default_max_retries,
        }
    }

    /// Record a write attempt before it is forwarded. The returned id is
    /// surfaced to the client for correlation.
    pub fn begin(
        &self,
        method: &str,
        path: &str,
        operation_type: &str,
        client_session: &str,
    ) -> Result<String> {
        let transaction_id = generate_transaction_id();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO emergency_transaction_log
                 (transaction_id, method, path, status, operation_type, client_session,
                  attempted_at, retry_count, max_retries)
             VALUES (?1, ?2, ?3, 'ATTEMPTING', ?4, ?5, ?6, 0, ?7)",
            params![
                transaction_id,
                method,
                path,
                operation_type,
                client_session,
                super::now(),
                self.default_max_retries,
            ],
        )
        .context("recording transaction attempt")?;
        Ok(transaction_id)
    }

    /// The forward completed and the client saw a success
    pub fn complete(&self, transaction_id: &str) -> Result<()> {
        self.finish(transaction_id, TxnStatus::Completed, None)
    }

    /// The forward failed and the client saw an error
    pub fn fail(&self, transaction_id: &str, reason: &str) -> Result<()> {
        self.finish(transaction_id, TxnStatus::Failed, Some(reason))
    }

    fn finish(&self, transaction_id: &str, status: TxnStatus, reason: Option<&str>) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE emergency_transaction_log
             SET status = ?1, completed_at = ?2, failure_reason = ?3
             WHERE transaction_id = ?4 AND status = 'ATTEMPTING'",
            params![status.as_str(), super::now(), reason, transaction_id],
        )?;
        Ok(())
    }

    pub fn get(&self, transaction_id: &str) -> Result<Option<TransactionRecord>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT transaction_id, method, path, status, operation_type, client_session,
                    attempted_at, completed_at, failure_reason, retry_count, max_retries
             FROM emergency_transaction_log WHERE transaction_id = ?1",
            params![transaction_id],
            row_to_record,
        )
        .optional()
        .context("fetching transaction record")
    }

    pub fn summary(&self) -> Result<TxnSummary> {
        let conn = self.db.conn()?;
        let mut summary = TxnSummary::default();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM emergency_transaction_log GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.parse::<TxnStatus>() {
                Ok(TxnStatus::Attempting) => summary.attempting = n,
                Ok(TxnStatus::Completed) => summary.completed = n,
                Ok(TxnStatus::Failed) => summary.failed = n,
                Ok(TxnStatus::Abandoned) => summary.abandoned = n,
                Ok(TxnStatus::Recovered) => summary.recovered = n,
                Err(_) => tracing::warn!("Unknown transaction status {status:?} in summary"),
            }
        }
        summary.pending_recovery = conn.query_row(
            "SELECT COUNT(*) FROM emergency_transaction_log
             WHERE status IN ('FAILED', 'ATTEMPTING') AND retry_count < max_retries",
            [],
            |row| row.get(0),
        )?;
        Ok(summary)
    }

    /// Advance ATTEMPTING rows stuck past `stuck_after`.
    ///
    /// A stuck row whose write reached `synced` in the WAL was durably
    /// applied: RECOVERED. Otherwise FAILED while retry budget remains,
    /// ABANDONED once it is spent.
    pub fn recover_stuck(&self, stuck_after: Duration, wal: &WalStore) -> Result<RecoveryReport> {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::seconds(stuck_after.as_secs() as i64))
        .to_rfc3339();

        let stuck: Vec<(String, String, String, u32, u32)> = {
            let conn = self.db.conn()?;
            let mut stmt = conn.prepare(
                "SELECT transaction_id, method, path, retry_count, max_retries
                 FROM emergency_transaction_log
                 WHERE status = 'ATTEMPTING' AND attempted_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut report = RecoveryReport {
            examined: stuck.len() as u64,
            ..Default::default()
        };
        let conn = self.db.conn()?;
        for (id, method, path, retry_count, max_retries) in stuck {
            let (status, reason) = if wal.has_synced_write(&method, &path)? {
                report.recovered += 1;
                (TxnStatus::Recovered, "write applied via WAL replay")
            } else if retry_count < max_retries {
                report.failed += 1;
                (TxnStatus::Failed, "stuck in ATTEMPTING past threshold")
            } else {
                report.abandoned += 1;
                (TxnStatus::Abandoned, "retry budget exhausted while stuck")
            };
            conn.execute(
                "UPDATE emergency_transaction_log
                 SET status = ?1, failure_reason = ?2, completed_at = ?3,
                     retry_count = retry_count + 1
                 WHERE transaction_id = ?4 AND status = 'ATTEMPTING'",
                params![status.as_str(), reason, super::now(), id],
            )?;
        }
        Ok(report)
    }

    /// Delete terminal records older than `max_age_hours`
    pub fn cleanup(&self, max_age_hours: u32) -> Result<usize> {
        let cutoff = super::cutoff_hours(max_age_hours);
        let conn = self.db.conn()?;
        let deleted = conn.execute(
            "DELETE FROM emergency_transaction_log
             WHERE status IN ('COMPLETED', 'FAILED', 'ABANDONED', 'RECOVERED')
               AND COALESCE(completed_at, attempted_at) < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let status: String = row.get(3)?;
    Ok(TransactionRecord {
        transaction_id: row.get(0)?,
        method: row.get(1)?,
        path: row.get(2)?,
        status: status.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        operation_type: row.get(4)?,
        client_session: row.get(5)?,
        attempted_at: row.get(6)?,
        completed_at: row.get(7)?,
        failure_reason: row.get(8)?,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_db;
    use crate::db::wal::ReplayHeaders;
    use crate::health::InstanceName;

    const PATH: &str = "/api/v2/tenants/t/databases/d/collections/c/add";

    #[test]
    fn attempt_then_complete_is_terminal() {
        let (_dir, db) = temp_db();
        let log = TransactionLog::new(db, 3);

        let id = log.begin("POST", PATH, "document_write", "sess-1").unwrap();
        let record = log.get(&id).unwrap().unwrap();
        assert_eq!(record.status, TxnStatus::Attempting);
        assert_eq!(record.operation_type.as_deref(), Some("document_write"));

        log.complete(&id).unwrap();
        let record = log.get(&id).unwrap().unwrap();
        assert_eq!(record.status, TxnStatus::Completed);
        assert!(record.completed_at.is_some());

        // Terminal statuses are never rewritten
        log.fail(&id, "late failure").unwrap();
        assert_eq!(log.get(&id).unwrap().unwrap().status, TxnStatus::Completed);
    }

    #[test]
    fn failure_reason_is_recorded() {
        let (_dir, db) = temp_db();
        let log = TransactionLog::new(db, 3);

        let id = log.begin("POST", PATH, "document_write", "sess-1").unwrap();
        log.fail(&id, "backend returned 500").unwrap();

        let record = log.get(&id).unwrap().unwrap();
        assert_eq!(record.status, TxnStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("backend returned 500"));
    }

    #[test]
    fn recovery_classifies_stuck_rows() {
        let (_dir, db) = temp_db();
        let log = TransactionLog::new(db.clone(), 3);
        let wal = WalStore::new(db, 3);

        // One stuck transaction whose write made it through the WAL
        let covered = log.begin("POST", PATH, "document_write", "s").unwrap();
        let write_id = wal
            .append("POST", PATH, b"{}", &ReplayHeaders::default(), InstanceName::Replica, Some("c"))
            .unwrap();
        wal.mark_synced(write_id).unwrap();

        // One stuck transaction with no trace in the WAL
        let lost = log.begin("POST", "/api/v2/other", "document_write", "s").unwrap();

        // Zero threshold: both rows are immediately "stuck"
        let report = log.recover_stuck(Duration::from_secs(0), &wal).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 1);

        assert_eq!(log.get(&covered).unwrap().unwrap().status, TxnStatus::Recovered);
        assert_eq!(log.get(&lost).unwrap().unwrap().status, TxnStatus::Failed);
    }

    #[test]
    fn summary_counts_by_status() {
        let (_dir, db) = temp_db();
        let log = TransactionLog::new(db, 3);

        let a = log.begin("POST", PATH, "document_write", "s").unwrap();
        log.complete(&a).unwrap();
        let b = log.begin("DELETE", PATH, "collection_delete", "s").unwrap();
        log.fail(&b, "both instances down").unwrap();
        log.begin("POST", PATH, "document_write", "s").unwrap();

        let summary = log.summary().unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.attempting, 1);
        assert_eq!(summary.pending_recovery, 2);
    }

    #[test]
    fn cleanup_spares_active_rows() {
        let (_dir, db) = temp_db();
        let log = TransactionLog::new(db, 3);

        let done = log.begin("POST", PATH, "document_write", "s").unwrap();
        log.complete(&done).unwrap();
        log.begin("POST", PATH, "document_write", "s").unwrap();

        let deleted = log.cleanup(0).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(log.summary().unwrap().attempting, 1);
    }
}
