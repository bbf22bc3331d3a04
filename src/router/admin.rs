// Admin surface - operator endpoints for health, WAL, mappings, and the
// transaction safety log
//
// These endpoints never bypass the system invariants: mapping deletion in
// particular is only accepted once both backends report the collection
// absent, so an operator cannot orphan data that still exists somewhere.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::VERSION;
use crate::db::oplog;
use crate::db::wal::WalCounts;
use crate::health::{InstanceName, InstanceSnapshot};
use crate::paths;

use super::RouterState;

/// Errors returned by admin endpoints, as JSON
#[derive(Debug)]
pub(crate) enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = json!({"error": message}).to_string();
        Response::builder()
            .status(status)
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("internal error")))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{e:#}"))
    }
}

/// GET /health - process liveness only
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": VERSION}))
}

/// Aggregate state returned by GET /status
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: i64,
    pub instances: Vec<InstanceSnapshot>,
    pub wal: WalCounts,
    pub strategy: StrategyInfo,
    pub memory: MemoryInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub read_replica_ratio: f64,
    pub max_workers: usize,
    pub wal_batch_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub rss_mb: u64,
    pub limit_mb: u64,
    pub pressure: bool,
}

/// GET /status
pub async fn status(State(state): State<RouterState>) -> Result<Json<StatusResponse>, ApiError> {
    let wal = state.wal.counts()?;
    Ok(Json(StatusResponse {
        version: VERSION.to_string(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        instances: state
            .registry
            .all()
            .into_iter()
            .map(|i| i.snapshot())
            .collect(),
        wal,
        strategy: StrategyInfo {
            read_replica_ratio: state.config.read_replica_ratio,
            max_workers: state.config.max_workers,
            wal_batch_size: state.config.wal_batch_size,
        },
        memory: MemoryInfo {
            rss_mb: state.memory.rss_bytes() / (1024 * 1024),
            limit_mb: state.config.memory_limit_mb,
            pressure: state.memory.under_pressure(),
        },
    }))
}

/// GET /wal/status - counts, recent entries, and replayer liveness
pub async fn wal_status(
    State(state): State<RouterState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = state.wal.counts()?;
    let recent = state.wal.list_recent(50)?;

    let workers: Vec<serde_json::Value> = {
        let conn = state.db.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT worker_id, pid, last_heartbeat, batch_size, memory_pressure
                 FROM sync_workers ORDER BY last_heartbeat DESC",
            )
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(json!({
                    "worker_id": row.get::<_, String>(0)?,
                    "pid": row.get::<_, Option<i64>>(1)?,
                    "last_heartbeat": row.get::<_, String>(2)?,
                    "batch_size": row.get::<_, i64>(3)?,
                    "memory_pressure": row.get::<_, i64>(4)? != 0,
                }))
            })
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };

    Ok(Json(json!({
        "counts": counts,
        "backlog": counts.backlog(),
        "recent": recent,
        "workers": workers,
    })))
}

/// GET /admin/wal_count - legacy alias exposing just the counts
pub async fn wal_count(State(state): State<RouterState>) -> Result<Json<WalCounts>, ApiError> {
    Ok(Json(state.wal.counts()?))
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    pub max_age_hours: u32,
}

/// POST /wal/cleanup - purge terminal WAL entries past the age threshold
pub async fn wal_cleanup(
    State(state): State<RouterState>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.wal.purge(req.max_age_hours)?;
    tracing::info!(
        "Manual WAL cleanup removed {deleted} entries older than {}h",
        req.max_age_hours
    );
    Ok(Json(json!({"deleted": deleted, "max_age_hours": req.max_age_hours})))
}

/// GET /collection/mappings
pub async fn list_mappings(
    State(state): State<RouterState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mappings = state.mappings.list()?;
    Ok(Json(json!({"count": mappings.len(), "mappings": mappings})))
}

/// DELETE /collection/mappings/:name
///
/// Accepted only when both backends report the collection absent; a 409
/// is returned while either still has it (or cannot be asked).
pub async fn delete_mapping(
    State(state): State<RouterState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mapping = state
        .mappings
        .resolve_by_name(&name)?
        .ok_or_else(|| ApiError::NotFound(format!("no mapping for {name:?}")))?;

    for instance in state.registry.all() {
        let reference = mapping.id_on(instance.name).unwrap_or(&name);
        match collection_exists(&state, &instance.base_url, reference).await {
            Ok(false) => {}
            Ok(true) => {
                return Err(ApiError::Conflict(format!(
                    "{} still has collection {name:?}; delete it there first",
                    instance.name
                )));
            }
            Err(e) => {
                return Err(ApiError::Conflict(format!(
                    "cannot confirm absence on {}: {e}",
                    instance.name
                )));
            }
        }
    }

    let removed = state.mappings.delete(&name)?;
    tracing::info!("Mapping {name:?} removed by operator");
    Ok(Json(json!({"deleted": removed, "name": name})))
}

/// Probe one backend for a collection by name or identifier
async fn collection_exists(
    state: &RouterState,
    base_url: &str,
    reference: &str,
) -> Result<bool, String> {
    let url = format!(
        "{base_url}{}/collections/{reference}",
        paths::DEFAULT_SEGMENTS
    );
    let response = state
        .forwarder
        .send(
            &axum::http::Method::GET,
            &url,
            &axum::http::HeaderMap::new(),
            bytes::Bytes::new(),
        )
        .await
        .map_err(|e| e.to_string())?;

    if response.status == reqwest::StatusCode::NOT_FOUND {
        Ok(false)
    } else if response.is_success() {
        Ok(true)
    } else {
        Err(format!("backend returned {}", response.status))
    }
}

/// GET /transaction/safety/status
pub async fn txn_status(
    State(state): State<RouterState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.txn_log.summary()?;
    Ok(Json(json!({"summary": summary})))
}

/// GET /transaction/safety/transaction/:id
pub async fn txn_get(
    State(state): State<RouterState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.txn_log.get(&id)? {
        Some(record) => Ok(Json(json!({"transaction": record}))),
        None => Err(ApiError::NotFound(format!("no transaction {id:?}"))),
    }
}

/// POST /transaction/safety/recovery/trigger
pub async fn txn_recover(
    State(state): State<RouterState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state
        .txn_log
        .recover_stuck(state.config.txn_stuck_after, &state.wal)?;
    tracing::info!(
        "Transaction recovery pass: {} examined, {} recovered, {} failed, {} abandoned",
        report.examined,
        report.recovered,
        report.failed,
        report.abandoned
    );
    Ok(Json(json!({"recovery": report})))
}

/// POST /transaction/safety/cleanup
pub async fn txn_cleanup(
    State(state): State<RouterState>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.txn_log.cleanup(req.max_age_hours)?;
    Ok(Json(json!({"deleted": deleted, "max_age_hours": req.max_age_hours})))
}

/// GET /metrics/performance - latency percentiles per instance over the
/// trailing hour
pub async fn performance(
    State(state): State<RouterState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let primary = oplog::latency_summary(&state.db, InstanceName::Primary, 1)?;
    let replica = oplog::latency_summary(&state.db, InstanceName::Replica, 1)?;
    Ok(Json(json!({"window_hours": 1, "primary": primary, "replica": replica})))
}
