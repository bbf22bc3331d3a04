// Main proxy handler - every client request enters here
//
// The pipeline per request: normalise the path, classify read vs write,
// pick target instance(s) from live health state, rewrite collection
// identifiers for the target, record the transaction and WAL entries for
// writes, forward, and map the backend response back to the client.
//
// Ordering matters on the write path: the WAL entry for the deferred
// target is appended BEFORE the forward, so a crash in between costs at
// worst a duplicate delivery, never a lost write.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, Response},
};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::automap::{self, CreatedCollection};
use crate::db::wal::ReplayHeaders;
use crate::db::{oplog, RewriteOutcome};
use crate::events::RouterEvent;
use crate::health::{Instance, InstanceName};
use crate::paths;

use super::classify::{classify, RequestKind, WriteKind};
use super::error::RouterError;
use super::forward::{copy_response_headers, ForwardError, ForwardResponse};
use super::{pseudo_random, RouterState};

/// In-request retry attempts per instance for the DELETE fan-out
const DELETE_ATTEMPTS: u32 = 2;

/// Main entry point - intercepts and forwards all requests
pub async fn route_request(
    State(state): State<RouterState>,
    req: Request<Body>,
) -> Result<Response<Body>, RouterError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let path = paths::normalize(uri.path());
    let query = uri.query().map(|q| q.to_string());
    let kind = classify(&method, &path);

    tracing::debug!("Routing {} {} ({:?})", method, path, kind);

    // Oversized bodies are shed before buffering; this is the same 503
    // contract as RSS pressure, applied per request
    let body_limit = state.config.memory_limit_mb as usize * 1024 * 1024;
    if let Some(len) = content_length(&headers) {
        if len >= body_limit {
            return Err(RouterError::MemoryPressure);
        }
    }
    let body = axum::body::to_bytes(req.into_body(), body_limit)
        .await
        .map_err(|e| RouterError::BodyRead(e.to_string()))?;

    match kind {
        RequestKind::Read => handle_read(state, method, path, query, headers, body).await,
        RequestKind::Write(WriteKind::CollectionDelete) => {
            handle_delete(state, method, path, query, headers, body).await
        }
        RequestKind::Write(kind) => {
            handle_write(state, kind, method, path, query, headers, body).await
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

/// Reads never touch the WAL. The chosen instance is retried once on the
/// other healthy instance on transport errors and 5xx; stale reads on the
/// replica inside the convergence window are part of the contract.
async fn handle_read(
    state: RouterState,
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, RouterError> {
    let healthy = state.registry.healthy();
    if healthy.is_empty() {
        return Err(RouterError::NoHealthyInstance);
    }

    let target = choose_read_target(&state, &healthy);
    let first = forward_read(&state, &target, &method, &path, &query, &headers, body.clone()).await;

    match first {
        Ok(resp) if !resp.status.is_server_error() => build_response(resp, None),
        first => {
            // One retry on the other healthy instance, then surface the
            // original failure
            if let Some(other) = healthy.iter().find(|i| i.name != target.name) {
                tracing::debug!(
                    "Read failed on {}, retrying on {}",
                    target.name,
                    other.name
                );
                if let Ok(resp) =
                    forward_read(&state, other, &method, &path, &query, &headers, body).await
                {
                    if !resp.status.is_server_error() {
                        return build_response(resp, None);
                    }
                }
            }
            match first {
                Ok(resp) => build_response(resp, None),
                Err(e) => Err(RouterError::Upstream(e.to_string())),
            }
        }
    }
}

/// Weighted read target selection: prefer the replica for load relief at
/// the configured ratio, fall back to whichever side is healthy.
fn choose_read_target(state: &RouterState, healthy: &[Arc<Instance>]) -> Arc<Instance> {
    if healthy.len() == 1 {
        return healthy[0].clone();
    }
    let roll = (pseudo_random() % 1000) as f64 / 1000.0;
    let prefer = if roll < state.config.read_replica_ratio {
        InstanceName::Replica
    } else {
        InstanceName::Primary
    };
    healthy
        .iter()
        .find(|i| i.name == prefer)
        .unwrap_or(&healthy[0])
        .clone()
}

async fn forward_read(
    state: &RouterState,
    instance: &Arc<Instance>,
    method: &Method,
    path: &str,
    query: &Option<String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<ForwardResponse, ForwardError> {
    // When the coordination database is down reads keep flowing with the
    // original path; only identifier rewrites are lost
    let effective = match state.mappings.rewrite_path(path, instance.name) {
        Ok(RewriteOutcome::Rewritten(p)) => p,
        Ok(RewriteOutcome::PassThrough) => path.to_string(),
        Ok(RewriteOutcome::Unmapped) => {
            tracing::debug!("Unmapped identifier in read path {path}; falling through");
            path.to_string()
        }
        Err(e) => {
            tracing::warn!("Mapping lookup failed, forwarding read unrewritten: {e:#}");
            path.to_string()
        }
    };

    let url = build_url(&instance.base_url, &effective, query);
    let outcome = state.forwarder.send(method, &url, headers, body).await;

    observe(state, instance, "read", &outcome);
    outcome
}

// ─────────────────────────────────────────────────────────────────────────────
// Writes (non-DELETE)
// ─────────────────────────────────────────────────────────────────────────────

/// Non-DELETE writes go to the primary when healthy, otherwise fail over
/// to the replica. The instance that did not take the write gets a WAL
/// entry before the forward.
async fn handle_write(
    state: RouterState,
    kind: WriteKind,
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, RouterError> {
    if state.memory.under_pressure() {
        return Err(RouterError::MemoryPressure);
    }

    let (immediate, deferred) = select_write_targets(&state, &path).await?;

    let op_type = RequestKind::Write(kind).operation_type();
    let session = client_session(&headers);
    let txn_id = state
        .txn_log
        .begin(method.as_str(), &path, op_type, &session)
        .map_err(|e| RouterError::DatabaseUnavailable(format!("{e:#}")))?;

    let wal_path = with_query(&path, &query);
    let collection_id = paths::collection_ref(&path).map(|r| r.as_str().to_string());
    let replay = replay_headers(&headers);

    // Collection creations skip the deferred WAL entry: the auto-creator
    // owns counterpart creation because the deferred instance will assign
    // its own identifier
    if kind != WriteKind::CollectionCreate {
        state
            .wal
            .append(
                method.as_str(),
                &wal_path,
                &body,
                &replay,
                deferred.name,
                collection_id.as_deref(),
            )
            .map_err(|e| RouterError::DatabaseUnavailable(format!("{e:#}")))?;
        if let Some(ref name) = collection_id {
            let _ = oplog::touch_sync_collection(&state.db, name, 1, false);
        }
    }

    // Rewrite for the immediate target; an unmapped identifier falls
    // through with the original path AND queues the write for the
    // immediate side too, so replay converges once the mapping exists
    let forward_path = match state.mappings.rewrite_path(&path, immediate.name) {
        Ok(RewriteOutcome::Rewritten(p)) => p,
        Ok(RewriteOutcome::PassThrough) => path.clone(),
        Ok(RewriteOutcome::Unmapped) => {
            tracing::warn!("Unmapped identifier in write path {path}; queueing both sides");
            state
                .wal
                .append(
                    method.as_str(),
                    &wal_path,
                    &body,
                    &replay,
                    immediate.name,
                    collection_id.as_deref(),
                )
                .map_err(|e| RouterError::DatabaseUnavailable(format!("{e:#}")))?;
            path.clone()
        }
        Err(e) => return Err(RouterError::DatabaseUnavailable(format!("{e:#}"))),
    };

    let url = build_url(&immediate.base_url, &forward_path, &query);
    let outcome = state
        .forwarder
        .send(&method, &url, &headers, body.clone())
        .await;
    observe(&state, &immediate, "write", &outcome);

    match outcome {
        Ok(resp) if resp.status.is_server_error() => {
            // The client sees 502 with the transaction id for audit; the
            // write is preserved for replay on the intended immediate
            // target as well
            let _ = state.wal.append(
                method.as_str(),
                &wal_path,
                &body,
                &replay,
                immediate.name,
                collection_id.as_deref(),
            );
            let reason = format!("{} returned {}", immediate.name, resp.status);
            finish_txn(&state, &txn_id, Err(&reason));
            tracing::error!("Write failed: {reason} (txn {txn_id})");
            json_response(
                axum::http::StatusCode::BAD_GATEWAY,
                json!({"error": reason}),
                Some(&txn_id),
            )
        }
        Ok(resp) => {
            finish_txn(&state, &txn_id, Ok(()));
            if kind == WriteKind::CollectionCreate && resp.is_success() {
                notify_creation(&state, immediate.name, &body, &resp).await;
            }
            build_response(resp, Some(&txn_id))
        }
        Err(ForwardError::Transport(msg)) => {
            let _ = state.wal.append(
                method.as_str(),
                &wal_path,
                &body,
                &replay,
                immediate.name,
                collection_id.as_deref(),
            );
            let reason = format!("{} unreachable: {msg}", immediate.name);
            finish_txn(&state, &txn_id, Err(&reason));
            tracing::error!("Write failed: {reason} (txn {txn_id})");
            json_response(
                axum::http::StatusCode::BAD_GATEWAY,
                json!({"error": reason}),
                Some(&txn_id),
            )
        }
        Err(ForwardError::InvalidRequest(msg)) => {
            finish_txn(&state, &txn_id, Err(&msg));
            Err(RouterError::BodyRead(msg))
        }
    }
}

/// Primary takes writes while healthy; failover to the replica is
/// recorded durably and alerted
async fn select_write_targets(
    state: &RouterState,
    path: &str,
) -> Result<(Arc<Instance>, Arc<Instance>), RouterError> {
    let primary = state.registry.primary.clone();
    let replica = state.registry.replica.clone();

    if primary.is_healthy() {
        Ok((primary, replica))
    } else if replica.is_healthy() {
        if let Err(e) = oplog::record_failover_event(
            &state.db,
            "write_failover",
            InstanceName::Primary,
            path,
        ) {
            tracing::warn!("Failed to record failover event: {e:#}");
        }
        let _ = state.event_tx.try_send(RouterEvent::WriteFailover {
            timestamp: Utc::now(),
            from: InstanceName::Primary,
            to: InstanceName::Replica,
            path: path.to_string(),
        });
        Ok((replica, primary))
    } else {
        Err(RouterError::NoHealthyInstance)
    }
}

/// Hand a successful creation to the auto-creator
async fn notify_creation(
    state: &RouterState,
    source: InstanceName,
    request_body: &Bytes,
    resp: &ForwardResponse,
) {
    let Some(id) = automap::extract_collection_id(&resp.body) else {
        tracing::warn!("Creation response had no id; skipping auto-mapping");
        return;
    };
    let name = automap::extract_collection_name(&resp.body)
        .or_else(|| {
            serde_json::from_slice::<serde_json::Value>(request_body)
                .ok()
                .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(String::from))
        });
    let Some(name) = name else {
        tracing::warn!("Creation response had no name; skipping auto-mapping");
        return;
    };
    let config = serde_json::from_slice(request_body).ok();
    if state
        .automap_tx
        .send(CreatedCollection {
            source,
            name,
            id,
            config,
        })
        .await
        .is_err()
    {
        tracing::error!("Auto-creator channel closed; mapping will lag until replay");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DELETE fan-out
// ─────────────────────────────────────────────────────────────────────────────

/// DELETE runs against every healthy instance in parallel; 404 counts as
/// success (already gone). Unhealthy instances get WAL entries up front.
async fn handle_delete(
    state: RouterState,
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, RouterError> {
    if state.memory.under_pressure() {
        return Err(RouterError::MemoryPressure);
    }

    let session = client_session(&headers);
    let txn_id = state
        .txn_log
        .begin(method.as_str(), &path, "collection_delete", &session)
        .map_err(|e| RouterError::DatabaseUnavailable(format!("{e:#}")))?;

    let wal_path = with_query(&path, &query);
    let collection_id = paths::collection_ref(&path).map(|r| r.as_str().to_string());
    let replay = replay_headers(&headers);

    let (healthy, unhealthy): (Vec<_>, Vec<_>) = state
        .registry
        .all()
        .into_iter()
        .cloned()
        .partition(|i| i.is_healthy());

    // Queue the delete for every unreachable instance before touching the
    // network; the replayer treats 404 as success so this is idempotent
    for instance in &unhealthy {
        state
            .wal
            .append(
                method.as_str(),
                &wal_path,
                &body,
                &replay,
                instance.name,
                collection_id.as_deref(),
            )
            .map_err(|e| RouterError::DatabaseUnavailable(format!("{e:#}")))?;
    }

    if healthy.is_empty() {
        finish_txn(&state, &txn_id, Err("no healthy instance; delete queued"));
        return Err(RouterError::NoHealthyInstance);
    }

    // Concurrent per-instance attempts, each with bounded retries
    let attempts = healthy.iter().map(|instance| {
        let state = state.clone();
        let instance = instance.clone();
        let method = method.clone();
        let path = path.clone();
        let query = query.clone();
        let headers = headers.clone();
        let body = body.clone();
        async move {
            let effective = match state.mappings.rewrite_path(&path, instance.name) {
                Ok(RewriteOutcome::Rewritten(p)) => p,
                _ => path.clone(),
            };
            let url = build_url(&instance.base_url, &effective, &query);
            let outcome = state
                .forwarder
                .send_with_retries(&method, &url, &headers, body, DELETE_ATTEMPTS)
                .await;
            observe(&state, &instance, "delete", &outcome);
            (instance, outcome)
        }
    });
    let outcomes = join_all(attempts).await;

    let mut succeeded: Vec<(Arc<Instance>, ForwardResponse)> = Vec::new();
    let mut failed: Vec<(Arc<Instance>, String)> = Vec::new();
    for (instance, outcome) in outcomes {
        match outcome {
            Ok(resp)
                if resp.is_success() || resp.status == reqwest::StatusCode::NOT_FOUND =>
            {
                succeeded.push((instance, resp));
            }
            Ok(resp) => {
                failed.push((instance, format!("returned {}", resp.status)));
            }
            Err(e) => {
                failed.push((instance, e.to_string()));
            }
        }
    }

    // Failed healthy instances fall back to the WAL like unhealthy ones
    for (instance, error) in &failed {
        tracing::warn!("DELETE failed on {} ({error}); deferring to WAL", instance.name);
        let _ = state.wal.append(
            method.as_str(),
            &wal_path,
            &body,
            &replay,
            instance.name,
            collection_id.as_deref(),
        );
    }

    if let Some(ref reference) = collection_id {
        if failed.is_empty() && unhealthy.is_empty() {
            // Both backends confirmed the collection gone; drop the row.
            // With any side deferred the replayer removes it after replay.
            if let Err(e) = remove_mapping_for(&state, reference) {
                tracing::debug!("Mapping cleanup after delete skipped: {e:#}");
            }
        }
    }

    if failed.is_empty() {
        finish_txn(&state, &txn_id, Ok(()));
        // Prefer a real backend response; when every healthy instance said
        // 404 the collection was already gone, which is success
        if let Some((_, resp)) = succeeded.iter().find(|(_, r)| r.is_success()) {
            let resp = ForwardResponse {
                status: resp.status,
                headers: resp.headers.clone(),
                body: resp.body.clone(),
                elapsed_ms: resp.elapsed_ms,
            };
            return build_response(resp, Some(&txn_id));
        }
        return json_response(
            axum::http::StatusCode::OK,
            json!({"success": true, "note": "collection already absent"}),
            Some(&txn_id),
        );
    }

    if !succeeded.is_empty() {
        // Partial: some instances applied it, the rest are queued
        finish_txn(&state, &txn_id, Ok(()));
        let summary = delete_summary(&succeeded, &failed, &unhealthy);
        return json_response(axum::http::StatusCode::MULTI_STATUS, summary, Some(&txn_id));
    }

    finish_txn(&state, &txn_id, Err("delete failed on every healthy instance"));
    let summary = delete_summary(&succeeded, &failed, &unhealthy);
    json_response(
        axum::http::StatusCode::SERVICE_UNAVAILABLE,
        summary,
        Some(&txn_id),
    )
}

/// The mapping table is keyed by name; a delete addressed by identifier
/// resolves back to the owning row's name before the row is dropped
fn remove_mapping_for(state: &RouterState, reference: &str) -> anyhow::Result<bool> {
    use crate::paths::CollectionRef;
    let name = match paths::collection_ref(&format!("/collections/{reference}")) {
        Some(CollectionRef::Name(name)) => Some(name),
        Some(CollectionRef::Id(id)) => state
            .mappings
            .resolve_by_id_on_instance(&id, InstanceName::Primary)?
            .or(state
                .mappings
                .resolve_by_id_on_instance(&id, InstanceName::Replica)?)
            .map(|m| m.name),
        None => None,
    };
    match name {
        Some(name) => state.mappings.delete(&name),
        None => Ok(false),
    }
}

fn delete_summary(
    succeeded: &[(Arc<Instance>, ForwardResponse)],
    failed: &[(Arc<Instance>, String)],
    unhealthy: &[Arc<Instance>],
) -> serde_json::Value {
    json!({
        "succeeded": succeeded.iter().map(|(i, r)| json!({
            "instance": i.name.as_str(),
            "status": r.status.as_u16(),
        })).collect::<Vec<_>>(),
        "failed": failed.iter().map(|(i, e)| json!({
            "instance": i.name.as_str(),
            "error": e,
        })).collect::<Vec<_>>(),
        "deferred": unhealthy.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(axum::http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn build_url(base_url: &str, path: &str, query: &Option<String>) -> String {
    match query {
        Some(q) => format!("{base_url}{path}?{q}"),
        None => format!("{base_url}{path}"),
    }
}

fn with_query(path: &str, query: &Option<String>) -> String {
    match query {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    }
}

/// Capture the header subset a replay needs
fn replay_headers(headers: &HeaderMap) -> ReplayHeaders {
    let grab = |name: axum::http::HeaderName| {
        headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    ReplayHeaders {
        content_type: grab(axum::http::header::CONTENT_TYPE),
        authorization: grab(axum::http::header::AUTHORIZATION),
    }
}

/// Hash the client's credential for session tracking (never store the
/// raw value)
fn client_session(headers: &HeaderMap) -> String {
    let credential = headers
        .get(axum::http::header::AUTHORIZATION)
        .or_else(|| headers.get("x-api-key"));
    match credential {
        Some(value) => {
            let mut hasher = Sha256::new();
            hasher.update(value.as_bytes());
            let hash = hasher.finalize();
            format!("{:x}", hash)[..16].to_string()
        }
        None => "anonymous".to_string(),
    }
}

/// Update the transaction record after the forward; failures here are
/// logged, not surfaced - the client already has its answer
fn finish_txn(state: &RouterState, txn_id: &str, outcome: Result<(), &str>) {
    let result = match outcome {
        Ok(()) => state.txn_log.complete(txn_id),
        Err(reason) => state.txn_log.fail(txn_id, reason),
    };
    if let Err(e) = result {
        tracing::error!("Failed to finalise transaction {txn_id}: {e:#}");
    }
}

fn observe(
    state: &RouterState,
    instance: &Arc<Instance>,
    operation: &str,
    outcome: &Result<ForwardResponse, ForwardError>,
) {
    match outcome {
        Ok(resp) => {
            instance.observe_request_outcome(!resp.status.is_server_error());
            if let Err(e) =
                oplog::record_latency_sample(&state.db, instance.name, operation, resp.elapsed_ms)
            {
                tracing::debug!("Latency sample not recorded: {e:#}");
            }
        }
        Err(_) => instance.observe_request_outcome(false),
    }
}

/// Map a backend response onto the client response verbatim, adding the
/// transaction correlation header for writes
fn build_response(
    resp: ForwardResponse,
    txn_id: Option<&str>,
) -> Result<Response<Body>, RouterError> {
    let mut builder = Response::builder().status(resp.status.as_u16());
    builder = copy_response_headers(builder, &resp.headers);
    if let Some(id) = txn_id {
        builder = builder.header("X-Transaction-Id", id);
    }
    builder
        .body(Body::from(resp.body))
        .map_err(|e| RouterError::ResponseBuild(e.to_string()))
}

fn json_response(
    status: axum::http::StatusCode,
    value: serde_json::Value,
    txn_id: Option<&str>,
) -> Result<Response<Body>, RouterError> {
    let mut builder = Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, "application/json");
    if let Some(id) = txn_id {
        builder = builder.header("X-Transaction-Id", id);
    }
    builder
        .body(Body::from(value.to_string()))
        .map_err(|e| RouterError::ResponseBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_session_hashes_credentials() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_session(&headers), "anonymous");

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer secret-token".parse().unwrap(),
        );
        let session = client_session(&headers);
        assert_eq!(session.len(), 16);
        assert_ne!(session, "anonymous");
        // Stable for the same credential
        assert_eq!(session, client_session(&headers));
    }

    #[test]
    fn urls_preserve_queries() {
        assert_eq!(
            build_url("http://p:8000", "/api/v2/heartbeat", &None),
            "http://p:8000/api/v2/heartbeat"
        );
        assert_eq!(
            build_url("http://p:8000", "/x", &Some("limit=5".into())),
            "http://p:8000/x?limit=5"
        );
        assert_eq!(with_query("/x", &Some("a=1".into())), "/x?a=1");
    }

    #[test]
    fn replay_headers_keep_only_the_subset() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer t".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());

        let replay = replay_headers(&headers);
        assert_eq!(replay.content_type.as_deref(), Some("application/json"));
        assert_eq!(replay.authorization.as_deref(), Some("Bearer t"));
    }

    #[test]
    fn content_length_parses_when_present() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(axum::http::header::CONTENT_LENGTH, "1024".parse().unwrap());
        assert_eq!(content_length(&headers), Some(1024));
    }
}
