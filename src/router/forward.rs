// Outbound request forwarding
//
// All traffic to the backends funnels through one Forwarder: a shared
// reqwest client plus a semaphore bounding outbound concurrency to the
// configured worker count. Handlers suspend on the semaphore when the
// pool is saturated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use tokio::sync::Semaphore;

/// Response captured from a backend forward
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
    pub elapsed_ms: u64,
}

impl ForwardResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Forward failure before any backend response arrived
#[derive(Debug)]
pub enum ForwardError {
    /// Connect error, timeout, or reset - retryable on the other instance
    Transport(String),
    /// The request could not be constructed; not retryable
    InvalidRequest(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Transport(msg) => write!(f, "transport error: {msg}"),
            ForwardError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

/// Request headers that must not be forwarded verbatim
const HOP_BY_HOP: &[&str] = &["host", "connection", "transfer-encoding", "content-length"];

/// Shared outbound HTTP plumbing
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    /// Worker pool: bounds concurrent outbound calls
    workers: Arc<Semaphore>,
}

impl Forwarder {
    pub fn new(timeout: Duration, max_workers: usize) -> anyhow::Result<Self> {
        // Force HTTP/1.1 to avoid HTTP/2 connection reset issues with some
        // backend deployments
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .http1_only()
            .build()?;
        Ok(Self {
            client,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        })
    }

    /// Forward one request and buffer the full response.
    ///
    /// Suspends until a worker slot is free. The caller supplies the full
    /// URL; headers are copied minus hop-by-hop ones.
    pub async fn send(
        &self,
        method: &axum::http::Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ForwardResponse, ForwardError> {
        // A closed semaphore would mean shutdown; surface as transport
        let _slot = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ForwardError::Transport("worker pool closed".into()))?;

        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| ForwardError::InvalidRequest(format!("invalid HTTP method: {e}")))?;

        let mut request = self.client.request(method, url).body(body);
        for (key, value) in headers.iter() {
            if HOP_BY_HOP.contains(&key.as_str()) {
                continue;
            }
            request = request.header(key.as_str(), value.as_bytes());
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        let status = response.status();
        let resp_headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ForwardError::Transport(format!("reading response body: {e}")))?;

        Ok(ForwardResponse {
            status,
            headers: resp_headers,
            body,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Forward with bounded in-request retries on transport errors.
    /// Used by the DELETE fan-out where each instance attempt is
    /// independently retried before being deferred to the WAL.
    pub async fn send_with_retries(
        &self,
        method: &axum::http::Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        attempts: u32,
    ) -> Result<ForwardResponse, ForwardError> {
        let mut last_err = None;
        for attempt in 0..attempts.max(1) {
            match self.send(method, url, headers, body.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(ForwardError::Transport(msg)) => {
                    tracing::debug!(
                        "Transport error on attempt {}/{} to {url}: {msg}",
                        attempt + 1,
                        attempts
                    );
                    last_err = Some(ForwardError::Transport(msg));
                    // Short linear backoff between in-request retries
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt + 1))).await;
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Err(last_err.unwrap_or_else(|| ForwardError::Transport("no attempts made".into())))
    }
}

/// Copy backend response headers onto the client response, skipping
/// hop-by-hop headers that axum manages itself.
pub fn copy_response_headers(
    mut builder: axum::http::response::Builder,
    headers: &reqwest::header::HeaderMap,
) -> axum::http::response::Builder {
    for (key, value) in headers.iter() {
        if key == "transfer-encoding" || key == "connection" || key == "content-length" {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes());
    }
    builder
}
