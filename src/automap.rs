// Mapping auto-creator
//
// When a collection is created through the router, only the instance that
// served the request knows it. This worker receives each successful
// creation, records the source identifier, creates the counterpart
// collection on the other instance, and completes the mapping. If the
// other instance is down, a collection-creation WAL entry is queued
// instead and the replayer finishes the job on recovery.
//
// Idempotence: creations are sent with get_or_create, so a repeat for an
// existing name returns the existing collection instead of an error.

use anyhow::{anyhow, Context, Result};
use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::db::wal::ReplayHeaders;
use crate::db::{MappingStore, WalStore};
use crate::health::{InstanceName, InstanceRegistry};
use crate::paths;
use crate::router::forward::{ForwardError, Forwarder};

/// A collection creation observed by the router
#[derive(Debug, Clone)]
pub struct CreatedCollection {
    /// Instance that served the creation
    pub source: InstanceName,
    pub name: String,
    /// Identifier the source instance assigned
    pub id: String,
    /// Original creation request body, remembered so the counterpart can
    /// be created with the same configuration
    pub config: Option<Value>,
}

pub struct AutoMapper {
    registry: InstanceRegistry,
    mappings: MappingStore,
    wal: WalStore,
    forwarder: Forwarder,
    rx: mpsc::Receiver<CreatedCollection>,
}

impl AutoMapper {
    pub fn new(
        registry: InstanceRegistry,
        mappings: MappingStore,
        wal: WalStore,
        forwarder: Forwarder,
        rx: mpsc::Receiver<CreatedCollection>,
    ) -> Self {
        Self {
            registry,
            mappings,
            wal,
            forwarder,
            rx,
        }
    }

    /// Run until shutdown. Per-item failures are logged and absorbed; the
    /// WAL fallback guarantees eventual convergence.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("Mapping auto-creator started");
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(created) => {
                            if let Err(e) = self.handle(created).await {
                                tracing::error!("Auto-mapping failed: {e:#}");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Mapping auto-creator shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, created: CreatedCollection) -> Result<()> {
        let CreatedCollection {
            source,
            name,
            id,
            config,
        } = created;

        let (mapping, _) = self
            .mappings
            .upsert(&name, source, &id, config.as_ref())
            .await?;

        let other = source.other();
        if mapping.id_on(other).is_some() {
            // Counterpart already known - a racing creation got there first
            tracing::debug!("Mapping for {name:?} already complete");
            return Ok(());
        }

        let other_instance = self.registry.get(other);
        if !other_instance.is_healthy() {
            self.defer_creation(other, &name, config.as_ref())?;
            return Ok(());
        }

        match create_collection_on(&self.forwarder, &other_instance.base_url, &name, config.as_ref())
            .await
        {
            Ok(other_id) => {
                self.mappings.upsert(&name, other, &other_id, None).await?;
                tracing::info!(
                    "Created counterpart collection {name:?} on {other} (id {other_id})"
                );
                Ok(())
            }
            Err(CreateError::Transport(msg)) => {
                tracing::warn!(
                    "Counterpart creation for {name:?} on {other} unreachable ({msg}); deferring"
                );
                self.defer_creation(other, &name, config.as_ref())?;
                Ok(())
            }
            Err(CreateError::Rejected(status, body)) => {
                Err(anyhow!("{other} rejected creation of {name:?}: {status} {body}"))
            }
        }
    }

    /// Queue a collection-creation WAL entry for the unreachable instance
    fn defer_creation(&self, target: InstanceName, name: &str, config: Option<&Value>) -> Result<()> {
        let payload = creation_payload(name, config);
        let path = format!("{}/collections", paths::DEFAULT_SEGMENTS);
        self.wal.append(
            "POST",
            &path,
            payload.to_string().as_bytes(),
            &ReplayHeaders {
                content_type: Some("application/json".into()),
                authorization: None,
            },
            target,
            Some(name),
        )?;
        tracing::info!("Deferred creation of {name:?} queued for {target}");
        Ok(())
    }
}

/// Failure modes of a direct counterpart creation
#[derive(Debug)]
pub enum CreateError {
    /// Instance unreachable; the creation should be deferred to the WAL
    Transport(String),
    /// Instance reachable but refused the request
    Rejected(u16, String),
}

/// Build the creation body: the remembered config with the name and
/// get_or_create stitched in
pub fn creation_payload(name: &str, config: Option<&Value>) -> Value {
    let mut body = match config {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };
    if let Value::Object(ref mut map) = body {
        map.insert("name".into(), json!(name));
        map.insert("get_or_create".into(), json!(true));
    }
    body
}

/// Create (or fetch) a collection by name on one instance and return the
/// identifier it reports. Shared by the auto-creator and the replayer's
/// just-in-time creation path.
pub async fn create_collection_on(
    forwarder: &Forwarder,
    base_url: &str,
    name: &str,
    config: Option<&Value>,
) -> Result<String, CreateError> {
    let url = format!("{base_url}{}/collections", paths::DEFAULT_SEGMENTS);
    let body = creation_payload(name, config);

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );

    let response = forwarder
        .send(
            &axum::http::Method::POST,
            &url,
            &headers,
            Bytes::from(body.to_string()),
        )
        .await
        .map_err(|e| match e {
            ForwardError::Transport(msg) => CreateError::Transport(msg),
            ForwardError::InvalidRequest(msg) => CreateError::Rejected(0, msg),
        })?;

    if !response.is_success() {
        return Err(CreateError::Rejected(
            response.status.as_u16(),
            String::from_utf8_lossy(&response.body).into_owned(),
        ));
    }

    extract_collection_id(&response.body)
        .context("creation response had no id")
        .map_err(|e| CreateError::Rejected(response.status.as_u16(), format!("{e:#}")))
}

/// Pull the identifier out of a creation/list response body
pub fn extract_collection_id(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Pull the collection name out of a creation response body
pub fn extract_collection_name(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_payload_keeps_config_and_injects_name() {
        let config = json!({"metadata": {"hnsw:space": "cosine"}});
        let payload = creation_payload("docs", Some(&config));
        assert_eq!(payload["name"], "docs");
        assert_eq!(payload["get_or_create"], true);
        assert_eq!(payload["metadata"]["hnsw:space"], "cosine");
    }

    #[test]
    fn creation_payload_without_config_is_minimal() {
        let payload = creation_payload("docs", None);
        assert_eq!(payload["name"], "docs");
        assert_eq!(payload["get_or_create"], true);
    }

    #[test]
    fn extracts_id_and_name_from_creation_response() {
        let body = br#"{"id":"0e2cf165-4b7a-44b9-9b12-6e0f30e9a1a2","name":"docs","metadata":null}"#;
        assert_eq!(
            extract_collection_id(body).as_deref(),
            Some("0e2cf165-4b7a-44b9-9b12-6e0f30e9a1a2")
        );
        assert_eq!(extract_collection_name(body).as_deref(), Some("docs"));
        assert_eq!(extract_collection_id(b"not json"), None);
    }
}
