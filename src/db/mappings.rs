// Collection identifier mapping store
//
// The same logical collection has distinct backend-assigned identifiers
// on the primary and the replica. This table is the bridge: one row per
// collection name, with either identifier possibly still unknown until
// the auto-creator completes the pair.
//
// A read-mostly in-process cache fronts the table; misses fall through to
// SQLite and populate the cache. Concurrent upserts of the same name are
// serialised through a per-name async lock so racing creations converge
// to a single row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Database;
use crate::health::InstanceName;
use crate::paths::{self, CollectionRef};

/// One row of `collection_id_mapping`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMapping {
    pub name: String,
    pub primary_id: Option<String>,
    pub replica_id: Option<String>,
    /// Creation config remembered so the counterpart can be recreated
    pub config: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl CollectionMapping {
    /// Both identifiers known
    pub fn is_complete(&self) -> bool {
        self.primary_id.is_some() && self.replica_id.is_some()
    }

    pub fn id_on(&self, instance: InstanceName) -> Option<&str> {
        match instance {
            InstanceName::Primary => self.primary_id.as_deref(),
            InstanceName::Replica => self.replica_id.as_deref(),
        }
    }
}

/// Result of rewriting a path for a target instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// Path is already valid on the target (name reference, or an
    /// identifier the target assigned)
    PassThrough,
    /// Identifier was swapped for the target instance's identifier
    Rewritten(String),
    /// Identifier has no usable mapping for the target; caller decides
    /// whether to fall through with the original path
    Unmapped,
}

#[derive(Clone)]
pub struct MappingStore {
    db: Database,
    cache: Arc<RwLock<HashMap<String, CollectionMapping>>>,
    /// Per-name guards serialising concurrent upserts
    name_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MappingStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: Arc::new(RwLock::new(HashMap::new())),
            name_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Warm the cache from the table at startup
    pub fn preload(&self) -> Result<usize> {
        let mappings = self.list()?;
        let count = mappings.len();
        let mut cache = self.cache_write();
        for m in mappings {
            cache.insert(m.name.clone(), m);
        }
        Ok(count)
    }

    pub fn resolve_by_name(&self, name: &str) -> Result<Option<CollectionMapping>> {
        if let Some(hit) = self.cache_read().get(name) {
            return Ok(Some(hit.clone()));
        }
        let conn = self.db.conn()?;
        let found = conn
            .query_row(
                "SELECT collection_name, primary_collection_id, replica_collection_id,
                        collection_config, created_at, updated_at
                 FROM collection_id_mapping WHERE collection_name = ?1",
                params![name],
                row_to_mapping,
            )
            .optional()
            .context("resolving mapping by name")?;
        if let Some(ref m) = found {
            self.cache_write().insert(m.name.clone(), m.clone());
        }
        Ok(found)
    }

    /// Find the mapping whose identifier on `instance` equals `id`
    pub fn resolve_by_id_on_instance(
        &self,
        id: &str,
        instance: InstanceName,
    ) -> Result<Option<CollectionMapping>> {
        {
            let cache = self.cache_read();
            if let Some(hit) = cache.values().find(|m| m.id_on(instance) == Some(id)) {
                return Ok(Some(hit.clone()));
            }
        }
        let column = match instance {
            InstanceName::Primary => "primary_collection_id",
            InstanceName::Replica => "replica_collection_id",
        };
        let conn = self.db.conn()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT collection_name, primary_collection_id, replica_collection_id,
                            collection_config, created_at, updated_at
                     FROM collection_id_mapping WHERE {column} = ?1"
                ),
                params![id],
                row_to_mapping,
            )
            .optional()
            .context("resolving mapping by identifier")?;
        if let Some(ref m) = found {
            self.cache_write().insert(m.name.clone(), m.clone());
        }
        Ok(found)
    }

    /// Insert or update one instance's identifier for `name`.
    ///
    /// Serialised per name; two racing creations of the same collection
    /// converge to a single row, each writer filling in its side. Returns
    /// the mapping after the write and whether this call completed it.
    pub async fn upsert(
        &self,
        name: &str,
        instance: InstanceName,
        id: &str,
        config: Option<&serde_json::Value>,
    ) -> Result<(CollectionMapping, bool)> {
        let guard = self.name_lock(name);
        let _held = guard.lock().await;

        let was_complete = self
            .resolve_by_name_uncached(name)?
            .map(|m| m.is_complete())
            .unwrap_or(false);

        let column = match instance {
            InstanceName::Primary => "primary_collection_id",
            InstanceName::Replica => "replica_collection_id",
        };
        let now = super::now();
        let config_text = config.map(|c| c.to_string());

        let conn = self.db.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO collection_id_mapping
                     (collection_name, {column}, collection_config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(collection_name) DO UPDATE SET
                     {column} = excluded.{column},
                     collection_config = COALESCE(excluded.collection_config, collection_config),
                     updated_at = excluded.updated_at"
            ),
            params![name, id, config_text, now],
        )
        .context("upserting collection mapping")?;
        drop(conn);

        let mapping = self
            .resolve_by_name_uncached(name)?
            .context("mapping vanished during upsert")?;
        self.cache_write().insert(name.to_string(), mapping.clone());

        let newly_complete = mapping.is_complete() && !was_complete;
        if newly_complete {
            tracing::info!(
                "Mapping complete for {:?}: primary={} replica={}",
                name,
                mapping.primary_id.as_deref().unwrap_or("-"),
                mapping.replica_id.as_deref().unwrap_or("-"),
            );
        }
        Ok((mapping, newly_complete))
    }

    /// Remove the row; idempotent
    pub fn delete(&self, name: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let deleted = conn.execute(
            "DELETE FROM collection_id_mapping WHERE collection_name = ?1",
            params![name],
        )?;
        self.cache_write().remove(name);
        Ok(deleted > 0)
    }

    pub fn list(&self) -> Result<Vec<CollectionMapping>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT collection_name, primary_collection_id, replica_collection_id,
                    collection_config, created_at, updated_at
             FROM collection_id_mapping ORDER BY collection_name",
        )?;
        let rows = stmt
            .query_map([], row_to_mapping)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rewrite `path` so its collection reference is valid on `target`.
    ///
    /// Name references and identifiers the target already knows pass
    /// through. An identifier belonging to the other instance is swapped
    /// for the target's identifier. An identifier nobody claims - or one
    /// whose mapping has no identifier for the target yet - is `Unmapped`,
    /// never a silent pass-through.
    pub fn rewrite_path(&self, path: &str, target: InstanceName) -> Result<RewriteOutcome> {
        let id = match paths::collection_ref(path) {
            Some(CollectionRef::Id(id)) => id,
            // Names resolve on either backend; nothing to rewrite
            Some(CollectionRef::Name(_)) | None => return Ok(RewriteOutcome::PassThrough),
        };

        if self.resolve_by_id_on_instance(&id, target)?.is_some() {
            return Ok(RewriteOutcome::PassThrough);
        }

        match self.resolve_by_id_on_instance(&id, target.other())? {
            Some(mapping) => match mapping.id_on(target) {
                Some(target_id) => Ok(RewriteOutcome::Rewritten(paths::replace_collection_ref(
                    path, &id, target_id,
                ))),
                None => Ok(RewriteOutcome::Unmapped),
            },
            None => Ok(RewriteOutcome::Unmapped),
        }
    }

    fn resolve_by_name_uncached(&self, name: &str) -> Result<Option<CollectionMapping>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT collection_name, primary_collection_id, replica_collection_id,
                    collection_config, created_at, updated_at
             FROM collection_id_mapping WHERE collection_name = ?1",
            params![name],
            row_to_mapping,
        )
        .optional()
        .context("resolving mapping by name")
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.name_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    fn cache_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CollectionMapping>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CollectionMapping>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn row_to_mapping(row: &Row<'_>) -> rusqlite::Result<CollectionMapping> {
    let config_text: Option<String> = row.get(3)?;
    Ok(CollectionMapping {
        name: row.get(0)?,
        primary_id: row.get(1)?,
        replica_id: row.get(2)?,
        config: config_text.and_then(|t| serde_json::from_str(&t).ok()),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_db;
    use serde_json::json;

    const P1: &str = "11111111-1111-1111-1111-111111111111";
    const R1: &str = "22222222-2222-2222-2222-222222222222";

    fn data_path(id: &str) -> String {
        format!("{}/collections/{id}/add", paths::DEFAULT_SEGMENTS)
    }

    #[tokio::test]
    async fn upsert_completes_after_both_sides() {
        let (_dir, db) = temp_db();
        let store = MappingStore::new(db);

        let (m, complete) = store
            .upsert("docs", InstanceName::Primary, P1, Some(&json!({"hnsw": 16})))
            .await
            .unwrap();
        assert!(!complete);
        assert!(!m.is_complete());

        let (m, complete) = store
            .upsert("docs", InstanceName::Replica, R1, None)
            .await
            .unwrap();
        assert!(complete);
        assert!(m.is_complete());
        assert_eq!(m.primary_id.as_deref(), Some(P1));
        assert_eq!(m.replica_id.as_deref(), Some(R1));
        // Config survives the second upsert
        assert_eq!(m.config, Some(json!({"hnsw": 16})));

        // Re-upserting the same side does not report complete again
        let (_, complete) = store
            .upsert("docs", InstanceName::Replica, R1, None)
            .await
            .unwrap();
        assert!(!complete);
    }

    #[tokio::test]
    async fn resolve_by_id_finds_the_owning_instance() {
        let (_dir, db) = temp_db();
        let store = MappingStore::new(db);
        store
            .upsert("docs", InstanceName::Primary, P1, None)
            .await
            .unwrap();

        let hit = store
            .resolve_by_id_on_instance(P1, InstanceName::Primary)
            .unwrap();
        assert_eq!(hit.unwrap().name, "docs");
        assert!(store
            .resolve_by_id_on_instance(P1, InstanceName::Replica)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rewrite_swaps_foreign_identifiers() {
        let (_dir, db) = temp_db();
        let store = MappingStore::new(db);
        store
            .upsert("docs", InstanceName::Primary, P1, None)
            .await
            .unwrap();
        store
            .upsert("docs", InstanceName::Replica, R1, None)
            .await
            .unwrap();

        // Primary id addressed to the replica gets swapped
        match store
            .rewrite_path(&data_path(P1), InstanceName::Replica)
            .unwrap()
        {
            RewriteOutcome::Rewritten(p) => assert_eq!(p, data_path(R1)),
            other => panic!("expected rewrite, got {other:?}"),
        }

        // Same id addressed to its own instance passes through
        assert_eq!(
            store
                .rewrite_path(&data_path(P1), InstanceName::Primary)
                .unwrap(),
            RewriteOutcome::PassThrough
        );
    }

    #[tokio::test]
    async fn rewrite_signals_unmapped_never_silent() {
        let (_dir, db) = temp_db();
        let store = MappingStore::new(db);

        // Unknown identifier
        let unknown = data_path("33333333-3333-3333-3333-333333333333");
        assert_eq!(
            store.rewrite_path(&unknown, InstanceName::Replica).unwrap(),
            RewriteOutcome::Unmapped
        );

        // Known on primary but replica side still missing
        store
            .upsert("docs", InstanceName::Primary, P1, None)
            .await
            .unwrap();
        assert_eq!(
            store
                .rewrite_path(&data_path(P1), InstanceName::Replica)
                .unwrap(),
            RewriteOutcome::Unmapped
        );

        // Name references never need rewriting
        let by_name = format!("{}/collections/docs/add", paths::DEFAULT_SEGMENTS);
        assert_eq!(
            store.rewrite_path(&by_name, InstanceName::Replica).unwrap(),
            RewriteOutcome::PassThrough
        );
    }

    #[tokio::test]
    async fn racing_upserts_converge_to_one_row() {
        let (_dir, db) = temp_db();
        let store = MappingStore::new(db);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let instance = if i % 2 == 0 {
                InstanceName::Primary
            } else {
                InstanceName::Replica
            };
            let id = if i % 2 == 0 { P1 } else { R1 };
            handles.push(tokio::spawn(async move {
                store.upsert("raced", instance, id, None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        let m = &all[0];
        assert_eq!(m.primary_id.as_deref(), Some(P1));
        assert_eq!(m.replica_id.as_deref(), Some(R1));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_evicts_cache() {
        let (_dir, db) = temp_db();
        let store = MappingStore::new(db);
        store
            .upsert("docs", InstanceName::Primary, P1, None)
            .await
            .unwrap();

        assert!(store.delete("docs").unwrap());
        assert!(!store.delete("docs").unwrap());
        assert!(store.resolve_by_name("docs").unwrap().is_none());
    }
}
