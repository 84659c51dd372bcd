//! # Document Store
//!
//! One SQLite-backed document store. Two instances of this type back the
//! engine: the primary ("cloud") store and the secondary ("local") store.
//!
//! ## Storage Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        documents table                                  │
//! │                                                                         │
//! │  entity │ id   │ body (JSON)                      │ created │ updated   │
//! │  ───────┼──────┼──────────────────────────────────┼─────────┼────────── │
//! │  User   │ u1   │ {"id":"u1","email":"a@x.com"}    │ ...     │ ...       │
//! │  Note   │ n1   │ {"id":"n1","topic":"x"}          │ ...     │ ...       │
//! │                                                                         │
//! │  • Equality filters evaluate with json_extract over the body           │
//! │  • Unique fields are enforced at the driver level; violations surface  │
//! │    as UniqueViolation with field and value recoverable                 │
//! │  • Update expressions are $set-style field maps applied in-process     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! File-backed stores run in WAL mode so readers don't block writers; the
//! in-memory configuration used by tests pins a single pooled connection so
//! the database outlives individual queries.

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::schema::EntitySchema;

/// Embedded migrations shared by both stores.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Address of an in-memory store (used by tests).
pub const MEMORY_ADDRESS: &str = ":memory:";

// =============================================================================
// Document Store
// =============================================================================

/// Handle to one SQLite-backed document store.
///
/// Cheap to clone; clones share the underlying pool.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
    address: String,
}

impl DocumentStore {
    /// Opens (and migrates) the store at `address`.
    ///
    /// `address` is a filesystem path, or [`MEMORY_ADDRESS`] for an
    /// in-memory database. The file is created if missing.
    pub async fn connect(address: &str) -> StoreResult<Self> {
        info!(address = %address, "Opening document store");

        let in_memory = address == MEMORY_ADDRESS;
        let connect_url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", address)
        };

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            })
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        // An in-memory database lives and dies with its connection, so the
        // pool must hold exactly one connection forever.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .min_connections(1)
                .acquire_timeout(Duration::from_secs(30))
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        MIGRATOR.run(&pool).await?;

        debug!(address = %address, "Document store ready");

        Ok(DocumentStore {
            pool,
            address: address.to_string(),
        })
    }

    /// Readiness flag: true while the pool is open.
    ///
    /// This is a local check, not a round trip; use [`ping`](Self::ping)
    /// for a live probe.
    pub fn is_ready(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Live health probe.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Returns the underlying pool, for repositories layered on this store.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Configured address of this store.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Closes the pool. Subsequent operations fail.
    pub async fn close(&self) {
        info!(address = %self.address, "Closing document store");
        self.pool.close().await;
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Finds a document by id.
    pub async fn find_by_id(&self, entity: &str, id: &str) -> StoreResult<Option<JsonValue>> {
        let row = sqlx::query("SELECT body FROM documents WHERE entity = ?1 AND id = ?2")
            .bind(entity)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| parse_body(&r)).transpose()
    }

    /// Finds the first document matching an equality filter.
    pub async fn find_one(&self, entity: &str, filter: &JsonValue) -> StoreResult<Option<JsonValue>> {
        let mut docs = self.find_many(entity, filter, Some(1)).await?;
        Ok(docs.pop())
    }

    /// Finds documents matching an equality filter, in insertion order.
    pub async fn find_many(
        &self,
        entity: &str,
        filter: &JsonValue,
        limit: Option<i64>,
    ) -> StoreResult<Vec<JsonValue>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT body FROM documents WHERE entity = ");
        qb.push_bind(entity.to_string());
        push_filter(&mut qb, filter)?;
        qb.push(" ORDER BY rowid ASC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(parse_body).collect()
    }

    /// Counts documents matching an equality filter.
    pub async fn count(&self, entity: &str, filter: &JsonValue) -> StoreResult<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS n FROM documents WHERE entity = ");
        qb.push_bind(entity.to_string());
        push_filter(&mut qb, filter)?;

        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts a new document, assigning an id when the body carries none.
    ///
    /// Returns the stored document. Violated unique fields surface as
    /// [`StoreError::UniqueViolation`].
    pub async fn insert_one(
        &self,
        schema: &EntitySchema,
        mut document: JsonValue,
    ) -> StoreResult<JsonValue> {
        let id = ensure_document_id(&mut document)?;
        self.check_unique_fields(schema, &document, &id).await?;

        let body = serde_json::to_string(&document)?;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO documents (entity, id, body, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&schema.name)
        .bind(&id)
        .bind(&body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(entity = %schema.name, id = %id, "Inserted document");
                Ok(document)
            }
            // Primary-key clash means a document with this id already exists.
            Err(e) => {
                let err = StoreError::from(e);
                if err.is_unique_violation() {
                    Err(StoreError::duplicate("id", id))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Inserts several documents; stops at the first failure.
    pub async fn insert_many(
        &self,
        schema: &EntitySchema,
        documents: Vec<JsonValue>,
    ) -> StoreResult<Vec<JsonValue>> {
        let mut stored = Vec::with_capacity(documents.len());
        for document in documents {
            stored.push(self.insert_one(schema, document).await?);
        }
        Ok(stored)
    }

    /// Inserts or fully replaces a document by its id.
    pub async fn upsert_by_id(
        &self,
        schema: &EntitySchema,
        mut document: JsonValue,
    ) -> StoreResult<JsonValue> {
        let id = ensure_document_id(&mut document)?;
        self.check_unique_fields(schema, &document, &id).await?;

        let body = serde_json::to_string(&document)?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO documents (entity, id, body, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (entity, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(&schema.name)
        .bind(&id)
        .bind(&body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(entity = %schema.name, id = %id, "Upserted document");
        Ok(document)
    }

    /// Applies a `$set`-style update to every document matching the filter.
    ///
    /// With `upsert` set and no match, a new document is synthesized from
    /// the filter's equality fields plus the update fields. Returns the
    /// number of affected documents.
    ///
    /// All-or-nothing: merges and uniqueness checks run up front, then the
    /// writes commit in one transaction, so a failure partway through a
    /// multi-document update leaves nothing half-applied.
    pub async fn update_many(
        &self,
        schema: &EntitySchema,
        filter: &JsonValue,
        update: &JsonValue,
        upsert: bool,
    ) -> StoreResult<u64> {
        let matches = self.find_many(&schema.name, filter, None).await?;

        if matches.is_empty() {
            if !upsert {
                return Ok(0);
            }
            let mut document = merge_fields(filter.clone(), update)?;
            ensure_document_id(&mut document)?;
            self.insert_one(schema, document).await?;
            return Ok(1);
        }

        // Phase 1: merge and validate every match before touching a row.
        // The seen-set catches two matches converging on the same unique
        // value, which the per-document store lookup can't observe.
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut staged = Vec::with_capacity(matches.len());

        for existing in matches {
            let id = document_id(&existing)?;
            let merged = merge_fields(existing, update)?;
            self.check_unique_fields(schema, &merged, &id).await?;

            for field in &schema.unique_fields {
                let value = match merged.get(field) {
                    Some(v) if !v.is_null() => json_to_plain_string(v),
                    _ => continue,
                };
                if !seen.insert((field.clone(), value.clone())) {
                    return Err(StoreError::duplicate(field, value));
                }
            }

            staged.push((id, serde_json::to_string(&merged)?));
        }

        // Phase 2: commit every row or none.
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (id, body) in &staged {
            sqlx::query(
                "UPDATE documents SET body = ?3, updated_at = ?4 WHERE entity = ?1 AND id = ?2",
            )
            .bind(&schema.name)
            .bind(id)
            .bind(body)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let affected = staged.len() as u64;
        debug!(entity = %schema.name, affected, "Updated documents");
        Ok(affected)
    }

    /// Deletes every document matching the filter; returns the count.
    pub async fn delete_many(&self, entity: &str, filter: &JsonValue) -> StoreResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM documents WHERE entity = ");
        qb.push_bind(entity.to_string());
        push_filter(&mut qb, filter)?;

        let result = qb.build().execute(&self.pool).await?;
        debug!(entity = %entity, deleted = result.rows_affected(), "Deleted documents");
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Uniqueness
    // =========================================================================

    /// Rejects the document if any declared unique field collides with a
    /// different document.
    ///
    /// Driver-level enforcement; adequate under the engine's
    /// one-sync-process deployment model.
    async fn check_unique_fields(
        &self,
        schema: &EntitySchema,
        document: &JsonValue,
        own_id: &str,
    ) -> StoreResult<()> {
        for field in &schema.unique_fields {
            let value = match document.get(field) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };

            let filter = json!({ field.as_str(): value });
            if let Some(existing) = self.find_one(&schema.name, &filter).await? {
                if document_id(&existing)? != own_id {
                    return Err(StoreError::duplicate(field, json_to_plain_string(value)));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Filter / Update Helpers
// =============================================================================

/// Accepts identifier-like field names only; everything else is rejected
/// before it can reach a `json_extract` path.
fn validate_field(field: &str) -> StoreResult<()> {
    let ok = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidField(field.to_string()))
    }
}

/// Appends `AND json_extract(body, '$.field') = json_extract(?, '$')` for
/// every field in the equality filter. Both sides go through json_extract
/// so strings, numbers and booleans compare consistently.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &JsonValue) -> StoreResult<()> {
    let fields = match filter {
        JsonValue::Object(map) => map,
        JsonValue::Null => return Ok(()),
        other => {
            return Err(StoreError::Serialization(format!(
                "filter must be a JSON object, got: {}",
                other
            )))
        }
    };

    for (field, value) in fields {
        validate_field(field)?;
        qb.push(" AND json_extract(body, '$.");
        qb.push(field.as_str());
        qb.push("') = json_extract(");
        qb.push_bind(value.to_string());
        qb.push(", '$')");
    }

    Ok(())
}

/// Extracts a row's JSON body.
fn parse_body(row: &sqlx::sqlite::SqliteRow) -> StoreResult<JsonValue> {
    let body: String = row.try_get("body")?;
    Ok(serde_json::from_str(&body)?)
}

/// Returns the document's id, assigning a fresh UUID when absent.
fn ensure_document_id(document: &mut JsonValue) -> StoreResult<String> {
    let map = document
        .as_object_mut()
        .ok_or_else(|| StoreError::Serialization("document must be a JSON object".to_string()))?;

    match map.get("id").and_then(JsonValue::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => {
            let id = Uuid::new_v4().to_string();
            map.insert("id".to_string(), JsonValue::String(id.clone()));
            Ok(id)
        }
    }
}

/// Returns the document's id or an error for id-less bodies.
fn document_id(document: &JsonValue) -> StoreResult<String> {
    document
        .get("id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Serialization("stored document is missing an id".to_string()))
}

/// Applies a `$set`-style update onto a base object. A bare object map is
/// treated as an implicit `$set`.
fn merge_fields(base: JsonValue, update: &JsonValue) -> StoreResult<JsonValue> {
    let set_map = match update.get("$set") {
        Some(JsonValue::Object(map)) => map,
        Some(other) => {
            return Err(StoreError::Serialization(format!(
                "$set must be a JSON object, got: {}",
                other
            )))
        }
        None => match update {
            JsonValue::Object(map) => map,
            other => {
                return Err(StoreError::Serialization(format!(
                    "update must be a JSON object, got: {}",
                    other
                )))
            }
        },
    };

    let mut merged = match base {
        JsonValue::Object(map) => map,
        other => {
            return Err(StoreError::Serialization(format!(
                "update target must be a JSON object, got: {}",
                other
            )))
        }
    };

    for (field, value) in set_map {
        validate_field(field)?;
        merged.insert(field.clone(), value.clone());
    }

    Ok(JsonValue::Object(merged))
}

/// Renders a JSON scalar without quotes, for error messages.
fn json_to_plain_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> DocumentStore {
        DocumentStore::connect(MEMORY_ADDRESS).await.unwrap()
    }

    fn user_schema() -> EntitySchema {
        EntitySchema::new("User").unique_field("email")
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = memory_store().await;
        let schema = user_schema();

        let stored = store
            .insert_one(&schema, json!({"email": "a@x.com", "name": "Ada"}))
            .await
            .unwrap();
        let id = stored.get("id").unwrap().as_str().unwrap().to_string();

        let by_id = store.find_by_id("User", &id).await.unwrap().unwrap();
        assert_eq!(by_id.get("email").unwrap(), "a@x.com");

        let by_filter = store
            .find_one("User", &json!({"email": "a@x.com"}))
            .await
            .unwrap();
        assert!(by_filter.is_some());

        let miss = store
            .find_one("User", &json!({"email": "b@x.com"}))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_unique_field_enforced() {
        let store = memory_store().await;
        let schema = user_schema();

        store
            .insert_one(&schema, json!({"id": "u1", "email": "a@x.com"}))
            .await
            .unwrap();

        let err = store
            .insert_one(&schema, json!({"id": "u2", "email": "a@x.com"}))
            .await
            .unwrap_err();

        assert_eq!(err.violated_key(), Some(("email", "a@x.com")));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = memory_store().await;
        let schema = EntitySchema::new("Note");

        store
            .insert_one(&schema, json!({"id": "n1", "topic": "x"}))
            .await
            .unwrap();
        let err = store
            .insert_one(&schema, json!({"id": "n1", "topic": "y"}))
            .await
            .unwrap_err();

        assert_eq!(err.violated_key(), Some(("id", "n1")));
    }

    #[tokio::test]
    async fn test_update_many_and_upsert() {
        let store = memory_store().await;
        let schema = EntitySchema::new("Note");

        store
            .insert_one(&schema, json!({"id": "n1", "topic": "x", "pinned": false}))
            .await
            .unwrap();

        let affected = store
            .update_many(
                &schema,
                &json!({"topic": "x"}),
                &json!({"$set": {"pinned": true}}),
                false,
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let doc = store.find_by_id("Note", "n1").await.unwrap().unwrap();
        assert_eq!(doc.get("pinned").unwrap(), true);

        // No match + upsert synthesizes a document from filter and update.
        let affected = store
            .update_many(
                &schema,
                &json!({"topic": "fresh"}),
                &json!({"pinned": false}),
                true,
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let upserted = store
            .find_one("Note", &json!({"topic": "fresh"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upserted.get("pinned").unwrap(), false);
    }

    #[tokio::test]
    async fn test_update_many_leaves_no_partial_writes() {
        let store = memory_store().await;
        let schema = user_schema();

        store
            .insert_one(&schema, json!({"id": "u1", "group": "7b"}))
            .await
            .unwrap();
        store
            .insert_one(&schema, json!({"id": "u2", "group": "7b"}))
            .await
            .unwrap();

        // Both matches would end up with the same unique email; the update
        // must reject the batch before writing either document.
        let err = store
            .update_many(
                &schema,
                &json!({"group": "7b"}),
                &json!({"$set": {"email": "shared@x.com"}}),
                false,
            )
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        let first = store.find_by_id("User", "u1").await.unwrap().unwrap();
        assert!(first.get("email").is_none());
        let second = store.find_by_id("User", "u2").await.unwrap().unwrap();
        assert!(second.get("email").is_none());
    }

    #[tokio::test]
    async fn test_delete_many() {
        let store = memory_store().await;
        let schema = EntitySchema::new("Note");

        for topic in ["x", "x", "y"] {
            store
                .insert_one(&schema, json!({"topic": topic}))
                .await
                .unwrap();
        }

        let deleted = store
            .delete_many("Note", &json!({"topic": "x"}))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count("Note", &json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filter_rejects_hostile_field_names() {
        let store = memory_store().await;

        let err = store
            .find_one("Note", &json!({"a') OR 1=1 --": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidField(_)));
    }

    #[tokio::test]
    async fn test_ping_and_ready() {
        let store = memory_store().await;
        assert!(store.is_ready());
        assert!(store.ping().await);

        store.close().await;
        assert!(!store.is_ready());
        assert!(!store.ping().await);
    }
}
