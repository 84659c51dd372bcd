//! # Entity Handles and the Capture Hook Seam
//!
//! An [`EntityHandle`] is a store-scoped view of one entity: the concrete
//! binding half the access proxy resolved for this call. Every write method
//! reports the completed operation to the registered [`CaptureHook`], which
//! decides whether to queue it for replay.
//!
//! The hook is an explicit decorator around the write API (not an implicit
//! schema lifecycle callback): the capture-or-skip decision is a visible
//! function call on the write path.

use async_trait::async_trait;
use rollbook_core::{ChangeOp, StoreRole};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::document::DocumentStore;
use crate::error::StoreResult;
use crate::schema::EntitySchema;

// =============================================================================
// Capture Hook
// =============================================================================

/// Write-path interceptor attached to every entity except the change queue
/// itself.
///
/// Implementations must never fail the originating write: capture problems
/// are logged and swallowed inside the hook.
#[async_trait]
pub trait CaptureHook: Send + Sync {
    /// Called after a successful write, with the store role the write
    /// executed against.
    async fn on_write(&self, schema: &EntitySchema, role: StoreRole, op: ChangeOp);
}

/// Hook that captures nothing. Used until an engine installs its capture,
/// and by deployments with no secondary store.
pub struct NoCapture;

#[async_trait]
impl CaptureHook for NoCapture {
    async fn on_write(&self, _schema: &EntitySchema, _role: StoreRole, _op: ChangeOp) {}
}

// =============================================================================
// Entity Handle
// =============================================================================

/// A resolved, store-scoped entity binding.
///
/// Obtained from [`EntityProxy::resolve`](crate::proxy::EntityProxy::resolve)
/// and valid for the duration of one logical operation; the next call
/// re-resolves against whichever store is active then.
pub struct EntityHandle {
    schema: Arc<EntitySchema>,
    role: StoreRole,
    store: DocumentStore,
    capture: Arc<dyn CaptureHook>,
}

impl std::fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("schema", &self.schema)
            .field("role", &self.role)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl EntityHandle {
    pub(crate) fn new(
        schema: Arc<EntitySchema>,
        role: StoreRole,
        store: DocumentStore,
        capture: Arc<dyn CaptureHook>,
    ) -> Self {
        EntityHandle {
            schema,
            role,
            store,
            capture,
        }
    }

    /// The store this handle executes against.
    pub fn role(&self) -> StoreRole {
        self.role
    }

    /// The schema this handle was resolved for.
    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    // =========================================================================
    // Reads (never captured)
    // =========================================================================

    pub async fn find_by_id(&self, id: &str) -> StoreResult<Option<JsonValue>> {
        self.store.find_by_id(&self.schema.name, id).await
    }

    pub async fn find_one(&self, filter: &JsonValue) -> StoreResult<Option<JsonValue>> {
        self.store.find_one(&self.schema.name, filter).await
    }

    pub async fn find_many(
        &self,
        filter: &JsonValue,
        limit: Option<i64>,
    ) -> StoreResult<Vec<JsonValue>> {
        self.store.find_many(&self.schema.name, filter, limit).await
    }

    pub async fn count(&self, filter: &JsonValue) -> StoreResult<i64> {
        self.store.count(&self.schema.name, filter).await
    }

    // =========================================================================
    // Writes (captured post-success)
    // =========================================================================

    /// Creates a document; post-create capture point.
    pub async fn save(&self, document: JsonValue) -> StoreResult<JsonValue> {
        let stored = self.store.insert_one(&self.schema, document).await?;

        self.capture
            .on_write(
                &self.schema,
                self.role,
                ChangeOp::Save {
                    document: stored.clone(),
                },
            )
            .await;

        Ok(stored)
    }

    /// Creates several documents; post-bulk-create capture point (one
    /// change per document).
    pub async fn save_many(&self, documents: Vec<JsonValue>) -> StoreResult<Vec<JsonValue>> {
        let stored = self.store.insert_many(&self.schema, documents).await?;

        for document in &stored {
            self.capture
                .on_write(
                    &self.schema,
                    self.role,
                    ChangeOp::Save {
                        document: document.clone(),
                    },
                )
                .await;
        }

        Ok(stored)
    }

    /// Filter-based update; post-mutate capture point. The filter, update
    /// expression and options are captured verbatim so the replayer can
    /// reissue the identical operation.
    pub async fn update_many(
        &self,
        filter: &JsonValue,
        update: &JsonValue,
        upsert: bool,
    ) -> StoreResult<u64> {
        let affected = self
            .store
            .update_many(&self.schema, filter, update, upsert)
            .await?;

        self.capture
            .on_write(
                &self.schema,
                self.role,
                ChangeOp::Update {
                    filter: filter.clone(),
                    update: update.clone(),
                    upsert,
                },
            )
            .await;

        Ok(affected)
    }

    /// Filter-based delete; post-mutate capture point.
    pub async fn delete_many(&self, filter: &JsonValue) -> StoreResult<u64> {
        let deleted = self.store.delete_many(&self.schema.name, filter).await?;

        self.capture
            .on_write(
                &self.schema,
                self.role,
                ChangeOp::Delete {
                    filter: filter.clone(),
                },
            )
            .await;

        Ok(deleted)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
