//! # Sync Replayer
//!
//! Drains the change queue into the primary store once it becomes
//! reachable, resolving business-key conflicts along the way.
//!
//! ## Drain Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  drain()                                                                │
//! │    │                                                                    │
//! │    ├── already draining? ──► return empty report (single-flight)        │
//! │    │                                                                    │
//! │    ├── requeue orphaned 'processing' rows from interrupted runs         │
//! │    │                                                                    │
//! │    └── loop:                                                            │
//! │          primary still online? ──no──► stop, leave rest queued          │
//! │          claim oldest record   ──none─► stop, queue is drained          │
//! │          replay into primary:                                           │
//! │            ok        ──► mark synced                                    │
//! │            conflict  ──► resolve via business key / duplicate-key       │
//! │                          fallback, then mark synced                     │
//! │            error     ──► mark failed, CONTINUE with next record         │
//! │                                                                         │
//! │  One stuck record never blocks the records behind it.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Save Conflict Resolution
//! A queued save may describe an entity that already exists on the primary
//! under a different document id (the same student created on both sides
//! while partitioned). Before upserting by id, the replayer looks the
//! document up by each of the entity's business keys in order; a match
//! means "same logical entity", and the queued fields are merged into the
//! existing document instead of creating a sibling.

use rollbook_core::{business_keys_for, key_filter, ChangeOp, ChangeRecord, StoreRole};
use rollbook_store::{DocumentStore, EntityRegistry, EntitySchema, StoreError};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::queue::ChangeQueue;

// =============================================================================
// Drain Report
// =============================================================================

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Records claimed during this pass.
    pub processed: u64,
    /// Records replayed successfully (including resolved conflicts).
    pub synced: u64,
    /// Records that failed and were left retry-eligible.
    pub failed: u64,
    /// Saves that matched an existing primary document via a business key
    /// and were merged instead of inserted.
    pub conflicts: u64,
}

impl DrainReport {
    /// True when the pass claimed nothing (queue empty, primary offline,
    /// or another drain already in flight).
    pub fn is_empty(&self) -> bool {
        self.processed == 0
    }
}

// =============================================================================
// Replayer
// =============================================================================

/// Replays queued changes into the primary store.
///
/// Cheap to share; one instance per engine.
pub struct SyncReplayer {
    registry: Arc<EntityRegistry>,
    queue: Arc<ChangeQueue>,
    draining: AtomicBool,
}

/// Clears the single-flight flag when a drain pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncReplayer {
    pub fn new(registry: Arc<EntityRegistry>, queue: Arc<ChangeQueue>) -> Self {
        SyncReplayer {
            registry,
            queue,
            draining: AtomicBool::new(false),
        }
    }

    /// Drains the queue into the primary store.
    ///
    /// Single-flight: a drain started while another is running returns an
    /// empty report immediately. The pass stops early if the primary drops
    /// offline mid-drain; unclaimed records stay queued for the next pass.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!(component = "replayer", event = "drain:skipped", reason = "already draining");
            return Ok(DrainReport::default());
        }
        let _guard = DrainGuard(&self.draining);

        // No secondary store means no queue: the whole replay path is inert.
        if !self.queue.is_ready().await {
            return Ok(DrainReport::default());
        }

        // Claims whose outcome was never recorded (a crash, or a mark lost
        // to a secondary hiccup) come back first; repeating their replay is
        // safe because save replay converges.
        self.queue.requeue_orphans().await?;

        let mut report = DrainReport::default();

        loop {
            if !self.registry.manager().is_primary_online().await {
                if report.processed > 0 {
                    warn!(
                        component = "replayer",
                        event = "drain:interrupted",
                        processed = report.processed,
                        "Primary went offline mid-drain",
                    );
                }
                break;
            }

            let record = match self.queue.claim_next().await? {
                Some(record) => record,
                None => break,
            };
            report.processed += 1;

            match self.replay(&record).await {
                Ok(resolved_conflict) => {
                    self.queue.mark_synced(&record.id).await;
                    report.synced += 1;
                    if resolved_conflict {
                        report.conflicts += 1;
                    }
                    debug!(
                        component = "replayer",
                        event = "replayed",
                        change_id = %record.id,
                        entity = %record.entity,
                        op = %record.op.kind(),
                        conflict = resolved_conflict,
                    );
                }
                Err(e) => {
                    let change_error = e.to_change_error();
                    self.queue.mark_failed(&record.id, &change_error).await;
                    report.failed += 1;
                    warn!(
                        component = "replayer",
                        event = "replay:failed",
                        change_id = %record.id,
                        entity = %record.entity,
                        attempts = record.attempts,
                        error = %change_error,
                    );
                }
            }
        }

        if !report.is_empty() {
            info!(
                component = "replayer",
                event = "drain:complete",
                processed = report.processed,
                synced = report.synced,
                failed = report.failed,
                conflicts = report.conflicts,
            );
        }

        Ok(report)
    }

    /// Replays one record. Returns true if a save was merged into an
    /// existing primary document found via a business key or the
    /// duplicate-key fallback.
    async fn replay(&self, record: &ChangeRecord) -> SyncResult<bool> {
        let snapshot = self.registry.snapshot(&record.entity).await?;
        let primary = snapshot
            .half(StoreRole::Primary)
            .cloned()
            .ok_or(StoreError::NoConnectionAvailable)?;
        let schema = snapshot.schema.clone();

        match &record.op {
            ChangeOp::Save { document } => {
                self.replay_save(&schema, &primary, document.clone()).await
            }
            ChangeOp::Update {
                filter,
                update,
                upsert,
            } => {
                primary.update_many(&schema, filter, update, *upsert).await?;
                Ok(false)
            }
            ChangeOp::Delete { filter } => {
                primary.delete_many(&schema.name, filter).await?;
                Ok(false)
            }
        }
    }

    /// Save replay with business-key conflict resolution.
    async fn replay_save(
        &self,
        schema: &EntitySchema,
        primary: &DocumentStore,
        document: JsonValue,
    ) -> SyncResult<bool> {
        // Pass 1: does the primary already hold this logical entity under
        // a different document id?
        if let Some(keys) = business_keys_for(&schema.name) {
            for key in keys {
                let filter = match key_filter(key, &document) {
                    Some(filter) => filter,
                    None => continue,
                };
                if let Some(existing) = primary.find_one(&schema.name, &filter).await? {
                    return self
                        .merge_into_existing(schema, primary, &existing, &document)
                        .await
                        .map(|_| true);
                }
            }
        }

        // Pass 2: no business-key match; upsert by document id. A unique
        // violation here means the conflicting field wasn't a declared
        // business key, so resolve against the violated field directly.
        match primary.upsert_by_id(schema, document.clone()).await {
            Ok(_) => Ok(false),
            Err(e) if e.is_unique_violation() => {
                self.duplicate_key_fallback(schema, primary, &document, e)
                    .await
                    .map(|_| true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves a unique violation raised during upsert: look the existing
    /// document up by the violated field's value and merge into it. The
    /// original error propagates when the lookup finds nothing (the
    /// violation then has some other cause and isn't ours to resolve).
    async fn duplicate_key_fallback(
        &self,
        schema: &EntitySchema,
        primary: &DocumentStore,
        document: &JsonValue,
        original: StoreError,
    ) -> SyncResult<()> {
        let field = match original.violated_key() {
            // Driver-reported fields can arrive qualified ("documents.email").
            Some((field, _)) => field.rsplit('.').next().unwrap_or(field).to_string(),
            None => return Err(original.into()),
        };

        let value = match document.get(&field) {
            Some(value) if !value.is_null() => value.clone(),
            _ => return Err(original.into()),
        };

        let mut filter = Map::new();
        filter.insert(field.clone(), value);
        match primary
            .find_one(&schema.name, &JsonValue::Object(filter))
            .await?
        {
            Some(existing) => {
                info!(
                    component = "replayer",
                    event = "conflict:resolved",
                    entity = %schema.name,
                    field = %field,
                );
                self.merge_into_existing(schema, primary, &existing, document)
                    .await
            }
            None => Err(original.into()),
        }
    }

    /// Merges a queued document's fields into an existing primary document,
    /// keeping the existing document's id.
    async fn merge_into_existing(
        &self,
        schema: &EntitySchema,
        primary: &DocumentStore,
        existing: &JsonValue,
        incoming: &JsonValue,
    ) -> SyncResult<()> {
        let existing_id = existing
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SyncError::Internal("existing document has no id".into()))?;

        // Everything but the queued document's own id wins over the
        // existing fields; the surviving id is the primary's.
        let mut update = match incoming {
            JsonValue::Object(map) => map.clone(),
            _ => Map::new(),
        };
        update.remove("id");

        primary
            .update_many(
                schema,
                &json!({ "id": existing_id }),
                &JsonValue::Object(update),
                false,
            )
            .await?;

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rollbook_core::ChangeStatus;
    use rollbook_store::{ConnectionManager, MEMORY_ADDRESS};

    struct Fixture {
        manager: Arc<ConnectionManager>,
        registry: Arc<EntityRegistry>,
        queue: Arc<ChangeQueue>,
        replayer: SyncReplayer,
    }

    async fn fixture() -> Fixture {
        let manager = Arc::new(ConnectionManager::new(
            Some(MEMORY_ADDRESS.into()),
            Some(MEMORY_ADDRESS.into()),
        ));
        manager.ensure_connections().await.unwrap();
        let registry = Arc::new(EntityRegistry::new(manager.clone()));
        let queue = Arc::new(ChangeQueue::new(manager.clone(), None));
        let replayer = SyncReplayer::new(registry.clone(), queue.clone());
        Fixture {
            manager,
            registry,
            queue,
            replayer,
        }
    }

    async fn primary(f: &Fixture) -> DocumentStore {
        f.manager.store(StoreRole::Primary).await.unwrap()
    }

    fn save_record(entity: &str, document: JsonValue) -> ChangeRecord {
        ChangeRecord::new(entity, ChangeOp::Save { document }, StoreRole::Secondary)
    }

    #[tokio::test]
    async fn test_drain_replays_save_into_primary() {
        let f = fixture().await;
        f.registry.register(EntitySchema::new("Note")).await;

        f.queue
            .enqueue(save_record("Note", json!({"id": "n1", "topic": "algebra"})))
            .await
            .unwrap();

        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.conflicts, 0);

        let stored = primary(&f).await.find_by_id("Note", "n1").await.unwrap().unwrap();
        assert_eq!(stored["topic"], "algebra");
    }

    #[tokio::test]
    async fn test_drain_preserves_queue_order() {
        let f = fixture().await;
        f.registry.register(EntitySchema::new("Note")).await;

        // Save then delete of the same document: replaying out of order
        // would leave the document alive.
        f.queue
            .enqueue(save_record("Note", json!({"id": "n1", "topic": "x"})))
            .await
            .unwrap();
        f.queue
            .enqueue(ChangeRecord::new(
                "Note",
                ChangeOp::Delete {
                    filter: json!({"id": "n1"}),
                },
                StoreRole::Secondary,
            ))
            .await
            .unwrap();

        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(primary(&f).await.find_by_id("Note", "n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_business_key_conflict_merges_into_existing() {
        let f = fixture().await;
        let schema = f
            .registry
            .register(EntitySchema::new("User").unique_field("email"))
            .await;

        // Same student exists on the primary under a different id.
        primary(&f)
            .await
            .insert_one(
                &schema,
                json!({"id": "u-cloud", "email": "amy@school.edu", "grade": 7}),
            )
            .await
            .unwrap();

        f.queue
            .enqueue(save_record(
                "User",
                json!({"id": "u-local", "email": "amy@school.edu", "grade": 8}),
            ))
            .await
            .unwrap();

        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.conflicts, 1);

        // One document survives, under the primary's id, with merged fields.
        let p = primary(&f).await;
        assert_eq!(p.count("User", &json!({})).await.unwrap(), 1);
        let merged = p.find_by_id("User", "u-cloud").await.unwrap().unwrap();
        assert_eq!(merged["grade"], 8);
        assert!(p.find_by_id("User", "u-local").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_fallback_without_descriptor() {
        let f = fixture().await;
        // "Device" has no business-key descriptor; only the driver-level
        // unique field catches the duplicate.
        let schema = f
            .registry
            .register(EntitySchema::new("Device").unique_field("serial"))
            .await;

        primary(&f)
            .await
            .insert_one(&schema, json!({"id": "d-cloud", "serial": "SN-1", "room": "101"}))
            .await
            .unwrap();

        f.queue
            .enqueue(save_record(
                "Device",
                json!({"id": "d-local", "serial": "SN-1", "room": "202"}),
            ))
            .await
            .unwrap();

        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.conflicts, 1);

        let p = primary(&f).await;
        assert_eq!(p.count("Device", &json!({})).await.unwrap(), 1);
        let merged = p.find_by_id("Device", "d-cloud").await.unwrap().unwrap();
        assert_eq!(merged["room"], "202");
    }

    #[tokio::test]
    async fn test_failed_record_does_not_block_the_rest() {
        let f = fixture().await;
        f.registry.register(EntitySchema::new("Note")).await;

        f.queue
            .enqueue(save_record("Note", json!({"id": "n1", "topic": "a"})))
            .await
            .unwrap();
        // "Ghost" was never registered; its replay fails.
        f.queue
            .enqueue(save_record("Ghost", json!({"id": "g1"})))
            .await
            .unwrap();
        f.queue
            .enqueue(save_record("Note", json!({"id": "n2", "topic": "b"})))
            .await
            .unwrap();

        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);

        let p = primary(&f).await;
        assert!(p.find_by_id("Note", "n1").await.unwrap().is_some());
        assert!(p.find_by_id("Note", "n2").await.unwrap().is_some());

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        let failure = stats.last_failure.unwrap();
        assert_eq!(failure.entity, "Ghost");
        assert_eq!(failure.error.code, "not_registered");
    }

    #[tokio::test]
    async fn test_replay_is_idempotent_per_record() {
        let f = fixture().await;
        f.registry
            .register(EntitySchema::new("User").unique_field("email"))
            .await;

        let doc = json!({"id": "u1", "email": "amy@school.edu"});
        f.queue.enqueue(save_record("User", doc.clone())).await.unwrap();
        f.replayer.drain().await.unwrap();

        // The same change queued again (e.g. a crash between replay and
        // mark_synced) must not create a second document.
        f.queue.enqueue(save_record("User", doc)).await.unwrap();
        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.failed, 0);

        assert_eq!(
            primary(&f).await.count("User", &json!({})).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_interrupted_claim_is_replayed_on_next_drain() {
        let f = fixture().await;
        f.registry.register(EntitySchema::new("Note")).await;

        f.queue
            .enqueue(save_record("Note", json!({"id": "n1", "topic": "x"})))
            .await
            .unwrap();

        // A previous run claimed the record but never recorded the outcome
        // (crash between replay and acknowledgement).
        let stranded = f.queue.claim_next().await.unwrap().unwrap();
        assert_eq!(stranded.status, ChangeStatus::Processing);

        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.synced, 1);

        assert!(primary(&f).await.find_by_id("Note", "n1").await.unwrap().is_some());
        let stored = f.queue.get(&stranded.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Synced);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn test_drain_stops_when_primary_offline() {
        let f = fixture().await;
        f.registry.register(EntitySchema::new("Note")).await;

        f.queue
            .enqueue(save_record("Note", json!({"id": "n1"})))
            .await
            .unwrap();
        f.manager.record_offline(StoreRole::Primary, "gone").await;

        let report = f.replayer.drain().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(f.queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replayed_update_and_delete() {
        let f = fixture().await;
        let schema = f.registry.register(EntitySchema::new("Note")).await;

        primary(&f)
            .await
            .insert_one(&schema, json!({"id": "n1", "topic": "a", "pinned": false}))
            .await
            .unwrap();

        f.queue
            .enqueue(ChangeRecord::new(
                "Note",
                ChangeOp::Update {
                    filter: json!({"id": "n1"}),
                    update: json!({"$set": {"pinned": true}}),
                    upsert: false,
                },
                StoreRole::Secondary,
            ))
            .await
            .unwrap();

        let report = f.replayer.drain().await.unwrap();
        assert_eq!(report.synced, 1);

        let stored = primary(&f).await.find_by_id("Note", "n1").await.unwrap().unwrap();
        assert_eq!(stored["pinned"], true);
    }
}
