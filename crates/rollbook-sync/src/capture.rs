//! # Change Capture
//!
//! The write-path interceptor that turns secondary-store writes into queued
//! change records while the primary is unreachable.
//!
//! ## Capture Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              Should this completed write be queued?                     │
//! │                                                                         │
//! │  write executed on PRIMARY      ──► no  (it already reached the         │
//! │                                         authoritative store)            │
//! │  primary currently online       ──► no  (secondary write while primary  │
//! │                                         is up is caller's own business) │
//! │  otherwise                      ──► yes (queue for later replay)        │
//! │                                                                         │
//! │  The decision does not distinguish a disabled primary from one that     │
//! │  is transiently down: "not online" is the whole test. Deployments       │
//! │  that never configure a primary accumulate a replayable history.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Capture must never fail the originating write: queue errors are logged
//! and swallowed here.

use async_trait::async_trait;
use rollbook_core::{ChangeOp, ChangeRecord, StoreRole};
use rollbook_store::{CaptureHook, ConnectionManager, EntitySchema};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::queue::ChangeQueue;

/// Capture hook wired into every resolved entity handle.
pub struct ChangeCapture {
    manager: Arc<ConnectionManager>,
    queue: Arc<ChangeQueue>,
}

impl ChangeCapture {
    pub fn new(manager: Arc<ConnectionManager>, queue: Arc<ChangeQueue>) -> Self {
        ChangeCapture { manager, queue }
    }

    /// True when a write on `role` should be queued for replay.
    async fn should_capture(&self, role: StoreRole) -> bool {
        role == StoreRole::Secondary && !self.manager.is_primary_online().await
    }

    /// Drops read-time fields from a captured save payload. The replayed
    /// document must contain only stored fields.
    fn strip_computed(schema: &EntitySchema, op: ChangeOp) -> ChangeOp {
        match op {
            ChangeOp::Save { mut document } => {
                if let JsonValue::Object(ref mut map) = document {
                    for field in &schema.computed_fields {
                        map.remove(field);
                    }
                }
                ChangeOp::Save { document }
            }
            other => other,
        }
    }
}

#[async_trait]
impl CaptureHook for ChangeCapture {
    async fn on_write(&self, schema: &EntitySchema, role: StoreRole, op: ChangeOp) {
        if !self.should_capture(role).await {
            debug!(
                component = "capture",
                entity = %schema.name,
                op = %op.kind(),
                event = "skipped",
            );
            return;
        }

        let op = Self::strip_computed(schema, op);
        let record = ChangeRecord::new(&schema.name, op, role);

        match self.queue.enqueue(record).await {
            Ok(Some(record)) => {
                debug!(
                    component = "capture",
                    entity = %schema.name,
                    change_id = %record.id,
                    op = %record.op.kind(),
                    event = "captured",
                );
            }
            Ok(None) => {
                // enqueue already logged the unavailable secondary.
            }
            Err(e) => {
                warn!(
                    component = "capture",
                    entity = %schema.name,
                    error = %e,
                    "Failed to queue change; original write is unaffected",
                );
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rollbook_store::MEMORY_ADDRESS;
    use serde_json::json;

    async fn capture_setup() -> (Arc<ConnectionManager>, Arc<ChangeQueue>, ChangeCapture) {
        let manager = Arc::new(ConnectionManager::new(
            Some(MEMORY_ADDRESS.into()),
            Some(MEMORY_ADDRESS.into()),
        ));
        manager.ensure_connections().await.unwrap();
        let queue = Arc::new(ChangeQueue::new(manager.clone(), None));
        let capture = ChangeCapture::new(manager.clone(), queue.clone());
        (manager, queue, capture)
    }

    fn save_op(id: &str) -> ChangeOp {
        ChangeOp::Save {
            document: json!({"id": id, "topic": "x"}),
        }
    }

    #[tokio::test]
    async fn test_no_capture_while_primary_online() {
        let (_, queue, capture) = capture_setup().await;
        let schema = EntitySchema::new("Note");

        capture
            .on_write(&schema, StoreRole::Secondary, save_op("n1"))
            .await;

        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_captures_secondary_write_when_primary_down() {
        let (manager, queue, capture) = capture_setup().await;
        manager.record_offline(StoreRole::Primary, "gone").await;
        let schema = EntitySchema::new("Note");

        capture
            .on_write(&schema, StoreRole::Secondary, save_op("n1"))
            .await;

        assert_eq!(queue.pending_count().await.unwrap(), 1);
        let record = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(record.entity, "Note");
        assert_eq!(record.origin, StoreRole::Secondary);
    }

    #[tokio::test]
    async fn test_primary_writes_never_captured() {
        let (manager, queue, capture) = capture_setup().await;
        manager.record_offline(StoreRole::Primary, "gone").await;
        let schema = EntitySchema::new("Note");

        capture
            .on_write(&schema, StoreRole::Primary, save_op("n1"))
            .await;

        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_captures_with_disabled_primary() {
        // No primary configured at all still counts as "not online".
        let manager = Arc::new(ConnectionManager::new(None, Some(MEMORY_ADDRESS.into())));
        manager.ensure_connections().await.unwrap();
        let queue = Arc::new(ChangeQueue::new(manager.clone(), None));
        let capture = ChangeCapture::new(manager, queue.clone());

        capture
            .on_write(&EntitySchema::new("Note"), StoreRole::Secondary, save_op("n1"))
            .await;

        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_computed_fields_stripped_from_save() {
        let (manager, queue, capture) = capture_setup().await;
        manager.record_offline(StoreRole::Primary, "gone").await;
        let schema = EntitySchema::new("User").computed_field("display_name");

        capture
            .on_write(
                &schema,
                StoreRole::Secondary,
                ChangeOp::Save {
                    document: json!({
                        "id": "u1",
                        "email": "a@school.edu",
                        "display_name": "Derived Value"
                    }),
                },
            )
            .await;

        let record = queue.claim_next().await.unwrap().unwrap();
        match record.op {
            ChangeOp::Save { document } => {
                assert!(document.get("display_name").is_none());
                assert_eq!(document["email"], "a@school.edu");
            }
            other => panic!("expected save, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_payload_preserved_verbatim() {
        let (manager, queue, capture) = capture_setup().await;
        manager.record_offline(StoreRole::Primary, "gone").await;
        let schema = EntitySchema::new("AttendanceRecord");

        let op = ChangeOp::Update {
            filter: json!({"session_id": "s1", "student_id": "u1"}),
            update: json!({"$set": {"present": true}}),
            upsert: true,
        };
        capture.on_write(&schema, StoreRole::Secondary, op.clone()).await;

        let record = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(record.op, op);
    }
}
