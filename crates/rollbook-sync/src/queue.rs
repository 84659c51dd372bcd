//! # Durable Change Queue
//!
//! Persisted, ordered queue of change records in the secondary store.
//!
//! ## Queue Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      change_queue Table                                 │
//! │                                                                         │
//! │  seq │ id   │ entity │ op_kind │ status     │ attempts │ created_at     │
//! │  ────┼──────┼────────┼─────────┼────────────┼──────────┼─────────────── │
//! │  1   │ c-a  │ User   │ save    │ synced     │ 1        │ ...            │
//! │  2   │ c-b  │ Note   │ update  │ processing │ 2        │ ...            │
//! │  3   │ c-c  │ Note   │ delete  │ pending    │ 0        │ ...            │
//! │                                                                         │
//! │  • enqueue: INSERT with status 'pending', attempts 0                    │
//! │  • claim_next: one atomic UPDATE..RETURNING over the oldest pending/    │
//! │    failed row — two concurrent claimants can never get the same row     │
//! │  • mark_synced / mark_failed: terminal / retry-eligible transitions;    │
//! │    a lost mark never raises, it only logs                               │
//! │  • requeue_orphans: rows stuck in 'processing' (crash, or a mark lost   │
//! │    to a store failure) go back to retry eligibility                     │
//! │  • rows are retained indefinitely; cleanup_synced is a manual trim      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The atomic claim is the sole concurrency-safety requirement of the whole
//! subsystem; everything else assumes a single sync-capable process.

use chrono::{DateTime, Utc};
use rollbook_core::{ChangeError, ChangeOp, ChangeRecord, ChangeStatus, StoreRole};
use rollbook_store::{ConnectionManager, DocumentStore};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Statistics
// =============================================================================

/// Most recent replay failure, for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub change_id: String,
    pub entity: String,
    pub error: ChangeError,
    pub at: Option<DateTime<Utc>>,
}

/// Counts by status plus last-synced and last-failure summaries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub synced: i64,
    pub failed: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_failure: Option<FailureSummary>,
}

impl QueueStats {
    /// Records still awaiting replay.
    pub fn backlog(&self) -> i64 {
        self.pending + self.processing + self.failed
    }
}

// =============================================================================
// Change Queue
// =============================================================================

/// Repository over the secondary store's `change_queue` table.
///
/// Writes go through the pool directly, never through the entity proxy, so
/// queue writes can't recursively capture themselves.
pub struct ChangeQueue {
    manager: Arc<ConnectionManager>,
    max_attempts: Option<i64>,
}

impl ChangeQueue {
    pub fn new(manager: Arc<ConnectionManager>, max_attempts: Option<i64>) -> Self {
        ChangeQueue {
            manager,
            max_attempts,
        }
    }

    /// The secondary store, when it is open and ready.
    async fn secondary(&self) -> Option<DocumentStore> {
        self.manager
            .store(StoreRole::Secondary)
            .await
            .filter(|s| s.is_ready())
    }

    /// True when the queue's backing store is usable.
    pub async fn is_ready(&self) -> bool {
        self.secondary().await.is_some()
    }

    /// Inserts a new pending record.
    ///
    /// Returns `Ok(None)` when the secondary store is unavailable — there
    /// is no tertiary fallback, and the caller decides whether that is
    /// worth more than a log line.
    pub async fn enqueue(&self, record: ChangeRecord) -> SyncResult<Option<ChangeRecord>> {
        let store = match self.secondary().await {
            Some(store) => store,
            None => {
                warn!(
                    component = "change_queue",
                    event = "enqueue:skipped",
                    entity = %record.entity,
                    reason = "secondary store unavailable",
                );
                return Ok(None);
            }
        };

        let payload = serde_json::to_string(&record.op)?;

        sqlx::query(
            "INSERT INTO change_queue \
             (id, entity, op_kind, payload, origin, status, attempts, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&record.id)
        .bind(&record.entity)
        .bind(record.op.kind().as_str())
        .bind(&payload)
        .bind(record.origin.as_str())
        .bind(record.status.as_str())
        .bind(record.attempts)
        .bind(record.created_at)
        .execute(store.pool())
        .await?;

        debug!(
            component = "change_queue",
            event = "enqueued",
            change_id = %record.id,
            entity = %record.entity,
            op = %record.op.kind(),
        );

        Ok(Some(record))
    }

    /// Atomically claims the oldest retry-eligible record.
    ///
    /// Selection and transition happen in one `UPDATE .. RETURNING`
    /// statement: the claimed record moves to `processing` with its attempt
    /// count incremented and last-tried time stamped. Two concurrent
    /// claimants can never receive the same record.
    pub async fn claim_next(&self) -> SyncResult<Option<ChangeRecord>> {
        let store = match self.secondary().await {
            Some(store) => store,
            None => return Err(SyncError::QueueUnavailable),
        };

        let now = Utc::now();

        // The attempt ceiling folds into claim eligibility; with no
        // ceiling, pending/failed records stay claimable forever.
        let row = if let Some(max) = self.max_attempts {
            sqlx::query(
                "UPDATE change_queue SET \
                     status = 'processing', \
                     attempts = attempts + 1, \
                     last_tried_at = ?1 \
                 WHERE seq = ( \
                     SELECT seq FROM change_queue \
                     WHERE status IN ('pending', 'failed') AND attempts < ?2 \
                     ORDER BY seq ASC LIMIT 1 \
                 ) \
                 RETURNING id, entity, op_kind, payload, origin, status, attempts, \
                           created_at, last_tried_at, error_code, error_message",
            )
            .bind(now)
            .bind(max)
            .fetch_optional(store.pool())
            .await?
        } else {
            sqlx::query(
                "UPDATE change_queue SET \
                     status = 'processing', \
                     attempts = attempts + 1, \
                     last_tried_at = ?1 \
                 WHERE seq = ( \
                     SELECT seq FROM change_queue \
                     WHERE status IN ('pending', 'failed') \
                     ORDER BY seq ASC LIMIT 1 \
                 ) \
                 RETURNING id, entity, op_kind, payload, origin, status, attempts, \
                           created_at, last_tried_at, error_code, error_message",
            )
            .bind(now)
            .fetch_optional(store.pool())
            .await?
        };

        let record = row.map(|r| row_to_record(&r)).transpose()?;

        if let Some(ref record) = record {
            debug!(
                component = "change_queue",
                event = "claimed",
                change_id = %record.id,
                entity = %record.entity,
                attempts = record.attempts,
            );
        }

        Ok(record)
    }

    /// Marks a claimed record as successfully replayed. Terminal.
    ///
    /// Never raises: a mark lost to a store failure is logged, and the
    /// record stays `processing` until [`requeue_orphans`](Self::requeue_orphans)
    /// returns it to eligibility (the replay then repeats, which
    /// convergence tolerates).
    pub async fn mark_synced(&self, id: &str) {
        match self.try_mark_synced(id).await {
            Ok(()) => {
                debug!(component = "change_queue", event = "synced", change_id = %id);
            }
            Err(e) => {
                warn!(
                    component = "change_queue",
                    event = "mark:lost",
                    change_id = %id,
                    error = %e,
                    "Could not record synced status; record will be requeued",
                );
            }
        }
    }

    async fn try_mark_synced(&self, id: &str) -> SyncResult<()> {
        let store = self.secondary().await.ok_or(SyncError::QueueUnavailable)?;

        sqlx::query(
            "UPDATE change_queue SET \
                 status = 'synced', \
                 error_code = NULL, \
                 error_message = NULL \
             WHERE id = ?1",
        )
        .bind(id)
        .execute(store.pool())
        .await?;

        Ok(())
    }

    /// Records a replay failure; the record becomes retry-eligible again.
    ///
    /// Never raises: a mark lost to a store failure is logged, and the
    /// record stays `processing` until requeued as an orphan.
    pub async fn mark_failed(&self, id: &str, error: &ChangeError) {
        match self.try_mark_failed(id, error).await {
            Ok(()) => {
                warn!(
                    component = "change_queue",
                    event = "failed",
                    change_id = %id,
                    code = %error.code,
                    error = %error.message,
                );
            }
            Err(e) => {
                warn!(
                    component = "change_queue",
                    event = "mark:lost",
                    change_id = %id,
                    error = %e,
                    "Could not record failed status; record will be requeued",
                );
            }
        }
    }

    async fn try_mark_failed(&self, id: &str, error: &ChangeError) -> SyncResult<()> {
        let store = self.secondary().await.ok_or(SyncError::QueueUnavailable)?;

        sqlx::query(
            "UPDATE change_queue SET \
                 status = 'failed', \
                 error_code = ?2, \
                 error_message = ?3 \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&error.code)
        .bind(&error.message)
        .execute(store.pool())
        .await?;

        Ok(())
    }

    /// Returns interrupted `processing` rows to retry eligibility.
    ///
    /// A row can only be left `processing` by a claim whose outcome was
    /// never recorded (a crash, or a mark lost to a store failure). The
    /// replayer calls this before claiming, under its single-flight guard,
    /// so no live claim can be requeued by mistake.
    pub async fn requeue_orphans(&self) -> SyncResult<u64> {
        let store = self.secondary().await.ok_or(SyncError::QueueUnavailable)?;

        let result = sqlx::query(
            "UPDATE change_queue SET \
                 status = 'failed', \
                 error_code = COALESCE(error_code, 'interrupted'), \
                 error_message = COALESCE(error_message, 'replay outcome was never recorded') \
             WHERE status = 'processing'",
        )
        .execute(store.pool())
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(
                component = "change_queue",
                event = "orphans:requeued",
                requeued,
            );
        }
        Ok(requeued)
    }

    /// Fetches one record by id.
    pub async fn get(&self, id: &str) -> SyncResult<Option<ChangeRecord>> {
        let store = self.secondary().await.ok_or(SyncError::QueueUnavailable)?;

        let row = sqlx::query(
            "SELECT id, entity, op_kind, payload, origin, status, attempts, \
                    created_at, last_tried_at, error_code, error_message \
             FROM change_queue WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(store.pool())
        .await?;

        row.map(|r| row_to_record(&r)).transpose()
    }

    /// Counts records still awaiting replay.
    pub async fn pending_count(&self) -> SyncResult<i64> {
        let store = self.secondary().await.ok_or(SyncError::QueueUnavailable)?;

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM change_queue WHERE status IN ('pending', 'processing', 'failed')",
        )
        .fetch_one(store.pool())
        .await?;

        Ok(count)
    }

    /// Read-only snapshot for observability endpoints.
    pub async fn stats(&self) -> SyncResult<QueueStats> {
        let store = self.secondary().await.ok_or(SyncError::QueueUnavailable)?;

        let mut stats = QueueStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM change_queue GROUP BY status")
            .fetch_all(store.pool())
            .await?;

        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "synced" => stats.synced = count,
                "failed" => stats.failed = count,
                other => {
                    warn!(component = "change_queue", status = %other, "Unknown status in queue");
                }
            }
        }

        stats.last_synced_at = sqlx::query_scalar(
            "SELECT MAX(last_tried_at) FROM change_queue WHERE status = 'synced'",
        )
        .fetch_one(store.pool())
        .await?;

        let failure = sqlx::query(
            "SELECT id, entity, error_code, error_message, last_tried_at \
             FROM change_queue WHERE status = 'failed' \
             ORDER BY last_tried_at DESC LIMIT 1",
        )
        .fetch_optional(store.pool())
        .await?;

        if let Some(row) = failure {
            let code: Option<String> = row.try_get("error_code")?;
            let message: Option<String> = row.try_get("error_message")?;
            stats.last_failure = Some(FailureSummary {
                change_id: row.try_get("id")?,
                entity: row.try_get("entity")?,
                error: ChangeError::new(
                    code.unwrap_or_else(|| "unknown".into()),
                    message.unwrap_or_default(),
                ),
                at: row.try_get("last_tried_at")?,
            });
        }

        Ok(stats)
    }

    /// Deletes synced records older than `days_old` days. Manual retention
    /// trim; nothing calls this automatically.
    pub async fn cleanup_synced(&self, days_old: u32) -> SyncResult<u64> {
        let store = self.secondary().await.ok_or(SyncError::QueueUnavailable)?;

        let result = sqlx::query(
            "DELETE FROM change_queue \
             WHERE status = 'synced' \
             AND last_tried_at < datetime('now', '-' || ?1 || ' days')",
        )
        .bind(days_old)
        .execute(store.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

fn row_to_record(row: &SqliteRow) -> SyncResult<ChangeRecord> {
    let payload: String = row.try_get("payload").map_err(SyncError::from)?;
    let op: ChangeOp = serde_json::from_str(&payload)?;

    let origin: String = row.try_get("origin").map_err(SyncError::from)?;
    let origin: StoreRole = origin.parse().map_err(SyncError::Internal)?;

    let status: String = row.try_get("status").map_err(SyncError::from)?;
    let status: ChangeStatus = status.parse().map_err(SyncError::Internal)?;

    let error_code: Option<String> = row.try_get("error_code").map_err(SyncError::from)?;
    let error_message: Option<String> = row.try_get("error_message").map_err(SyncError::from)?;
    let last_error = error_code.map(|code| ChangeError::new(code, error_message.unwrap_or_default()));

    Ok(ChangeRecord {
        id: row.try_get("id").map_err(SyncError::from)?,
        entity: row.try_get("entity").map_err(SyncError::from)?,
        op,
        origin,
        status,
        attempts: row.try_get("attempts").map_err(SyncError::from)?,
        created_at: row.try_get("created_at").map_err(SyncError::from)?,
        last_tried_at: row.try_get("last_tried_at").map_err(SyncError::from)?,
        last_error,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rollbook_store::MEMORY_ADDRESS;
    use serde_json::json;
    use std::collections::HashSet;

    async fn queue() -> (Arc<ConnectionManager>, Arc<ChangeQueue>) {
        let manager = Arc::new(ConnectionManager::new(None, Some(MEMORY_ADDRESS.into())));
        manager.ensure_connections().await.unwrap();
        let queue = Arc::new(ChangeQueue::new(manager.clone(), None));
        (manager, queue)
    }

    fn save_record(entity: &str, id: &str) -> ChangeRecord {
        ChangeRecord::new(
            entity,
            ChangeOp::Save {
                document: json!({"id": id}),
            },
            StoreRole::Secondary,
        )
    }

    #[tokio::test]
    async fn test_enqueue_and_claim_round_trip() {
        let (_, queue) = queue().await;

        let record = save_record("Note", "n1");
        let queued = queue.enqueue(record.clone()).await.unwrap().unwrap();
        assert_eq!(queued.id, record.id);

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, record.id);
        assert_eq!(claimed.status, ChangeStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.last_tried_at.is_some());
        assert_eq!(claimed.op, record.op);
    }

    #[tokio::test]
    async fn test_claim_order_is_fifo() {
        let (_, queue) = queue().await;

        let records: Vec<_> = (1..=3).map(|i| save_record("Note", &format!("n{}", i))).collect();
        for record in &records {
            queue.enqueue(record.clone()).await.unwrap();
        }

        for expected in &records {
            let claimed = queue.claim_next().await.unwrap().unwrap();
            assert_eq!(claimed.id, expected.id);
        }
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let (_, queue) = queue().await;

        for i in 0..4 {
            queue.enqueue(save_record("Note", &format!("n{}", i))).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move { queue.claim_next().await.unwrap() }));
        }

        let mut claimed_ids = HashSet::new();
        let mut claimed = 0;
        for task in tasks {
            if let Some(record) = task.await.unwrap() {
                claimed += 1;
                // A duplicate here would mean two claimants got the same row.
                assert!(claimed_ids.insert(record.id));
            }
        }
        assert_eq!(claimed, 4);
    }

    #[tokio::test]
    async fn test_failed_record_is_reclaimable() {
        let (_, queue) = queue().await;

        let record = save_record("Note", "n1");
        queue.enqueue(record.clone()).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        queue
            .mark_failed(&claimed.id, &ChangeError::new("store", "boom"))
            .await;

        let stored = queue.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_ref().unwrap().code, "store");

        // Failed records are retry-eligible; the re-claim bumps attempts.
        let reclaimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, record.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_synced_record_is_terminal() {
        let (_, queue) = queue().await;

        queue.enqueue(save_record("Note", "n1")).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        queue.mark_synced(&claimed.id).await;

        assert!(queue.claim_next().await.unwrap().is_none());
        let stored = queue.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Synced);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_attempt_ceiling_stops_claims() {
        let (manager, _) = queue().await;
        let queue = ChangeQueue::new(manager, Some(2));

        queue.enqueue(save_record("Note", "n1")).await.unwrap();

        for _ in 0..2 {
            let claimed = queue.claim_next().await.unwrap().unwrap();
            queue
                .mark_failed(&claimed.id, &ChangeError::new("store", "boom"))
                .await;
        }

        // Two attempts recorded; the ceiling makes the record ineligible.
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_mark_does_not_raise() {
        let (manager, queue) = queue().await;

        queue.enqueue(save_record("Note", "n1")).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        // Store dies between the claim and its acknowledgement.
        manager
            .store(StoreRole::Secondary)
            .await
            .unwrap()
            .close()
            .await;

        // Neither mark raises; the record stays stranded in 'processing'
        // until the next requeue pass.
        queue.mark_synced(&claimed.id).await;
        queue
            .mark_failed(&claimed.id, &ChangeError::new("store", "boom"))
            .await;
    }

    #[tokio::test]
    async fn test_requeue_orphans_restores_claimability() {
        let (_, queue) = queue().await;

        queue.enqueue(save_record("Note", "n1")).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        // Unacknowledged claim: the record is invisible to claim_next.
        assert!(queue.claim_next().await.unwrap().is_none());

        assert_eq!(queue.requeue_orphans().await.unwrap(), 1);

        let stored = queue.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Failed);
        assert_eq!(stored.last_error.as_ref().unwrap().code, "interrupted");

        let reclaimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_enqueue_without_secondary_returns_none() {
        let manager = Arc::new(ConnectionManager::new(Some(MEMORY_ADDRESS.into()), None));
        manager.ensure_connections().await.unwrap();
        let queue = ChangeQueue::new(manager, None);

        let result = queue.enqueue(save_record("Note", "n1")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let (_, queue) = queue().await;

        for i in 0..3 {
            queue.enqueue(save_record("Note", &format!("n{}", i))).await.unwrap();
        }

        let first = queue.claim_next().await.unwrap().unwrap();
        queue.mark_synced(&first.id).await;

        let second = queue.claim_next().await.unwrap().unwrap();
        queue
            .mark_failed(&second.id, &ChangeError::new("store", "boom"))
            .await;

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.backlog(), 2);
        assert!(stats.last_synced_at.is_some());

        let failure = stats.last_failure.unwrap();
        assert_eq!(failure.change_id, second.id);
        assert_eq!(failure.error.code, "store");
    }
}
