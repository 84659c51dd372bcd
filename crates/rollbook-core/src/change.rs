//! # Change Records
//!
//! A [`ChangeRecord`] is a durable description of one write made against
//! the secondary store while the primary was unreachable. Records are
//! created by change capture, persisted in the change queue, and consumed
//! by the sync replayer.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ChangeRecord State Machine                          │
//! │                                                                         │
//! │   enqueue            claim              mark_synced                     │
//! │  ────────► PENDING ────────► PROCESSING ────────► SYNCED (terminal)     │
//! │                                  │                                      │
//! │                                  │ mark_failed                          │
//! │                                  ▼                                      │
//! │                               FAILED ────────► PROCESSING (re-claim)    │
//! │                                                                         │
//! │  Status is monotonic except FAILED → PROCESSING on retry.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::types::StoreRole;

// =============================================================================
// Change Status
// =============================================================================

/// Lifecycle status of a queued change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Enqueued, never claimed.
    Pending,

    /// Claimed by a replayer; at most one holder at a time.
    Processing,

    /// Replayed into the primary successfully. Terminal.
    Synced,

    /// Last replay attempt failed; eligible for re-claim.
    Failed,
}

impl ChangeStatus {
    /// Returns true if a replayer may claim a record in this status.
    pub fn is_claimable(self) -> bool {
        matches!(self, ChangeStatus::Pending | ChangeStatus::Failed)
    }

    /// Returns true if the record will never be replayed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChangeStatus::Synced)
    }

    /// Returns true if `next` is a legal transition from this status.
    ///
    /// The only backward edge is `Failed → Processing` (retry).
    pub fn can_transition_to(self, next: ChangeStatus) -> bool {
        matches!(
            (self, next),
            (ChangeStatus::Pending, ChangeStatus::Processing)
                | (ChangeStatus::Processing, ChangeStatus::Synced)
                | (ChangeStatus::Processing, ChangeStatus::Failed)
                | (ChangeStatus::Failed, ChangeStatus::Processing)
        )
    }

    /// Stable lowercase name used in queue rows and statistics.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Processing => "processing",
            ChangeStatus::Synced => "synced",
            ChangeStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "processing" => Ok(ChangeStatus::Processing),
            "synced" => Ok(ChangeStatus::Synced),
            "failed" => Ok(ChangeStatus::Failed),
            other => Err(format!("unknown change status: '{}'", other)),
        }
    }
}

// =============================================================================
// Change Operation
// =============================================================================

/// The operation a change record replays, with its captured payload.
///
/// - `Save` embeds the fully materialized document (computed fields
///   stripped by capture) so the replayer can upsert it by id or merge it
///   into an existing document found via business keys.
/// - `Update` / `Delete` embed the original filter (and update expression)
///   verbatim so the replayer reissues the identical operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Full-document save (create or upsert-by-id).
    Save {
        /// The materialized document, including its `id` field.
        document: JsonValue,
    },

    /// Filter-based update.
    Update {
        /// Equality filter selecting the documents to update.
        filter: JsonValue,
        /// Update expression (`$set`-style field map).
        update: JsonValue,
        /// Whether to insert when no document matches the filter.
        upsert: bool,
    },

    /// Filter-based delete.
    Delete {
        /// Equality filter selecting the documents to delete.
        filter: JsonValue,
    },
}

impl ChangeOp {
    /// Returns the payload-free kind of this operation.
    pub fn kind(&self) -> ChangeOpKind {
        match self {
            ChangeOp::Save { .. } => ChangeOpKind::Save,
            ChangeOp::Update { .. } => ChangeOpKind::Update,
            ChangeOp::Delete { .. } => ChangeOpKind::Delete,
        }
    }

    /// For saves, returns the document id if the payload carries one.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ChangeOp::Save { document } => document.get("id").and_then(JsonValue::as_str),
            _ => None,
        }
    }
}

/// Operation kind without payload, for queue rows and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOpKind {
    Save,
    Update,
    Delete,
}

impl ChangeOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOpKind::Save => "save",
            ChangeOpKind::Update => "update",
            ChangeOpKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Change Error
// =============================================================================

/// Structured failure recorded on a change record by the replayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeError {
    /// Stable machine-readable code (e.g. "unique_violation", "replay").
    pub code: String,

    /// Human-readable detail.
    pub message: String,
}

impl ChangeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ChangeError {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ChangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// =============================================================================
// Change Record
// =============================================================================

/// One queued mutation: the durable unit handed from change capture to the
/// sync replayer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Queue-assigned UUID.
    pub id: String,

    /// Logical entity name the operation targets (e.g. "User").
    pub entity: String,

    /// Operation kind and captured payload.
    pub op: ChangeOp,

    /// Store the write originally executed against (always secondary in
    /// practice; recorded for audit).
    pub origin: StoreRole,

    /// Current lifecycle status.
    pub status: ChangeStatus,

    /// Number of replay claims so far.
    pub attempts: i64,

    /// Enqueue time; claims are strictly oldest-first by this field.
    pub created_at: DateTime<Utc>,

    /// When a replayer last claimed this record.
    pub last_tried_at: Option<DateTime<Utc>>,

    /// Last replay failure, if any.
    pub last_error: Option<ChangeError>,
}

impl ChangeRecord {
    /// Creates a fresh pending record for an operation captured on `origin`.
    pub fn new(entity: impl Into<String>, op: ChangeOp, origin: StoreRole) -> Self {
        ChangeRecord {
            id: Uuid::new_v4().to_string(),
            entity: entity.into(),
            op,
            origin,
            status: ChangeStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            last_tried_at: None,
            last_error: None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
