//! # Sync Error Types
//!
//! Error taxonomy for the sync layer.
//!
//! ## Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Replay Failure Handling                             │
//! │                                                                         │
//! │  RECOVERABLE (conflicts)             UNRECOVERABLE (everything else)    │
//! │  ───────────────────────             ───────────────────────────────    │
//! │  Uniqueness violations —             Marked failed, retried on the      │
//! │  resolved in place via the           next drain via the record's own    │
//! │  duplicate-key fallback or           attempt counter; no hard cap       │
//! │  retried                             enforced here                      │
//! │                                                                         │
//! │  Either way: a failure local to one queued change never aborts the      │
//! │  batch.                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rollbook_core::ChangeError;
use rollbook_store::StoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync layer errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage layer failure (includes uniqueness conflicts).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid engine configuration.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load configuration.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// The secondary store (and therefore the queue) is unavailable.
    #[error("Change queue unavailable: secondary store is not ready")]
    QueueUnavailable,

    /// Change payload (de)serialization failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Internal sync engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Returns true if this failure is a uniqueness conflict, which the
    /// replayer treats as recoverable.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_unique_violation())
    }

    /// Converts to the structured error recorded on a change record.
    pub fn to_change_error(&self) -> ChangeError {
        let code = match self {
            SyncError::Store(e) if e.is_unique_violation() => "unique_violation",
            SyncError::Store(StoreError::ModelNotRegistered { .. }) => "not_registered",
            SyncError::Store(StoreError::NoConnectionAvailable) => "no_connection",
            SyncError::Store(StoreError::ConnectionFailed(_)) => "connection",
            SyncError::Store(_) => "store",
            SyncError::QueueUnavailable => "queue_unavailable",
            SyncError::SerializationFailed(_) => "serialization",
            SyncError::InvalidConfig(_) | SyncError::ConfigLoadFailed(_) => "config",
            SyncError::Internal(_) => "internal",
        };
        ChangeError::new(code, self.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Store(StoreError::from(err))
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let conflict = SyncError::Store(StoreError::duplicate("email", "a@x.com"));
        assert!(conflict.is_conflict());
        assert_eq!(conflict.to_change_error().code, "unique_violation");

        let other = SyncError::Internal("boom".into());
        assert!(!other.is_conflict());
        assert_eq!(other.to_change_error().code, "internal");
    }
}
