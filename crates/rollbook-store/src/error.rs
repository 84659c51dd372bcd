//! # Store Error Types
//!
//! Error taxonomy for the storage layer.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds context and categorization            │
//! │       │                                                                 │
//! │       ├── Connectivity errors: recorded on connection state,           │
//! │       │   never thrown past the connection manager                     │
//! │       │                                                                 │
//! │       ├── UniqueViolation: violated field/value recoverable, feeds     │
//! │       │   the replayer's duplicate-key fallback                        │
//! │       │                                                                 │
//! │       └── NoConnectionAvailable vs ModelNotRegistered: "not            │
//! │           configured" vs "still warming up" — deliberately distinct    │
//! │           so operators can tell the two apart                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rollbook_core::StoreRole;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Document not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// The violated field and value are recoverable from the error so the
    /// replayer can attempt a best-effort lookup by that field.
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// No store is configured at all.
    ///
    /// Fatal to the calling read/write; surfaced to the application layer.
    #[error("No store connection available: neither primary nor secondary is configured")]
    NoConnectionAvailable,

    /// A store is active but no entity binding exists for it yet.
    ///
    /// Distinct from [`StoreError::NoConnectionAvailable`]: this indicates
    /// a registration race, not absence of connectivity.
    #[error("Entity '{entity}' is not registered against the {store} store")]
    ModelNotRegistered { entity: String, store: StoreRole },

    /// Store connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Filter or update expression referenced an unusable field name.
    ///
    /// Field names are interpolated into `json_extract` paths, so only
    /// identifier-like names are accepted.
    #[error("Invalid field name in expression: '{0}'")]
    InvalidField(String),

    /// JSON (de)serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Internal storage error.
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Creates a NotFound error for a given entity type and id.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        StoreError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Returns true if this error is a uniqueness conflict.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }

    /// Returns the violated (field, value) pair for uniqueness conflicts.
    pub fn violated_key(&self) -> Option<(&str, &str)> {
        match self {
            StoreError::UniqueViolation { field, value } => Some((field, value)),
            _ => None,
        }
    }
}

/// Convert sqlx errors to StoreError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → StoreError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::PoolTimedOut   → StoreError::ConnectionFailed
/// Other                       → StoreError::Internal
/// ```
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity: "Document".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // SQLite reports "UNIQUE constraint failed: <table>.<column>"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    StoreError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else {
                    StoreError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => {
                StoreError::ConnectionFailed("connection pool exhausted".to_string())
            }

            sqlx::Error::PoolClosed => StoreError::ConnectionFailed("pool is closed".to_string()),

            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violated_key_accessor() {
        let err = StoreError::duplicate("email", "a@x.com");
        assert!(err.is_unique_violation());
        assert_eq!(err.violated_key(), Some(("email", "a@x.com")));

        let err = StoreError::not_found("User", "u1");
        assert!(err.violated_key().is_none());
    }

    #[test]
    fn test_registration_errors_are_distinct() {
        let warming_up = StoreError::ModelNotRegistered {
            entity: "User".into(),
            store: StoreRole::Primary,
        };
        let unconfigured = StoreError::NoConnectionAvailable;

        assert!(warming_up.to_string().contains("not registered"));
        assert!(unconfigured.to_string().contains("configured"));
    }
}
