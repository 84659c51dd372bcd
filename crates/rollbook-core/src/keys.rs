//! # Business-Key Descriptors
//!
//! Alternate unique lookups used by the replayer to detect that a queued
//! record corresponds to an entity that already exists on the primary under
//! a different document id (e.g. the same student re-registering while
//! offline).
//!
//! ## Resolution Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Save replay for entity "User", document { id, email, student_number }  │
//! │                                                                         │
//! │  1. lookup by [email]            ──► found? update that document        │
//! │  2. lookup by [student_number]   ──► found? update that document        │
//! │  3. no lookup matched            ──► upsert by document id              │
//! │                                                                         │
//! │  Descriptors are consulted in order; the first complete, matching       │
//! │  lookup wins.                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Descriptors are static: defined once per entity type that participates
//! in conflict-prone replication. Entities without a descriptor replay by
//! document id only.

use serde_json::{Map, Value as JsonValue};

// =============================================================================
// Business Key
// =============================================================================

/// One alternate unique lookup: a set of document fields that together
/// identify a logical entity independently of its document id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessKey {
    /// Fields forming the lookup; all must be present in the document for
    /// the lookup to be usable.
    pub fields: &'static [&'static str],
}

impl BusinessKey {
    pub const fn new(fields: &'static [&'static str]) -> Self {
        BusinessKey { fields }
    }
}

// =============================================================================
// Descriptor Table
// =============================================================================

/// Static descriptor table for the attendance domain.
///
/// Ordering matters: stronger identifiers come first (email before the
/// school-issued student number).
const DESCRIPTORS: &[(&str, &[BusinessKey])] = &[
    (
        "User",
        &[
            BusinessKey::new(&["email"]),
            BusinessKey::new(&["student_number"]),
        ],
    ),
    ("ClassSession", &[BusinessKey::new(&["session_code"])]),
    (
        "AttendanceRecord",
        &[BusinessKey::new(&["session_id", "student_id"])],
    ),
];

/// Returns the ordered business-key descriptor for an entity type, if it
/// participates in conflict-prone replication.
pub fn business_keys_for(entity: &str) -> Option<&'static [BusinessKey]> {
    DESCRIPTORS
        .iter()
        .find(|(name, _)| *name == entity)
        .map(|(_, keys)| *keys)
}

/// Builds an equality filter from a document for one business key.
///
/// Returns `None` when any key field is absent or null in the document, in
/// which case the lookup is skipped and the next descriptor entry is tried.
pub fn key_filter(key: &BusinessKey, document: &JsonValue) -> Option<JsonValue> {
    let mut filter = Map::new();

    for field in key.fields {
        match document.get(*field) {
            Some(value) if !value.is_null() => {
                filter.insert((*field).to_string(), value.clone());
            }
            _ => return None,
        }
    }

    Some(JsonValue::Object(filter))
}

// =============================================================================
// Unit Tests
// =============================================================================
