//! # Entity Schemas
//!
//! A schema binds a logical entity name to the storage-relevant facts the
//! engine needs: which fields are unique (enforced by the driver and
//! surfaced as uniqueness violations) and which fields are computed at read
//! time (excluded from captured change payloads).

use serde::{Deserialize, Serialize};

/// Schema definition for one logical entity.
///
/// ## Example
/// ```rust,ignore
/// let users = EntitySchema::new("User")
///     .unique_field("email")
///     .unique_field("student_number")
///     .computed_field("display_name");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Logical entity name, e.g. "User".
    pub name: String,

    /// Fields enforced unique across the entity's documents.
    pub unique_fields: Vec<String>,

    /// Read-time fields stripped from captured save payloads.
    pub computed_fields: Vec<String>,
}

impl EntitySchema {
    /// Creates a schema with no unique or computed fields.
    pub fn new(name: impl Into<String>) -> Self {
        EntitySchema {
            name: name.into(),
            unique_fields: Vec::new(),
            computed_fields: Vec::new(),
        }
    }

    /// Declares a unique field.
    pub fn unique_field(mut self, field: impl Into<String>) -> Self {
        self.unique_fields.push(field.into());
        self
    }

    /// Declares a computed (capture-excluded) field.
    pub fn computed_field(mut self, field: impl Into<String>) -> Self {
        self.computed_fields.push(field.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let schema = EntitySchema::new("User")
            .unique_field("email")
            .computed_field("display_name");

        assert_eq!(schema.name, "User");
        assert_eq!(schema.unique_fields, vec!["email"]);
        assert_eq!(schema.computed_fields, vec!["display_name"]);
    }
}
