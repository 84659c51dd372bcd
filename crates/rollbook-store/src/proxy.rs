//! # Entity Access Proxy
//!
//! A stable, long-lived entity handle that defers the "which backend"
//! decision to call time. Callers hold the proxy; every access resolves the
//! registry binding against the currently active store, so a reference
//! created before a failover keeps working after it without being
//! re-fetched.
//!
//! ## Resolution Steps
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  proxy.resolve()                                                        │
//! │                                                                         │
//! │  1. No store configured at all?        ──► NoConnectionAvailable        │
//! │  2. Fetch the registry binding pair (lazy half materialization)         │
//! │  3. Derive the active store role                                         │
//! │  4. Half for the active role exists?   ──► use it                        │
//! │     Else any half exists?              ──► fall back to it               │
//! │     Else                               ──► ModelNotRegistered            │
//! │     (distinct from step 1: connectivity exists, binding doesn't —        │
//! │      a registration race, not absence of configuration)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rollbook_core::StoreRole;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::handle::EntityHandle;
use crate::registry::EntityRegistry;

/// Transparent handle for one entity. Cheap to clone and share.
#[derive(Clone)]
pub struct EntityProxy {
    name: String,
    registry: Arc<EntityRegistry>,
}

impl EntityProxy {
    pub(crate) fn new(name: String, registry: Arc<EntityRegistry>) -> Self {
        EntityProxy { name, registry }
    }

    /// The entity name this proxy targets.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves the concrete binding on the currently active store.
    pub async fn resolve(&self) -> StoreResult<EntityHandle> {
        let manager = self.registry.manager();

        if !manager.any_configured().await {
            return Err(StoreError::NoConnectionAvailable);
        }

        let snapshot = self.registry.snapshot(&self.name).await?;
        // Some store is configured, so derivation yields a role.
        let active = manager.active_role().await.unwrap_or(StoreRole::Primary);

        let (role, store) = if let Some(store) = snapshot.half(active) {
            (active, store.clone())
        } else if let Some(store) = snapshot.half(active.other()) {
            (active.other(), store.clone())
        } else {
            return Err(StoreError::ModelNotRegistered {
                entity: self.name.clone(),
                store: active,
            });
        };

        Ok(EntityHandle::new(
            snapshot.schema,
            role,
            store,
            self.registry.capture_hook().await,
        ))
    }

    // =========================================================================
    // Convenience passthroughs (resolve per call)
    // =========================================================================

    pub async fn save(&self, document: JsonValue) -> StoreResult<JsonValue> {
        self.resolve().await?.save(document).await
    }

    pub async fn save_many(&self, documents: Vec<JsonValue>) -> StoreResult<Vec<JsonValue>> {
        self.resolve().await?.save_many(documents).await
    }

    pub async fn update_many(
        &self,
        filter: &JsonValue,
        update: &JsonValue,
        upsert: bool,
    ) -> StoreResult<u64> {
        self.resolve().await?.update_many(filter, update, upsert).await
    }

    pub async fn delete_many(&self, filter: &JsonValue) -> StoreResult<u64> {
        self.resolve().await?.delete_many(filter).await
    }

    pub async fn find_by_id(&self, id: &str) -> StoreResult<Option<JsonValue>> {
        self.resolve().await?.find_by_id(id).await
    }

    pub async fn find_one(&self, filter: &JsonValue) -> StoreResult<Option<JsonValue>> {
        self.resolve().await?.find_one(filter).await
    }

    pub async fn find_many(
        &self,
        filter: &JsonValue,
        limit: Option<i64>,
    ) -> StoreResult<Vec<JsonValue>> {
        self.resolve().await?.find_many(filter, limit).await
    }

    pub async fn count(&self, filter: &JsonValue) -> StoreResult<i64> {
        self.resolve().await?.count(filter).await
    }
}

/// Creates a proxy for a registered entity.
///
/// Exposed as a free function so the sync engine can hand out proxies
/// without re-exporting registry internals.
pub fn proxy_for(registry: &Arc<EntityRegistry>, name: impl Into<String>) -> EntityProxy {
    EntityProxy::new(name.into(), registry.clone())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::document::MEMORY_ADDRESS;
    use crate::schema::EntitySchema;
    use serde_json::json;

    fn mem() -> Option<String> {
        Some(MEMORY_ADDRESS.to_string())
    }

    async fn registry(
        primary: Option<String>,
        secondary: Option<String>,
    ) -> (Arc<ConnectionManager>, Arc<EntityRegistry>) {
        let manager = Arc::new(ConnectionManager::new(primary, secondary));
        manager.ensure_connections().await.unwrap();
        let registry = Arc::new(EntityRegistry::new(manager.clone()));
        (manager, registry)
    }

    #[tokio::test]
    async fn test_no_connection_available() {
        let (_, registry) = registry(None, None).await;
        registry.register(EntitySchema::new("Note")).await;

        let proxy = proxy_for(&registry, "Note");
        let err = proxy.resolve().await.unwrap_err();
        assert!(matches!(err, StoreError::NoConnectionAvailable));
    }

    #[tokio::test]
    async fn test_model_not_registered() {
        let (_, registry) = registry(mem(), None).await;

        let proxy = proxy_for(&registry, "Ghost");
        let err = proxy.resolve().await.unwrap_err();
        assert!(matches!(err, StoreError::ModelNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_resolves_to_active_store() {
        let (manager, registry) = registry(mem(), mem()).await;
        registry.register(EntitySchema::new("Note")).await;
        let proxy = proxy_for(&registry, "Note");

        assert_eq!(proxy.resolve().await.unwrap().role(), StoreRole::Primary);

        manager.record_offline(StoreRole::Primary, "down").await;
        assert_eq!(proxy.resolve().await.unwrap().role(), StoreRole::Secondary);

        manager.record_connected(StoreRole::Primary).await;
        assert_eq!(proxy.resolve().await.unwrap().role(), StoreRole::Primary);
    }

    #[tokio::test]
    async fn test_long_lived_proxy_survives_failover() {
        let (manager, registry) = registry(mem(), mem()).await;
        registry.register(EntitySchema::new("Note")).await;
        let proxy = proxy_for(&registry, "Note");

        proxy.save(json!({"id": "n1", "topic": "before"})).await.unwrap();

        manager.record_offline(StoreRole::Primary, "down").await;
        // Same proxy instance; the write lands on the secondary.
        proxy.save(json!({"id": "n2", "topic": "after"})).await.unwrap();

        let primary = manager.store(StoreRole::Primary).await.unwrap();
        let secondary = manager.store(StoreRole::Secondary).await.unwrap();
        assert!(primary.find_by_id("Note", "n1").await.unwrap().is_some());
        assert!(primary.find_by_id("Note", "n2").await.unwrap().is_none());
        assert!(secondary.find_by_id("Note", "n2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_falls_back_to_existing_half() {
        // Secondary configured but only primary opened: the active role may
        // be primary, but a secondary-only binding still resolves.
        let manager = Arc::new(ConnectionManager::new(None, mem()));
        manager.ensure_connections().await.unwrap();
        let registry = Arc::new(EntityRegistry::new(manager));
        registry.register(EntitySchema::new("Note")).await;

        let handle = proxy_for(&registry, "Note").resolve().await.unwrap();
        assert_eq!(handle.role(), StoreRole::Secondary);
    }
}
