//! # Entity Registry
//!
//! Binds logical entity names to schemas and lazily materializes a binding
//! pair (primary half / secondary half) against whichever store connections
//! exist.
//!
//! ## Binding Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  register("User", schema)                                               │
//! │       │                                                                 │
//! │       ├── first call: cache schema, bind against open connections       │
//! │       └── repeat call: no-op (idempotent by name, not schema identity)  │
//! │                                                                         │
//! │  snapshot("User")  — on every access:                                   │
//! │       │                                                                 │
//! │       ├── half missing and its store now open? materialize it lazily    │
//! │       └── return both halves                                            │
//! │                                                                         │
//! │  Invariant: at most one binding pair per entity name; bindings are      │
//! │  never removed at runtime.                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rollbook_core::StoreRole;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::document::DocumentStore;
use crate::error::{StoreError, StoreResult};
use crate::handle::{CaptureHook, NoCapture};
use crate::schema::EntitySchema;

// =============================================================================
// Binding
// =============================================================================

/// The cached binding pair for one entity.
struct EntityBinding {
    schema: Arc<EntitySchema>,
    primary: Option<DocumentStore>,
    secondary: Option<DocumentStore>,
}

/// A point-in-time view of a binding, handed to the proxy and the replayer.
#[derive(Debug)]
pub struct BindingSnapshot {
    pub schema: Arc<EntitySchema>,
    pub primary: Option<DocumentStore>,
    pub secondary: Option<DocumentStore>,
}

impl BindingSnapshot {
    /// The half matching `role`, if materialized.
    pub fn half(&self, role: StoreRole) -> Option<&DocumentStore> {
        match role {
            StoreRole::Primary => self.primary.as_ref(),
            StoreRole::Secondary => self.secondary.as_ref(),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Caches entity bindings for the process lifetime.
///
/// Owned by the engine context; shared by the access proxies and the
/// replayer.
pub struct EntityRegistry {
    manager: Arc<ConnectionManager>,
    bindings: RwLock<HashMap<String, EntityBinding>>,
    capture: RwLock<Arc<dyn CaptureHook>>,
}

impl EntityRegistry {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        EntityRegistry {
            manager,
            bindings: RwLock::new(HashMap::new()),
            capture: RwLock::new(Arc::new(NoCapture)),
        }
    }

    /// The connection manager this registry resolves against.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Installs the capture hook invoked by every resolved handle.
    ///
    /// Called once by the engine during assembly; installing a hook twice
    /// replaces the previous one (there is never more than one attachment).
    pub async fn set_capture_hook(&self, hook: Arc<dyn CaptureHook>) {
        *self.capture.write().await = hook;
    }

    /// The currently installed capture hook.
    pub async fn capture_hook(&self) -> Arc<dyn CaptureHook> {
        self.capture.read().await.clone()
    }

    /// Registers an entity schema.
    ///
    /// Idempotent by name: a second registration under the same name keeps
    /// the first schema and is otherwise a no-op. Binding halves for stores
    /// that are not open yet are created lazily on later access.
    pub async fn register(&self, schema: EntitySchema) -> Arc<EntitySchema> {
        let mut bindings = self.bindings.write().await;

        if let Some(existing) = bindings.get(&schema.name) {
            return existing.schema.clone();
        }

        debug!(component = "registry", entity = %schema.name, event = "registered");

        let schema = Arc::new(schema);
        let binding = EntityBinding {
            schema: schema.clone(),
            primary: None,
            secondary: None,
        };
        bindings.insert(schema.name.clone(), binding);
        drop(bindings);

        // Bind immediately against whatever connections already exist.
        self.refresh_halves(&schema.name).await;
        schema
    }

    /// Returns the registered schema for a name, if any.
    pub async fn schema(&self, name: &str) -> Option<Arc<EntitySchema>> {
        self.bindings.read().await.get(name).map(|b| b.schema.clone())
    }

    /// Returns the binding pair for a registered entity, materializing any
    /// half whose store has become available since the last access.
    pub async fn snapshot(&self, name: &str) -> StoreResult<BindingSnapshot> {
        {
            let bindings = self.bindings.read().await;
            if !bindings.contains_key(name) {
                return Err(StoreError::ModelNotRegistered {
                    entity: name.to_string(),
                    store: self
                        .manager
                        .active_role()
                        .await
                        .unwrap_or(StoreRole::Primary),
                });
            }
        }

        self.refresh_halves(name).await;

        let bindings = self.bindings.read().await;
        let binding = bindings
            .get(name)
            .ok_or_else(|| StoreError::ModelNotRegistered {
                entity: name.to_string(),
                store: StoreRole::Primary,
            })?;

        Ok(BindingSnapshot {
            schema: binding.schema.clone(),
            primary: binding.primary.clone(),
            secondary: binding.secondary.clone(),
        })
    }

    /// Fills in missing binding halves for stores that are now open.
    async fn refresh_halves(&self, name: &str) {
        for role in [StoreRole::Primary, StoreRole::Secondary] {
            let store = match self.manager.store(role).await {
                Some(store) => store,
                None => continue,
            };

            let mut bindings = self.bindings.write().await;
            if let Some(binding) = bindings.get_mut(name) {
                let half = match role {
                    StoreRole::Primary => &mut binding.primary,
                    StoreRole::Secondary => &mut binding.secondary,
                };
                if half.is_none() {
                    debug!(component = "registry", entity = %name, store = %role, event = "bound");
                    *half = Some(store);
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
