//! # Store Connection Manager
//!
//! Owns the two independently failing store connections, tracks their
//! health, and derives which one is "active" for a given read/write.
//!
//! ## Active Store Derivation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Which store answers right now?                      │
//! │                                                                         │
//! │  primary connected && ready     ──► PRIMARY                             │
//! │  else secondary connected/ready ──► SECONDARY                           │
//! │  else primary handle exists     ──► PRIMARY (init-time: allows write    │
//! │                                     attempts that queue on failure)     │
//! │  else secondary handle exists   ──► SECONDARY                           │
//! │  else configured role, if any   ──► that role (handle still opening)    │
//! │  nothing configured             ──► none                                │
//! │                                                                         │
//! │  The derived role is memoized: ActiveSwitched fires exactly once per    │
//! │  net change, not once per underlying connection event.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connection-level errors are recorded on the store's state and logged;
//! they are never thrown to callers of the active-store accessors. Callers
//! check readiness themselves.

use rollbook_core::{ConnectionStatus, StoreRole};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::document::DocumentStore;
use crate::error::StoreResult;

/// Broadcast channel capacity for store events. Subscribers that lag past
/// this many events observe a `Lagged` gap, which is acceptable for
/// drain-trigger consumers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Events
// =============================================================================

/// Typed connection event, broadcast to all subscribers.
///
/// Event kinds and their field shapes are a logging/observability contract:
/// the sync replayer triggers on `Connected(Primary)` and `ActiveSwitched`,
/// and operational tooling consumes the matching log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A store reached `connected`.
    Connected(StoreRole),

    /// A store left `connected` without an error (e.g. explicit close).
    Disconnected(StoreRole),

    /// A store operation or connection attempt failed.
    Errored(StoreRole),

    /// The derived active store changed. Fires once per net change.
    ActiveSwitched {
        from: Option<StoreRole>,
        to: Option<StoreRole>,
    },
}

// =============================================================================
// Connection State
// =============================================================================

/// State of one store connection. Owned exclusively by the manager.
#[derive(Debug)]
struct StoreConnection {
    role: StoreRole,
    address: Option<String>,
    status: ConnectionStatus,
    last_error: Option<String>,
    store: Option<DocumentStore>,
}

impl StoreConnection {
    fn new(role: StoreRole, address: Option<String>) -> Self {
        let status = if address.is_some() {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Disabled
        };
        StoreConnection {
            role,
            address,
            status,
            last_error: None,
            store: None,
        }
    }

    /// Ready means an open handle exists, regardless of status.
    fn is_ready(&self) -> bool {
        self.store.as_ref().is_some_and(|s| s.is_ready())
    }

    fn is_online(&self) -> bool {
        self.status.is_connected() && self.is_ready()
    }
}

/// Health snapshot for one store, for external health-check consumers.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub status: ConnectionStatus,
    pub ready: bool,
    pub last_error: Option<String>,
}

/// Health snapshot across both stores plus the resolved active store.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub primary: StoreHealth,
    pub secondary: StoreHealth,
    pub active: Option<StoreRole>,
}

struct ManagerState {
    primary: StoreConnection,
    secondary: StoreConnection,
    /// Previously derived active role; the ActiveSwitched memo.
    last_active: Option<StoreRole>,
}

impl ManagerState {
    fn connection(&self, role: StoreRole) -> &StoreConnection {
        match role {
            StoreRole::Primary => &self.primary,
            StoreRole::Secondary => &self.secondary,
        }
    }

    fn connection_mut(&mut self, role: StoreRole) -> &mut StoreConnection {
        match role {
            StoreRole::Primary => &mut self.primary,
            StoreRole::Secondary => &mut self.secondary,
        }
    }

    /// The §3 derivation rule. Returns `None` only when neither store is
    /// configured.
    fn derive_active(&self) -> Option<StoreRole> {
        if self.primary.is_online() {
            return Some(StoreRole::Primary);
        }
        if self.secondary.is_online() {
            return Some(StoreRole::Secondary);
        }
        // Neither store is usable: hand back the primary handle so
        // init-time writes can be attempted (and queue on failure).
        if self.primary.is_ready() {
            return Some(StoreRole::Primary);
        }
        if self.secondary.is_ready() {
            return Some(StoreRole::Secondary);
        }
        if self.primary.address.is_some() {
            return Some(StoreRole::Primary);
        }
        if self.secondary.address.is_some() {
            return Some(StoreRole::Secondary);
        }
        None
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns both store connection lifecycles.
///
/// Created once per engine instance (no process-wide singleton); every
/// component that needs connectivity holds an `Arc` to the same manager.
pub struct ConnectionManager {
    state: RwLock<ManagerState>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConnectionManager {
    /// Creates a manager for the given addresses. A `None` address marks
    /// that store `disabled`; it is never attempted.
    pub fn new(primary_address: Option<String>, secondary_address: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ConnectionManager {
            state: RwLock::new(ManagerState {
                primary: StoreConnection::new(StoreRole::Primary, primary_address),
                secondary: StoreConnection::new(StoreRole::Secondary, secondary_address),
                last_active: None,
            }),
            events,
        }
    }

    /// Subscribes to connection and active-switch events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Idempotently opens both configured store connections.
    ///
    /// Connection failures are recorded on the store's state (status
    /// `error`, last error set) and never propagated; a disabled store is
    /// skipped entirely.
    pub async fn ensure_connections(&self) -> StoreResult<()> {
        for role in [StoreRole::Primary, StoreRole::Secondary] {
            // Snapshot the address without holding the lock across connect.
            let address = {
                let state = self.state.read().await;
                let conn = state.connection(role);
                if conn.store.is_some() || conn.address.is_none() {
                    continue;
                }
                conn.address.clone().unwrap_or_default()
            };

            {
                let mut state = self.state.write().await;
                state.connection_mut(role).status = ConnectionStatus::Connecting;
            }

            match DocumentStore::connect(&address).await {
                Ok(store) => {
                    let mut state = self.state.write().await;
                    let conn = state.connection_mut(role);
                    conn.store = Some(store);
                    conn.status = ConnectionStatus::Connected;
                    conn.last_error = None;
                    info!(component = "connections", store = %role, event = "connected", address = %address);
                    let _ = self.events.send(StoreEvent::Connected(role));
                    self.reevaluate_active(&mut state);
                }
                Err(e) => {
                    let mut state = self.state.write().await;
                    let conn = state.connection_mut(role);
                    conn.status = ConnectionStatus::Error;
                    conn.last_error = Some(e.to_string());
                    warn!(component = "connections", store = %role, event = "error", error = %e);
                    let _ = self.events.send(StoreEvent::Errored(role));
                    self.reevaluate_active(&mut state);
                }
            }
        }

        Ok(())
    }

    /// Returns the derived active role. Never blocks on store I/O.
    pub async fn active_role(&self) -> Option<StoreRole> {
        self.state.read().await.derive_active()
    }

    /// Returns the handle for a role, if that store has been opened.
    pub async fn store(&self, role: StoreRole) -> Option<DocumentStore> {
        self.state.read().await.connection(role).store.clone()
    }

    /// Returns the active store's handle, per the derivation rule.
    ///
    /// `None` means either nothing is configured or the derived store has
    /// no open handle yet; callers distinguish the two via
    /// [`any_configured`](Self::any_configured).
    pub async fn active_store(&self) -> Option<(StoreRole, DocumentStore)> {
        let state = self.state.read().await;
        let role = state.derive_active()?;
        let store = state.connection(role).store.clone()?;
        Some((role, store))
    }

    /// True iff at least one store has a configured address.
    pub async fn any_configured(&self) -> bool {
        let state = self.state.read().await;
        state.primary.address.is_some() || state.secondary.address.is_some()
    }

    /// True iff the primary's status is `connected`.
    pub async fn is_primary_online(&self) -> bool {
        self.state.read().await.primary.is_online()
    }

    /// Read-only health snapshot for status endpoints.
    pub async fn health(&self) -> HealthReport {
        let state = self.state.read().await;
        let snapshot = |conn: &StoreConnection| StoreHealth {
            status: conn.status,
            ready: conn.is_ready(),
            last_error: conn.last_error.clone(),
        };
        HealthReport {
            primary: snapshot(&state.primary),
            secondary: snapshot(&state.secondary),
            active: state.derive_active(),
        }
    }

    /// Pings both opened stores and records any status transitions.
    pub async fn check_health(&self) {
        for role in [StoreRole::Primary, StoreRole::Secondary] {
            let store = match self.store(role).await {
                Some(store) => store,
                None => continue,
            };

            let alive = store.ping().await;
            let mut state = self.state.write().await;
            let conn = state.connection_mut(role);

            if alive && !conn.status.is_connected() {
                conn.status = ConnectionStatus::Connected;
                conn.last_error = None;
                info!(component = "connections", store = %role, event = "connected");
                let _ = self.events.send(StoreEvent::Connected(role));
                self.reevaluate_active(&mut state);
            } else if !alive && conn.status.is_connected() {
                conn.status = ConnectionStatus::Error;
                conn.last_error = Some("health probe failed".to_string());
                warn!(component = "connections", store = %role, event = "error", error = "health probe failed");
                let _ = self.events.send(StoreEvent::Errored(role));
                self.reevaluate_active(&mut state);
            }
        }
    }

    /// Records a connection-level failure reported by the driver edge.
    pub async fn record_offline(&self, role: StoreRole, reason: &str) {
        let mut state = self.state.write().await;
        let conn = state.connection_mut(role);
        if conn.status == ConnectionStatus::Disabled {
            return;
        }
        if conn.status != ConnectionStatus::Error {
            conn.status = ConnectionStatus::Error;
            conn.last_error = Some(reason.to_string());
            warn!(component = "connections", store = %role, event = "error", error = %reason);
            let _ = self.events.send(StoreEvent::Errored(role));
            self.reevaluate_active(&mut state);
        }
    }

    /// Records a driver-reported disconnect (clean close, no error).
    pub async fn record_disconnected(&self, role: StoreRole) {
        let mut state = self.state.write().await;
        let conn = state.connection_mut(role);
        if conn.status.is_connected() {
            conn.status = ConnectionStatus::Disconnected;
            info!(component = "connections", store = %role, event = "disconnected");
            let _ = self.events.send(StoreEvent::Disconnected(role));
            self.reevaluate_active(&mut state);
        }
    }

    /// Records a driver-reported reconnect for an already-opened store.
    pub async fn record_connected(&self, role: StoreRole) {
        let mut state = self.state.write().await;
        let conn = state.connection_mut(role);
        if conn.store.is_none() {
            return;
        }
        if !conn.status.is_connected() {
            conn.status = ConnectionStatus::Connected;
            conn.last_error = None;
            info!(component = "connections", store = %role, event = "connected");
            let _ = self.events.send(StoreEvent::Connected(role));
            self.reevaluate_active(&mut state);
        }
    }

    /// Closes both stores. Process-teardown only.
    pub async fn close(&self) {
        for role in [StoreRole::Primary, StoreRole::Secondary] {
            if let Some(store) = self.store(role).await {
                store.close().await;
            }
        }
        let mut state = self.state.write().await;
        for role in [StoreRole::Primary, StoreRole::Secondary] {
            let conn = state.connection_mut(role);
            if conn.status.is_configured() {
                conn.status = ConnectionStatus::Disconnected;
            }
        }
        self.reevaluate_active(&mut state);
    }

    /// Re-derives the active store and, if it actually changed since the
    /// last evaluation, emits `ActiveSwitched` exactly once.
    fn reevaluate_active(&self, state: &mut ManagerState) {
        let derived = state.derive_active();
        if derived != state.last_active {
            let from = state.last_active;
            info!(
                component = "connections",
                event = "active:switched",
                from = from.map(|r| r.as_str()).unwrap_or("none"),
                to = derived.map(|r| r.as_str()).unwrap_or("none"),
            );
            let _ = self.events.send(StoreEvent::ActiveSwitched { from, to: derived });
            state.last_active = derived;
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
