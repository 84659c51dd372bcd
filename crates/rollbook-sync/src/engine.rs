//! # Sync Engine
//!
//! The assembled engine context: one object owning the connection manager,
//! entity registry, change queue and replayer, plus the background tasks
//! that keep them moving. Applications create one engine per process and
//! pass it (or proxies obtained from it) around explicitly; nothing in the
//! crate is process-global.
//!
//! ## Assembly
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncEngine                                     │
//! │                                                                         │
//! │  ┌──────────────────┐      ┌────────────────┐      ┌───────────────┐   │
//! │  │ConnectionManager │◄─────│ EntityRegistry │◄─────│ EntityProxy   │   │
//! │  │ (2 stores)       │      │ + ChangeCapture│      │ (handed out)  │   │
//! │  └────────┬─────────┘      └────────────────┘      └───────────────┘   │
//! │           │ events                  │ capture                          │
//! │           ▼                         ▼                                  │
//! │  ┌──────────────────┐      ┌────────────────┐                          │
//! │  │ event listener   │      │  ChangeQueue   │                          │
//! │  │ task: drain on   │─────►│  (secondary)   │                          │
//! │  │ primary recovery │      └───────┬────────┘                          │
//! │  └──────────────────┘              │ claim                             │
//! │  ┌──────────────────┐              ▼                                   │
//! │  │ health poll task │      ┌────────────────┐                          │
//! │  │ (config cadence) │      │  SyncReplayer  │──► primary store         │
//! │  └──────────────────┘      └────────────────┘                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Drain Triggers
//! - `Connected(Primary)` or an active switch back to the primary
//! - a lagged event subscription (re-checks primary health directly)
//! - engine start, when the primary comes up online
//! - explicit [`drain_now`](SyncEngine::drain_now)

use rollbook_core::StoreRole;
use rollbook_store::{
    proxy_for, ConnectionManager, EntityProxy, EntityRegistry, EntitySchema, HealthReport,
    StoreEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::ChangeCapture;
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::queue::{ChangeQueue, QueueStats};
use crate::replayer::{DrainReport, SyncReplayer};

/// One dual-store engine instance.
pub struct SyncEngine {
    config: EngineConfig,
    manager: Arc<ConnectionManager>,
    registry: Arc<EntityRegistry>,
    queue: Arc<ChangeQueue>,
    replayer: Arc<SyncReplayer>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Assembles an engine from a validated configuration.
    ///
    /// No I/O happens here; call [`start`](Self::start) to open connections
    /// and launch the background tasks.
    pub fn new(config: EngineConfig) -> SyncResult<Self> {
        config.validate()?;

        let manager = Arc::new(ConnectionManager::new(
            config.stores.primary_address.clone(),
            config.stores.secondary_address.clone(),
        ));
        let registry = Arc::new(EntityRegistry::new(manager.clone()));
        let queue = Arc::new(ChangeQueue::new(manager.clone(), config.sync.max_attempts));
        let replayer = Arc::new(SyncReplayer::new(registry.clone(), queue.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(SyncEngine {
            config,
            manager,
            registry,
            queue,
            replayer,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Opens both stores, wires change capture, launches the background
    /// tasks and drains any backlog left from a previous run.
    pub async fn start(&self) -> SyncResult<()> {
        info!(component = "engine", event = "starting");

        self.registry
            .set_capture_hook(Arc::new(ChangeCapture::new(
                self.manager.clone(),
                self.queue.clone(),
            )))
            .await;

        self.manager.ensure_connections().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_event_listener());
        if let Some(task) = self.spawn_health_poll() {
            tasks.push(task);
        }
        drop(tasks);

        // Backlog from a previous run replays as soon as we are up.
        if self.manager.is_primary_online().await {
            let report = self.replayer.drain().await?;
            if !report.is_empty() {
                info!(
                    component = "engine",
                    event = "startup:drained",
                    synced = report.synced,
                    failed = report.failed,
                );
            }
        }

        info!(component = "engine", event = "started");
        Ok(())
    }

    /// Registers an entity and returns its long-lived access proxy.
    pub async fn register_entity(&self, schema: EntitySchema) -> EntityProxy {
        let schema = self.registry.register(schema).await;
        proxy_for(&self.registry, schema.name.clone())
    }

    /// Returns a proxy for an already-registered entity. The proxy itself
    /// errors with `ModelNotRegistered` on use if the name is unknown.
    pub fn entity(&self, name: impl Into<String>) -> EntityProxy {
        proxy_for(&self.registry, name)
    }

    /// The connection manager, for health probes and driver edge callbacks.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connection health snapshot.
    pub async fn health(&self) -> HealthReport {
        self.manager.health().await
    }

    /// Change queue statistics.
    pub async fn queue_stats(&self) -> SyncResult<QueueStats> {
        self.queue.stats().await
    }

    /// Number of changes still awaiting replay.
    pub async fn pending_changes(&self) -> SyncResult<i64> {
        self.queue.pending_count().await
    }

    /// Trims synced queue rows older than `days_old` days.
    pub async fn cleanup_synced(&self, days_old: u32) -> SyncResult<u64> {
        self.queue.cleanup_synced(days_old).await
    }

    /// Runs a drain pass immediately (no-op while another is in flight).
    pub async fn drain_now(&self) -> SyncResult<DrainReport> {
        self.replayer.drain().await
    }

    /// Stops the background tasks and closes both stores.
    pub async fn shutdown(&self) {
        info!(component = "engine", event = "stopping");
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(component = "engine", error = %e, "Background task panicked");
            }
        }

        self.manager.close().await;
        info!(component = "engine", event = "stopped");
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Listens for connection events and drains when the primary recovers.
    fn spawn_event_listener(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let replayer = self.replayer.clone();
        let mut events = self.manager.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(StoreEvent::Connected(StoreRole::Primary))
                        | Ok(StoreEvent::ActiveSwitched {
                            to: Some(StoreRole::Primary),
                            ..
                        }) => {
                            debug!(component = "engine", event = "drain:triggered");
                            if let Err(e) = replayer.drain().await {
                                warn!(component = "engine", error = %e, "Drain failed");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // We may have missed a recovery event; check
                            // the primary directly instead of guessing.
                            warn!(component = "engine", skipped, "Event subscription lagged");
                            if manager.is_primary_online().await {
                                if let Err(e) = replayer.drain().await {
                                    warn!(component = "engine", error = %e, "Drain failed");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(component = "engine", event = "event_listener:stopped");
        })
    }

    /// Periodically probes both stores. A cadence of 0 disables the task.
    fn spawn_health_poll(&self) -> Option<JoinHandle<()>> {
        let secs = self.config.sync.health_poll_secs;
        if secs == 0 {
            return None;
        }

        let manager = self.manager.clone();
        let mut shutdown = self.shutdown.subscribe();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; transitions it detects are
            // already covered by start().
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => manager.check_health().await,
                }
            }
            debug!(component = "engine", event = "health_poll:stopped");
        }))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
