//! # rollbook-sync: Offline Sync Engine for Rollbook
//!
//! The queue-and-replay half of the dual-store synchronization engine.
//! While the primary ("cloud") store is unreachable, writes land on the
//! secondary ("local") store and are captured into a durable change queue;
//! when the primary recovers, the replayer drains the queue into it in
//! order, resolving business-key conflicts along the way.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Offline Write Path                              │
//! │                                                                         │
//! │  app write ──► EntityProxy ──► secondary store ──► ChangeCapture        │
//! │                                  (primary down)        │                │
//! │                                                        ▼                │
//! │                                                  ChangeQueue            │
//! │                                                  (durable FIFO)         │
//! │                                                        │                │
//! │  primary recovers ──► SyncEngine event task ──► SyncReplayer            │
//! │                                                        │                │
//! │                              oldest-first replay       ▼                │
//! │                              + conflict merge    primary store          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`capture`] - Write-path interceptor that queues offline writes
//! - [`config`] - Engine configuration (TOML)
//! - [`engine`] - Assembled engine context and background tasks
//! - [`error`] - Sync error taxonomy
//! - [`queue`] - Durable change queue with atomic claim
//! - [`replayer`] - Drain loop and business-key conflict resolution

// =============================================================================
// Module Declarations
// =============================================================================

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod replayer;

// =============================================================================
// Re-exports
// =============================================================================

pub use capture::ChangeCapture;
pub use config::{EngineConfig, StoreSettings, SyncSettings};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use queue::{ChangeQueue, FailureSummary, QueueStats};
pub use replayer::{DrainReport, SyncReplayer};
