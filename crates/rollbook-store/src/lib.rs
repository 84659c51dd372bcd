//! # rollbook-store: Document Store Layer for Rollbook
//!
//! This crate provides the storage half of the dual-store synchronization
//! engine: two independently failing SQLite-backed document stores, a
//! connection manager that derives which one is active, and an entity
//! registry/proxy pair that resolves reads and writes at call time.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      rollbook-store Architecture                        │
//! │                                                                         │
//! │  Application code                                                       │
//! │       │ holds                                                           │
//! │       ▼                                                                 │
//! │  ┌────────────┐ resolve()  ┌────────────────┐  binding   ┌───────────┐  │
//! │  │EntityProxy │───────────►│ EntityRegistry │───────────►│  binding  │  │
//! │  │ (stable    │            │ (name→schema,  │            │  pair     │  │
//! │  │  handle)   │            │  lazy halves)  │            │ (P and S) │  │
//! │  └────────────┘            └────────────────┘            └─────┬─────┘  │
//! │       │ active role?                                           │        │
//! │       ▼                                                        ▼        │
//! │  ┌──────────────────┐   events    ┌─────────────────────────────────┐   │
//! │  │ConnectionManager │────────────►│ EntityHandle (store-scoped CRUD)│   │
//! │  │ primary/secondary│  broadcast  │  writes → CaptureHook seam      │   │
//! │  │ health + active  │             └─────────────────────────────────┘   │
//! │  └──────────────────┘                                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────────┐                                                   │
//! │  │  DocumentStore   │  JSON documents over SQLite (json_extract         │
//! │  │  (two instances) │  filters, $set updates, unique fields)            │
//! │  └──────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`connection`] - Connection manager, health snapshots, store events
//! - [`document`] - SQLite-backed document store
//! - [`error`] - Storage error taxonomy
//! - [`handle`] - Resolved entity handles and the capture hook seam
//! - [`proxy`] - Call-time entity access proxy
//! - [`registry`] - Entity registry with lazy binding materialization
//! - [`schema`] - Entity schema definitions

// =============================================================================
// Module Declarations
// =============================================================================

pub mod connection;
pub mod document;
pub mod error;
pub mod handle;
pub mod proxy;
pub mod registry;
pub mod schema;

// =============================================================================
// Re-exports
// =============================================================================

pub use connection::{ConnectionManager, HealthReport, StoreEvent, StoreHealth};
pub use document::{DocumentStore, MEMORY_ADDRESS};
pub use error::{StoreError, StoreResult};
pub use handle::{CaptureHook, EntityHandle, NoCapture};
pub use proxy::{proxy_for, EntityProxy};
pub use registry::{BindingSnapshot, EntityRegistry};
pub use schema::EntitySchema;
