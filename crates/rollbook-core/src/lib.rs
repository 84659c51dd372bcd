//! # rollbook-core: Pure Sync Types for Rollbook
//!
//! Data model shared by the storage and sync layers of the dual-store
//! synchronization engine. This crate performs no I/O: it defines store
//! roles, change records, queue statuses and the business-key descriptors
//! used for conflict resolution during replay.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         rollbook-core                                   │
//! │                                                                         │
//! │  types.rs    StoreRole          primary | secondary                     │
//! │              ConnectionStatus   disabled | disconnected | connecting    │
//! │                                 | connected | error                     │
//! │                                                                         │
//! │  change.rs   ChangeOp           save | update | delete (with payload)   │
//! │              ChangeStatus       pending | processing | synced | failed  │
//! │              ChangeRecord       one queued mutation                     │
//! │              ChangeError        structured failure (code + message)     │
//! │                                                                         │
//! │  keys.rs     BusinessKey        alternate unique lookup (field set)     │
//! │              business_keys_for  static per-entity descriptor table      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod change;
pub mod keys;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use change::{ChangeError, ChangeOp, ChangeOpKind, ChangeRecord, ChangeStatus};
pub use keys::{business_keys_for, key_filter, BusinessKey};
pub use types::{ConnectionStatus, StoreRole};
