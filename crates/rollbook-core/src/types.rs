//! # Store Roles and Connection Lifecycle
//!
//! Shared enums describing which backend a value belongs to and where a
//! backend currently sits in its connection lifecycle.

use serde::{Deserialize, Serialize};

// =============================================================================
// Store Role
// =============================================================================

/// Which of the two backends a connection, binding or change belongs to.
///
/// ## Role Semantics
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  PRIMARY                                                                │
/// │  ───────                                                                │
/// │  • The authoritative store (typically remote/"cloud")                   │
/// │  • Sync target: queued changes are replayed INTO it                     │
/// │                                                                         │
/// │  SECONDARY                                                              │
/// │  ─────────                                                              │
/// │  • Locally reachable fallback store                                     │
/// │  • Writes land here while primary is unreachable                        │
/// │  • Origin of every queued change record                                 │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    /// The authoritative backend; sync target for replay.
    Primary,

    /// The locally reachable fallback backend.
    Secondary,
}

impl StoreRole {
    /// Returns the opposite role.
    pub fn other(self) -> StoreRole {
        match self {
            StoreRole::Primary => StoreRole::Secondary,
            StoreRole::Secondary => StoreRole::Primary,
        }
    }

    /// Stable lowercase name used in log events and queue rows.
    pub fn as_str(self) -> &'static str {
        match self {
            StoreRole::Primary => "primary",
            StoreRole::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for StoreRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StoreRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(StoreRole::Primary),
            "secondary" => Ok(StoreRole::Secondary),
            other => Err(format!("unknown store role: '{}'", other)),
        }
    }
}

// =============================================================================
// Connection Status
// =============================================================================

/// Lifecycle status of one store connection.
///
/// Owned by the connection manager; `Disabled` means the store has no
/// configured address and is never reattempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No address configured; never attempted.
    Disabled,

    /// Configured but not currently connected.
    Disconnected,

    /// Connection attempt in flight.
    Connecting,

    /// Connected and usable.
    Connected,

    /// Last attempt or operation failed; see the recorded error.
    Error,
}

impl ConnectionStatus {
    /// Returns true if the store may be used for reads/writes right now.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Returns true if the store is configured at all.
    pub fn is_configured(self) -> bool {
        !matches!(self, ConnectionStatus::Disabled)
    }

    /// Stable lowercase name used in log events and health snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disabled => "disabled",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_other() {
        assert_eq!(StoreRole::Primary.other(), StoreRole::Secondary);
        assert_eq!(StoreRole::Secondary.other(), StoreRole::Primary);
    }

    #[test]
    fn test_role_round_trip() {
        let role: StoreRole = "secondary".parse().unwrap();
        assert_eq!(role, StoreRole::Secondary);
        assert_eq!(role.to_string(), "secondary");
        assert!("tertiary".parse::<StoreRole>().is_err());
    }

    #[test]
    fn test_status_predicates() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Error.is_connected());
        assert!(!ConnectionStatus::Disabled.is_configured());
        assert!(ConnectionStatus::Disconnected.is_configured());
    }
}
