//! # Engine Configuration
//!
//! Configuration for one sync engine instance.
//!
//! ## Configuration File Format
//! ```toml
//! # rollbook.toml
//! [stores]
//! primary_address = "/var/lib/rollbook/cloud-replica.db"
//! secondary_address = "/var/lib/rollbook/local.db"
//!
//! [sync]
//! health_poll_secs = 15
//! # max_attempts = 25    # optional; unset means no ceiling
//! ```
//!
//! The primary is configured in every normal deployment; the secondary is
//! optional. With no secondary the whole offline-queue path is inert: all
//! writes go straight to the primary or fail.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default cadence of the background health poll.
const DEFAULT_HEALTH_POLL_SECS: u64 = 15;

// =============================================================================
// Config Sections
// =============================================================================

/// Store addresses. `None` disables a store entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Address of the authoritative store.
    pub primary_address: Option<String>,

    /// Address of the locally reachable fallback store.
    pub secondary_address: Option<String>,
}

/// Sync behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Seconds between background health probes. 0 disables the poll task
    /// (transitions then come only from driver-reported events).
    pub health_poll_secs: u64,

    /// Optional attempt ceiling: records that reach it stop being
    /// claim-eligible. Unset means records retry indefinitely.
    pub max_attempts: Option<i64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            health_poll_secs: DEFAULT_HEALTH_POLL_SECS,
            max_attempts: None,
        }
    }
}

// =============================================================================
// Engine Config
// =============================================================================

/// Full configuration for a [`SyncEngine`](crate::engine::SyncEngine).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stores: StoreSettings,
    pub sync: SyncSettings,
}

impl EngineConfig {
    /// Creates a config with both store addresses set.
    pub fn new(
        primary_address: impl Into<String>,
        secondary_address: impl Into<String>,
    ) -> Self {
        EngineConfig {
            stores: StoreSettings {
                primary_address: Some(primary_address.into()),
                secondary_address: Some(secondary_address.into()),
            },
            sync: SyncSettings::default(),
        }
    }

    /// Parses a TOML configuration string.
    pub fn from_toml_str(raw: &str) -> SyncResult<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the primary store address.
    pub fn primary(mut self, address: impl Into<String>) -> Self {
        self.stores.primary_address = Some(address.into());
        self
    }

    /// Sets the secondary store address.
    pub fn secondary(mut self, address: impl Into<String>) -> Self {
        self.stores.secondary_address = Some(address.into());
        self
    }

    /// Sets the health poll cadence.
    pub fn health_poll_secs(mut self, secs: u64) -> Self {
        self.sync.health_poll_secs = secs;
        self
    }

    /// Sets the attempt ceiling.
    pub fn max_attempts(mut self, attempts: i64) -> Self {
        self.sync.max_attempts = Some(attempts);
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.stores.primary_address.is_none() && self.stores.secondary_address.is_none() {
            return Err(SyncError::InvalidConfig(
                "at least one store address must be configured".into(),
            ));
        }
        if let Some(max) = self.sync.max_attempts {
            if max < 1 {
                return Err(SyncError::InvalidConfig(format!(
                    "max_attempts must be at least 1, got {}",
                    max
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
