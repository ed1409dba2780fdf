//! Runtime configuration for the outbox decorator and the replication engine.
//!
//! Every field has a default, so an empty JSON object (or a partial one) is a
//! valid configuration document.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::MessageType;

/// Default client-side deadline for a single transport send.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 15_000;

/// Default number of spaces that may hold parked (not yet decryptable) changes.
pub const DEFAULT_PARKED_SPACES: usize = 64;

/// Default number of parked changes retained per space.
pub const DEFAULT_PARKED_CHANGES_PER_SPACE: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub outbox: OutboxConfig,
    pub replication: ReplicationConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outbox: OutboxConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutboxConfig {
    /// Fire-and-forget message classes that bypass the outbox.
    pub skip_types: Vec<MessageType>,
    /// Per-send deadline in milliseconds. `0` disables the deadline.
    pub send_timeout_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            skip_types: vec![MessageType::ProfileUpdate],
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

impl OutboxConfig {
    pub fn send_timeout(&self) -> Option<Duration> {
        if self.send_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.send_timeout_ms))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicationConfig {
    pub parked_spaces: usize,
    pub parked_changes_per_space: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            parked_spaces: DEFAULT_PARKED_SPACES,
            parked_changes_per_space: DEFAULT_PARKED_CHANGES_PER_SPACE,
        }
    }
}
