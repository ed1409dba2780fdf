//! # Trustspace
//!
//! **End-to-end encrypted, offline-first replication of shared documents.**
//!
//! Peers that already trust each other keep shared, mergeable documents
//! ("spaces") in sync over an unreliable point-to-point network:
//!
//! - **CRDT documents**: every replica converges regardless of delivery order
//! - **Group keys per space**, rotated whenever a member is removed
//! - **Offline-first delivery**: outbound envelopes survive disconnects in a
//!   persistent outbox and are retried on reconnect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trustspace::config::ReplicationConfig;
//! use trustspace::crypto::{GroupKeyRegistry, X25519Identity};
//! use trustspace::replication::{ReplicationEngine, SpaceKind};
//! use trustspace::transport::{InMemoryBroker, InMemoryTransport, Transport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(InMemoryTransport::new(InMemoryBroker::new()));
//! transport.connect("alice").await?;
//!
//! let engine = ReplicationEngine::new(
//!     "alice",
//!     Arc::new(X25519Identity::generate()),
//!     transport,
//!     Arc::new(GroupKeyRegistry::new()),
//!     &ReplicationConfig::default(),
//! );
//! engine.start();
//!
//! let space = engine.create_space(SpaceKind::Shared, &serde_json::json!({ "todos": [] }))?;
//! let handle = engine.open_space(&space.id)?;
//! handle.transact(|doc| doc.push("todos", "buy milk")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`protocol`] | Envelopes, receipts, delivery status, resource references |
//! | [`storage`] | Pending-message store (in-memory and JSON file) |
//! | [`transport`] | Transport trait, in-memory broker, outbox decorator, delivery tracker |
//! | [`crypto`] | Group-key registry, change codec, recipient cipher |
//! | [`crdt`] | Bundled JSON document CRDT |
//! | [`replication`] | Replication engine and space handles |
//! | [`config`] | Serde-backed runtime configuration |

#![allow(
    clippy::type_complexity,
    clippy::too_many_arguments,
    clippy::new_without_default
)]

/// Runtime configuration for the outbox and the replication engine.
pub mod config;

/// Bundled CRDT: LWW registers and replicated sequences over a JSON object.
pub mod crdt;

/// Group keys, encrypted changes and key delivery to new members.
pub mod crypto;

/// Wire types shared by every layer.
pub mod protocol;

/// Encrypted replication of spaces between members.
pub mod replication;

/// Persistent outbox contract and implementations.
pub mod storage;

/// Transport capability, offline-first decorator and delivery tracking.
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::SyncConfig;
pub use crdt::JsonDoc;
pub use crypto::{GroupKeyRegistry, X25519Identity};
pub use protocol::{DeliveryReceipt, DeliveryStatus, Envelope, MessageType, ResourceRef};
pub use replication::{ReplicationEngine, ReplicationError, SpaceHandle, SpaceInfo, SpaceKind};
pub use storage::{FilePendingStore, InMemoryPendingStore, PendingStore};
pub use transport::{DeliveryTracker, InMemoryBroker, InMemoryTransport, OutboxTransport, Transport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert_eq!(version(), VERSION);
    }
}
