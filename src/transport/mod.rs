//! Transport capability and its offline-first decorator.
//!
//! [`Transport`] is the point-to-point "send an envelope to a peer" seam. The
//! concrete network implementation lives outside this crate; the core ships
//! an in-memory broker for tests and the [`OutboxTransport`] decorator that
//! wraps any transport with a persistent retry queue, plus a
//! [`DeliveryTracker`] that turns receipts into per-envelope status.

pub mod delivery;
pub mod memory;
pub mod outbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::protocol::{DeliveryReceipt, Envelope};

pub use delivery::{DeliveryTracker, StatusMap};
pub use memory::{InMemoryBroker, InMemoryTransport};
pub use outbox::{FlushReport, OutboxTransport, OUTBOX_UNAVAILABLE};

/// Capacity of the broadcast channels carrying envelopes and receipts.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("Recipient could not be resolved: {0}")]
    UnknownRecipient(String),
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Optional capability: push notifications of connection-state changes.
///
/// Implementations declare support by returning `Supported`; callers never
/// detect the capability any other way.
pub enum StateNotifications {
    Supported(watch::Receiver<ConnectionState>),
    Unsupported,
}

impl StateNotifications {
    pub fn is_supported(&self) -> bool {
        matches!(self, StateNotifications::Supported(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, local_id: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;

    async fn send(&self, envelope: Envelope) -> Result<DeliveryReceipt>;

    /// Incoming envelopes addressed to this peer.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Asynchronous receipt updates (delivered / acknowledged / failed).
    fn subscribe_receipts(&self) -> broadcast::Receiver<DeliveryReceipt>;

    async fn register_address(&self, peer_id: &str, address: &str) -> Result<()>;

    async fn resolve_address(&self, peer_id: &str) -> Result<Option<String>>;

    fn state_notifications(&self) -> StateNotifications {
        StateNotifications::Unsupported
    }
}
