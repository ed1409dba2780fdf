//! Pending-message store: the persistent outbox of envelopes that have not
//! yet been confirmed by the transport.
//!
//! The store is a contract. The core ships an in-memory implementation for
//! tests and ephemeral peers, and a JSON file implementation so queued
//! envelopes survive restarts. Applications backed by a database implement
//! [`PendingStore`] themselves.
//!
//! Semantics every implementation must honor:
//! 1. `enqueue` is idempotent on `envelope.id`; a second enqueue is a no-op
//!    and never resets `retry_count`.
//! 2. `pending` returns entries in FIFO order (`created_at`, then enqueue
//!    sequence for entries created within the same clock tick).
//! 3. `retry_count` only ever grows.
//! 4. The store never retries anything itself.

pub mod file;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::protocol::Envelope;

pub use file::FilePendingStore;
pub use memory::InMemoryPendingStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Pending entry not found: {0}")]
    NotFound(String),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// PendingEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub envelope: Envelope,
    /// When the envelope was first queued.
    pub created_at: DateTime<Utc>,
    /// Failed flush attempts so far.
    pub retry_count: u32,
    /// Enqueue order; breaks ties between equal `created_at` values.
    #[serde(default)]
    pub sequence: u64,
}

impl PendingEntry {
    pub fn new(envelope: Envelope, sequence: u64) -> Self {
        Self {
            envelope,
            created_at: Utc::now(),
            retry_count: 0,
            sequence,
        }
    }

    pub fn id(&self) -> &str {
        &self.envelope.id
    }
}

/// Sort entries oldest-first.
pub(crate) fn sort_fifo(entries: &mut [PendingEntry]) {
    entries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

pub trait PendingStore: Send + Sync {
    /// Add an envelope. No-op if an entry with the same id already exists.
    fn enqueue(&self, envelope: &Envelope) -> Result<()>;

    /// Remove an entry. No-op if absent.
    fn dequeue(&self, envelope_id: &str) -> Result<()>;

    /// All entries, oldest first.
    fn pending(&self) -> Result<Vec<PendingEntry>>;

    fn has(&self, envelope_id: &str) -> Result<bool>;

    /// Record a failed attempt. Fails with `NotFound` for unknown ids.
    fn increment_retry(&self, envelope_id: &str) -> Result<()>;

    fn count(&self) -> Result<usize>;

    /// Observable pending count, for "sync pending" indicators.
    fn watch_count(&self) -> watch::Receiver<usize>;
}
