//! Offline-first decorator over any [`Transport`].
//!
//! - Envelopes of a skip-listed type go straight to the inner transport and
//!   failures propagate to the caller.
//! - Every other envelope is either delivered or parked in the
//!   [`PendingStore`]; `send` never returns an error for them.
//! - The outbox is flushed (FIFO) after every successful `connect`, and on
//!   demand via [`OutboxTransport::flush_outbox`].

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use super::{ConnectionState, Result, StateNotifications, Transport, TransportError};
use crate::config::OutboxConfig;
use crate::protocol::{DeliveryReceipt, Envelope, MessageType};
use crate::storage::PendingStore;

/// Receipt reason used when the outbox itself could not persist an envelope.
pub const OUTBOX_UNAVAILABLE: &str = "outbox-unavailable";

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// False when another flush was already running and this call did nothing.
    pub ran: bool,
    pub sent: usize,
    pub failed: usize,
    /// True when the pass stopped early because the transport went offline.
    pub halted: bool,
}

struct Shared<T> {
    inner: Arc<T>,
    store: Arc<dyn PendingStore>,
    skip_types: HashSet<MessageType>,
    send_timeout: Option<Duration>,
    flushing: AtomicBool,
}

/// Clears the flushing flag however the flush ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: Transport + 'static> Shared<T> {
    /// Race the inner send against the configured deadline.
    ///
    /// The inner send runs as its own task: a timeout abandons the wait, not
    /// the send, which may still complete later.
    async fn send_with_timeout(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.send(envelope).await });

        let joined = match self.send_timeout {
            None => task.await,
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => return Err(TransportError::SendTimeout(limit)),
            },
        };

        joined.map_err(|e| TransportError::Delivery(format!("send task failed: {}", e)))?
    }

    fn queue(&self, envelope: &Envelope) -> DeliveryReceipt {
        match self.store.enqueue(envelope) {
            Ok(()) => DeliveryReceipt::queued(envelope.id.clone()),
            Err(e) => {
                log::error!("Outbox: failed to persist {}: {}", envelope.id, e);
                DeliveryReceipt::failed(envelope.id.clone(), OUTBOX_UNAVAILABLE)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    async fn flush(&self) -> FlushReport {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Outbox: flush already in progress");
            return FlushReport::default();
        }
        let _guard = FlushGuard(&self.flushing);

        let mut report = FlushReport {
            ran: true,
            ..FlushReport::default()
        };

        let pending = match self.store.pending() {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("Outbox: cannot read pending entries: {}", e);
                return report;
            }
        };

        for entry in pending {
            if !self.is_connected() {
                log::info!("Outbox: transport offline, flush halted");
                report.halted = true;
                break;
            }

            let id = entry.envelope.id.clone();
            match self.send_with_timeout(entry.envelope).await {
                Ok(_) => {
                    if let Err(e) = self.store.dequeue(&id) {
                        log::error!("Outbox: sent {} but could not dequeue it: {}", id, e);
                    }
                    report.sent += 1;
                }
                Err(e) => {
                    log::warn!("Outbox: retry of {} failed: {}", id, e);
                    if let Err(e) = self.store.increment_retry(&id) {
                        log::debug!("Outbox: retry count for {} not updated: {}", id, e);
                    }
                    report.failed += 1;
                }
            }
        }

        if report.sent > 0 || report.failed > 0 {
            log::info!(
                "Outbox flushed: {} sent, {} failed",
                report.sent,
                report.failed
            );
        }
        report
    }
}

/// Offline-first wrapper holding an owned inner transport.
pub struct OutboxTransport<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport + 'static> OutboxTransport<T> {
    pub fn new(inner: T, store: Arc<dyn PendingStore>, config: &OutboxConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Arc::new(inner),
                store,
                skip_types: config.skip_types.iter().copied().collect(),
                send_timeout: config.send_timeout(),
                flushing: AtomicBool::new(false),
            }),
        }
    }

    pub fn inner(&self) -> &T {
        &self.shared.inner
    }

    /// The backing store, for pending-count badges and delivery bootstrapping.
    pub fn store(&self) -> Arc<dyn PendingStore> {
        Arc::clone(&self.shared.store)
    }

    pub fn pending_count(&self) -> watch::Receiver<usize> {
        self.shared.store.watch_count()
    }

    /// Retry every pending envelope in FIFO order.
    ///
    /// A flush already in progress turns this call into a no-op. The pass
    /// stops at the first sign of disconnection; a single failing entry only
    /// bumps its retry count.
    pub async fn flush_outbox(&self) -> FlushReport {
        self.shared.flush().await
    }
}

#[async_trait]
impl<T: Transport + 'static> Transport for OutboxTransport<T> {
    async fn connect(&self, local_id: &str) -> Result<()> {
        self.shared.inner.connect(local_id).await?;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.flush().await;
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.inner.disconnect().await
    }

    fn state(&self) -> ConnectionState {
        self.shared.inner.state()
    }

    async fn send(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        if self.shared.skip_types.contains(&envelope.message_type) {
            return self.shared.inner.send(envelope).await;
        }

        if !self.shared.is_connected() {
            return Ok(self.shared.queue(&envelope));
        }

        match self.shared.send_with_timeout(envelope.clone()).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                log::debug!("Outbox: send of {} failed ({}), queued", envelope.id, e);
                Ok(self.shared.queue(&envelope))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.shared.inner.subscribe()
    }

    fn subscribe_receipts(&self) -> broadcast::Receiver<DeliveryReceipt> {
        self.shared.inner.subscribe_receipts()
    }

    async fn register_address(&self, peer_id: &str, address: &str) -> Result<()> {
        self.shared.inner.register_address(peer_id, address).await
    }

    async fn resolve_address(&self, peer_id: &str) -> Result<Option<String>> {
        self.shared.inner.resolve_address(peer_id).await
    }

    fn state_notifications(&self) -> StateNotifications {
        self.shared.inner.state_notifications()
    }
}
