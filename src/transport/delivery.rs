//! Per-envelope delivery status for UI indicators.
//!
//! Status moves `sending -> queued | delivered | failed`, and later to
//! `acknowledged` once the recipient confirms. A confirmed envelope never
//! falls back to an earlier state.

use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Result, Transport};
use crate::protocol::{DeliveryReceipt, DeliveryStatus, Envelope, MessageType, ReceiptStatus};
use crate::storage::{self, PendingStore};

pub type StatusMap = HashMap<String, DeliveryStatus>;

/// Payload of `ack` / `attestation-ack` envelopes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckPayload {
    message_id: String,
}

fn rank(status: DeliveryStatus) -> u8 {
    match status {
        DeliveryStatus::Sending | DeliveryStatus::Queued | DeliveryStatus::Failed => 0,
        DeliveryStatus::Delivered => 1,
        DeliveryStatus::Acknowledged => 2,
    }
}

struct TrackerShared {
    transport: Arc<dyn Transport>,
    statuses: watch::Sender<StatusMap>,
    /// Envelopes we may have to resend on `retry`.
    envelopes: DashMap<String, Envelope>,
}

impl TrackerShared {
    /// Set a status unless it would move a confirmed envelope backwards.
    fn set(&self, id: &str, status: DeliveryStatus) -> bool {
        self.statuses.send_if_modified(|map| match map.get(id).copied() {
            Some(current) if current == status || rank(current) > rank(status) => false,
            _ => {
                map.insert(id.to_string(), status);
                true
            }
        })
    }

    /// Force a status, used when the caller starts a new attempt.
    fn reset(&self, id: &str, status: DeliveryStatus) {
        self.statuses.send_modify(|map| {
            map.insert(id.to_string(), status);
        });
    }

    fn is_tracked(&self, id: &str) -> bool {
        self.statuses.borrow().contains_key(id)
    }

    async fn send(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        let id = envelope.id.clone();
        self.envelopes.insert(id.clone(), envelope.clone());
        self.reset(&id, DeliveryStatus::Sending);

        match self.transport.send(envelope).await {
            Ok(receipt) => {
                let status = if receipt.is_queued() {
                    DeliveryStatus::Queued
                } else if receipt.status == ReceiptStatus::Failed {
                    DeliveryStatus::Failed
                } else {
                    DeliveryStatus::Delivered
                };
                self.set(&id, status);
                Ok(receipt)
            }
            Err(e) => {
                log::debug!("Delivery of {} failed: {}", id, e);
                self.set(&id, DeliveryStatus::Failed);
                Err(e)
            }
        }
    }

    fn on_receipt(&self, receipt: &DeliveryReceipt) {
        if !self.is_tracked(&receipt.message_id) {
            return;
        }
        let status = match receipt.status {
            ReceiptStatus::Delivered => DeliveryStatus::Delivered,
            ReceiptStatus::Acknowledged => DeliveryStatus::Acknowledged,
            ReceiptStatus::Failed => DeliveryStatus::Failed,
            ReceiptStatus::Accepted => return,
        };
        self.set(&receipt.message_id, status);
    }

    fn on_envelope(&self, envelope: &Envelope) {
        if !matches!(
            envelope.message_type,
            MessageType::Ack | MessageType::AttestationAck
        ) {
            return;
        }
        let ack: AckPayload = match serde_json::from_str(&envelope.payload) {
            Ok(ack) => ack,
            Err(_) => return,
        };
        if self.is_tracked(&ack.message_id) && self.set(&ack.message_id, DeliveryStatus::Acknowledged) {
            log::debug!("{} acknowledged by {}", ack.message_id, envelope.from_id);
        }
    }
}

/// Tracks the delivery state of envelopes sent through it.
pub struct DeliveryTracker {
    shared: Arc<TrackerShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryTracker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (statuses, _) = watch::channel(StatusMap::new());
        Self {
            shared: Arc::new(TrackerShared {
                transport,
                statuses,
                envelopes: DashMap::new(),
            }),
            listener: Mutex::new(None),
        }
    }

    fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Follow receipts and incoming acks. Must be called within a Tokio
    /// runtime; calling it again restarts the listener.
    pub fn start(&self) {
        let mut receipts = self.shared.transport.subscribe_receipts();
        let mut incoming = self.shared.transport.subscribe();
        let shared: Weak<TrackerShared> = Arc::downgrade(&self.shared);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    receipt = receipts.recv() => match receipt {
                        Ok(receipt) => match shared.upgrade() {
                            Some(shared) => shared.on_receipt(&receipt),
                            None => break,
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Delivery tracker lagged, {} receipts skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    envelope = incoming.recv() => match envelope {
                        Ok(envelope) => match shared.upgrade() {
                            Some(shared) => shared.on_envelope(&envelope),
                            None => break,
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Delivery tracker lagged, {} envelopes skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        if let Some(previous) = self.listener().replace(task) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.listener().take() {
            task.abort();
        }
    }

    /// Send through the wrapped transport, recording the outcome.
    ///
    /// Transport errors are returned as-is after the envelope is marked
    /// `failed`.
    pub async fn send(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        self.shared.send(envelope).await
    }

    /// Resend a tracked envelope. `Ok(None)` if the id was never sent here.
    pub async fn retry(&self, envelope_id: &str) -> Result<Option<DeliveryReceipt>> {
        let envelope = match self.shared.envelopes.get(envelope_id) {
            Some(envelope) => envelope.value().clone(),
            None => return Ok(None),
        };
        log::info!("Retrying delivery of {}", envelope_id);
        self.shared.send(envelope).await.map(Some)
    }

    /// Mark everything still waiting in the outbox as `queued`.
    pub fn init_from_outbox(&self, store: &dyn PendingStore) -> storage::Result<usize> {
        let pending = store.pending()?;
        let count = pending.len();
        for entry in pending {
            let id = entry.envelope.id.clone();
            self.shared.envelopes.insert(id.clone(), entry.envelope);
            self.shared.set(&id, DeliveryStatus::Queued);
        }
        Ok(count)
    }

    pub fn status(&self, envelope_id: &str) -> Option<DeliveryStatus> {
        self.shared.statuses.borrow().get(envelope_id).copied()
    }

    /// Observable of every tracked status.
    pub fn watch(&self) -> watch::Receiver<StatusMap> {
        self.shared.statuses.subscribe()
    }

    /// Stop tracking an envelope.
    pub fn forget(&self, envelope_id: &str) {
        self.shared.envelopes.remove(envelope_id);
        self.shared.statuses.send_if_modified(|map| map.remove(envelope_id).is_some());
    }
}

impl Drop for DeliveryTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
