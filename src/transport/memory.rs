use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

use super::{ConnectionState, Result, StateNotifications, Transport, TransportError, CHANNEL_CAPACITY};
use crate::protocol::{DeliveryReceipt, Envelope, ReceiptStatus};

#[derive(Default)]
struct BrokerState {
    /// Connected peers and their inbox senders.
    online: HashMap<String, broadcast::Sender<Envelope>>,
    /// Envelopes waiting for a peer that is offline or not yet listening.
    offline: HashMap<String, Vec<Envelope>>,
    addresses: HashMap<String, String>,
}

/// Directory through which in-memory transports find each other.
///
/// Every transport is handed its broker explicitly; two brokers never share
/// state, so independent tests cannot observe each other's traffic.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget all registrations, queued envelopes and addresses.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.online.clear();
        state.offline.clear();
        state.addresses.clear();
    }

    /// Number of envelopes queued for an offline peer.
    pub fn queued_for(&self, peer_id: &str) -> usize {
        self.lock().offline.get(peer_id).map_or(0, Vec::len)
    }

    /// Route an envelope. Returns true if it reached a listening inbox.
    fn route(&self, envelope: Envelope) -> bool {
        let mut state = self.lock();
        if let Some(inbox) = state.online.get(&envelope.to_id) {
            if inbox.receiver_count() > 0 && inbox.send(envelope.clone()).is_ok() {
                return true;
            }
        }
        state
            .offline
            .entry(envelope.to_id.clone())
            .or_default()
            .push(envelope);
        false
    }

    fn register(&self, peer_id: &str, inbox: broadcast::Sender<Envelope>) {
        self.lock().online.insert(peer_id.to_string(), inbox);
    }

    fn unregister(&self, peer_id: &str) {
        self.lock().online.remove(peer_id);
    }

    /// Hand queued envelopes to a peer that is online and listening.
    fn drain(&self, peer_id: &str) -> usize {
        let mut state = self.lock();
        let inbox = match state.online.get(peer_id) {
            Some(inbox) if inbox.receiver_count() > 0 => inbox.clone(),
            _ => return 0,
        };
        let queued = state.offline.remove(peer_id).unwrap_or_default();
        let delivered = queued.len();
        for envelope in queued {
            let _ = inbox.send(envelope);
        }
        delivered
    }
}

/// Transport that delivers through an [`InMemoryBroker`].
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    local_id: Mutex<Option<String>>,
    inbox: broadcast::Sender<Envelope>,
    receipts: broadcast::Sender<DeliveryReceipt>,
    state_tx: watch::Sender<ConnectionState>,
}

impl InMemoryTransport {
    pub fn new(broker: InMemoryBroker) -> Self {
        let (inbox, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (receipts, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            local_id: Mutex::new(None),
            inbox,
            receipts,
            state_tx,
        }
    }

    pub fn local_id(&self) -> Option<String> {
        self.local_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, local_id: &str) -> Result<()> {
        *self.local_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_id.to_string());
        self.broker.register(local_id, self.inbox.clone());
        self.state_tx.send_replace(ConnectionState::Connected);

        let delivered = self.broker.drain(local_id);
        log::debug!("{} connected, {} queued envelopes delivered", local_id, delivered);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(id) = self
            .local_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.broker.unregister(&id);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    async fn send(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        if self.state() != ConnectionState::Connected || self.local_id().is_none() {
            return Err(TransportError::NotConnected);
        }

        let message_id = envelope.id.clone();
        if self.broker.route(envelope) {
            let _ = self
                .receipts
                .send(DeliveryReceipt::new(message_id.clone(), ReceiptStatus::Delivered));
        }

        Ok(DeliveryReceipt::new(message_id, ReceiptStatus::Accepted))
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        let rx = self.inbox.subscribe();
        if let Some(id) = self.local_id() {
            self.broker.drain(&id);
        }
        rx
    }

    fn subscribe_receipts(&self) -> broadcast::Receiver<DeliveryReceipt> {
        self.receipts.subscribe()
    }

    async fn register_address(&self, peer_id: &str, address: &str) -> Result<()> {
        self.broker
            .lock()
            .addresses
            .insert(peer_id.to_string(), address.to_string());
        Ok(())
    }

    async fn resolve_address(&self, peer_id: &str) -> Result<Option<String>> {
        Ok(self.broker.lock().addresses.get(peer_id).cloned())
    }

    fn state_notifications(&self) -> StateNotifications {
        StateNotifications::Supported(self.state_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_send_requires_connect() {
        let transport = InMemoryTransport::new(InMemoryBroker::new());
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        let result = transport
            .send(Envelope::new(MessageType::Ack, "alice", "bob", ""))
            .await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_delivers_to_online_peer_with_receipt() {
        let broker = InMemoryBroker::new();
        let alice = InMemoryTransport::new(broker.clone());
        let bob = InMemoryTransport::new(broker.clone());
        alice.connect("alice").await.unwrap();
        bob.connect("bob").await.unwrap();

        let mut inbox = bob.subscribe();
        let mut receipts = alice.subscribe_receipts();

        let env = Envelope::new(MessageType::Attestation, "alice", "bob", "{}");
        let receipt = alice.send(env.clone()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Accepted);

        assert_eq!(inbox.recv().await.unwrap(), env);
        let delivered = receipts.recv().await.unwrap();
        assert_eq!(delivered.message_id, env.id);
        assert_eq!(delivered.status, ReceiptStatus::Delivered);
    }

    #[tokio::test]
    async fn test_queues_for_offline_peer() {
        let broker = InMemoryBroker::new();
        let alice = InMemoryTransport::new(broker.clone());
        alice.connect("alice").await.unwrap();

        let env = Envelope::new(MessageType::ContactRequest, "alice", "bob", "{}");
        alice.send(env.clone()).await.unwrap();
        assert_eq!(broker.queued_for("bob"), 1);

        let bob = InMemoryTransport::new(broker.clone());
        let mut inbox = bob.subscribe();
        bob.connect("bob").await.unwrap();

        assert_eq!(inbox.recv().await.unwrap().id, env.id);
        assert_eq!(broker.queued_for("bob"), 0);
    }

    #[tokio::test]
    async fn test_holds_envelopes_until_someone_listens() {
        let broker = InMemoryBroker::new();
        let alice = InMemoryTransport::new(broker.clone());
        let bob = InMemoryTransport::new(broker.clone());
        alice.connect("alice").await.unwrap();
        bob.connect("bob").await.unwrap();

        alice
            .send(Envelope::new(MessageType::Ack, "alice", "bob", ""))
            .await
            .unwrap();
        assert_eq!(broker.queued_for("bob"), 1);

        let mut inbox = bob.subscribe();
        assert!(inbox.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_brokers_are_isolated() {
        let a = InMemoryTransport::new(InMemoryBroker::new());
        let b = InMemoryTransport::new(InMemoryBroker::new());
        a.register_address("bob", "relay://1").await.unwrap();

        assert_eq!(
            a.resolve_address("bob").await.unwrap(),
            Some("relay://1".to_string())
        );
        assert_eq!(b.resolve_address("bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_notifications() {
        let transport = InMemoryTransport::new(InMemoryBroker::new());
        let rx = match transport.state_notifications() {
            StateNotifications::Supported(rx) => rx,
            StateNotifications::Unsupported => panic!("in-memory transport reports state"),
        };

        transport.connect("alice").await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
        transport.disconnect().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
    }
}
