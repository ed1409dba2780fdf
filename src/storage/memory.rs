use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use super::{sort_fifo, PendingEntry, PendingStore, Result, StorageError};
use crate::protocol::Envelope;

/// In-memory outbox. Entries are sharded by envelope id so unrelated
/// enqueues never contend on one lock.
pub struct InMemoryPendingStore {
    entries: DashMap<String, PendingEntry>,
    next_sequence: AtomicU64,
    count_tx: watch::Sender<usize>,
}

impl Default for InMemoryPendingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            entries: DashMap::new(),
            next_sequence: AtomicU64::new(0),
            count_tx,
        }
    }

    fn publish_count(&self) {
        self.count_tx.send_replace(self.entries.len());
    }
}

impl PendingStore for InMemoryPendingStore {
    fn enqueue(&self, envelope: &Envelope) -> Result<()> {
        match self.entries.entry(envelope.id.clone()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => {
                let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
                slot.insert(PendingEntry::new(envelope.clone(), sequence));
            }
        }
        log::debug!("Outbox: queued {} ({})", envelope.id, envelope.message_type.as_str());
        self.publish_count();
        Ok(())
    }

    fn dequeue(&self, envelope_id: &str) -> Result<()> {
        if self.entries.remove(envelope_id).is_some() {
            self.publish_count();
        }
        Ok(())
    }

    fn pending(&self) -> Result<Vec<PendingEntry>> {
        let mut entries: Vec<PendingEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        sort_fifo(&mut entries);
        Ok(entries)
    }

    fn has(&self, envelope_id: &str) -> Result<bool> {
        Ok(self.entries.contains_key(envelope_id))
    }

    fn increment_retry(&self, envelope_id: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(envelope_id)
            .ok_or_else(|| StorageError::NotFound(envelope_id.to_string()))?;
        entry.retry_count = entry.retry_count.saturating_add(1);
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.entries.len())
    }

    fn watch_count(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn envelope(id: &str) -> Envelope {
        Envelope::new(MessageType::Attestation, "alice", "bob", "{}").with_id(id)
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let store = InMemoryPendingStore::new();
        store.enqueue(&envelope("m1")).unwrap();
        store.increment_retry("m1").unwrap();
        store.enqueue(&envelope("m1")).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.pending().unwrap()[0].retry_count, 1);
    }

    #[test]
    fn test_fifo_order() {
        let store = InMemoryPendingStore::new();
        for id in ["a", "b", "c", "d"] {
            store.enqueue(&envelope(id)).unwrap();
        }

        let ids: Vec<String> = store
            .pending()
            .unwrap()
            .into_iter()
            .map(|e| e.envelope.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_dequeue_and_has() {
        let store = InMemoryPendingStore::new();
        store.enqueue(&envelope("m1")).unwrap();
        assert!(store.has("m1").unwrap());

        store.dequeue("m1").unwrap();
        assert!(!store.has("m1").unwrap());

        // absent id is a no-op
        store.dequeue("m1").unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_increment_retry_unknown_id() {
        let store = InMemoryPendingStore::new();
        assert!(matches!(
            store.increment_retry("nope"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_watch_count() {
        let store = InMemoryPendingStore::new();
        let rx = store.watch_count();
        assert_eq!(*rx.borrow(), 0);

        store.enqueue(&envelope("m1")).unwrap();
        store.enqueue(&envelope("m2")).unwrap();
        assert_eq!(*rx.borrow(), 2);

        store.dequeue("m1").unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
