use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use super::{sort_fifo, PendingEntry, PendingStore, Result, StorageError};
use crate::protocol::Envelope;

struct FileState {
    entries: BTreeMap<String, PendingEntry>,
    next_sequence: u64,
}

/// Outbox persisted as a JSON array of [`PendingEntry`] values.
///
/// Every mutation rewrites the file through a temporary sibling and an atomic
/// rename, so a crash mid-write leaves the previous snapshot intact.
pub struct FilePendingStore {
    path: PathBuf,
    state: Mutex<FileState>,
    count_tx: watch::Sender<usize>,
}

impl FilePendingStore {
    /// Open (or create) the outbox file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let loaded: Vec<PendingEntry> = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let next_sequence = loaded.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
        let entries: BTreeMap<String, PendingEntry> = loaded
            .into_iter()
            .map(|e| (e.envelope.id.clone(), e))
            .collect();

        log::info!(
            "Outbox file {} opened with {} pending entries",
            path.display(),
            entries.len()
        );

        let (count_tx, _) = watch::channel(entries.len());
        Ok(Self {
            path,
            state: Mutex::new(FileState {
                entries,
                next_sequence,
            }),
            count_tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &FileState) -> Result<()> {
        let mut entries: Vec<PendingEntry> = state.entries.values().cloned().collect();
        sort_fifo(&mut entries);
        let bytes = serde_json::to_vec_pretty(&entries)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;

        self.count_tx.send_replace(state.entries.len());
        Ok(())
    }
}

impl PendingStore for FilePendingStore {
    fn enqueue(&self, envelope: &Envelope) -> Result<()> {
        let mut state = self.lock();
        if state.entries.contains_key(&envelope.id) {
            return Ok(());
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .entries
            .insert(envelope.id.clone(), PendingEntry::new(envelope.clone(), sequence));
        self.persist(&state)
    }

    fn dequeue(&self, envelope_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.entries.remove(envelope_id).is_none() {
            return Ok(());
        }
        self.persist(&state)
    }

    fn pending(&self) -> Result<Vec<PendingEntry>> {
        let state = self.lock();
        let mut entries: Vec<PendingEntry> = state.entries.values().cloned().collect();
        sort_fifo(&mut entries);
        Ok(entries)
    }

    fn has(&self, envelope_id: &str) -> Result<bool> {
        Ok(self.lock().entries.contains_key(envelope_id))
    }

    fn increment_retry(&self, envelope_id: &str) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(envelope_id)
            .ok_or_else(|| StorageError::NotFound(envelope_id.to_string()))?;
        entry.retry_count = entry.retry_count.saturating_add(1);
        self.persist(&state)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.lock().entries.len())
    }

    fn watch_count(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }
}
