use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{EngineInner, ReplicationError, Result};
use crate::crdt::{DocMut, JsonDoc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    Personal,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub id: String,
    pub kind: SpaceKind,
    /// Member peer ids, creator first. Never holds duplicates.
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl SpaceInfo {
    pub fn is_member(&self, peer_id: &str) -> bool {
        self.members.iter().any(|m| m == peer_id)
    }
}

/// Notification that a remote change was decrypted and merged.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUpdate {
    pub space_id: String,
    pub from_id: String,
    pub generation: u32,
    /// Document state right after the merge.
    pub snapshot: serde_json::Value,
}

/// Everything the engine keeps per space. Guarded by one mutex per space.
pub(crate) struct SpaceEntry {
    pub info: SpaceInfo,
    pub doc: JsonDoc,
    /// Public keys of members, used to (re)distribute group keys.
    pub member_keys: BTreeMap<String, Vec<u8>>,
}

impl SpaceEntry {
    pub fn add_member(&mut self, peer_id: &str) -> bool {
        if self.info.is_member(peer_id) {
            return false;
        }
        self.info.members.push(peer_id.to_string());
        true
    }

    pub fn remove_member(&mut self, peer_id: &str) -> bool {
        let before = self.info.members.len();
        self.info.members.retain(|m| m != peer_id);
        self.member_keys.remove(peer_id);
        self.info.members.len() != before
    }

    /// Fold in the member list of an accepted invite. A rotated generation
    /// carries the complete list; the same generation can only add members.
    pub fn merge_members(&mut self, members: &[String], rotated: bool, local_id: &str) {
        if rotated {
            self.replace_members(members);
            self.add_member(local_id);
            let info = &self.info;
            self.member_keys.retain(|member, _| info.is_member(member));
        } else {
            for member in members {
                self.add_member(member);
            }
        }
    }

    /// Record public keys, but only for current members.
    pub fn merge_member_keys(&mut self, keys: BTreeMap<String, Vec<u8>>) {
        for (member, key) in keys {
            if self.info.is_member(&member) {
                self.member_keys.insert(member, key);
            }
        }
    }

    /// Replace the member list, preserving order and dropping duplicates.
    pub fn replace_members(&mut self, members: &[String]) {
        let mut unique: Vec<String> = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(member) {
                unique.push(member.clone());
            }
        }
        self.info.members = unique;
    }
}

pub(crate) type SharedEntry = Arc<Mutex<SpaceEntry>>;

pub(crate) fn lock_entry(entry: &SharedEntry) -> MutexGuard<'_, SpaceEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live view of one space.
///
/// Closing (or dropping) the handle stops its update callbacks; the
/// document itself stays with the engine.
pub struct SpaceHandle {
    space_id: String,
    entry: SharedEntry,
    engine: Arc<EngineInner>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SpaceHandle {
    pub(crate) fn new(space_id: String, entry: SharedEntry, engine: Arc<EngineInner>) -> Self {
        Self {
            space_id,
            entry,
            engine,
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    /// Snapshot of the merged document.
    pub fn get_doc(&self) -> serde_json::Value {
        lock_entry(&self.entry).doc.snapshot().clone()
    }

    pub fn get_doc_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(lock_entry(&self.entry).doc.get_as()?)
    }

    pub fn info(&self) -> SpaceInfo {
        lock_entry(&self.entry).info.clone()
    }

    /// Apply `edit` locally, then encrypt the diff under the space's current
    /// key and send it to every other member.
    ///
    /// The local commit is atomic and serialized with other transactions on
    /// this space. Delivery is best effort per member: an unreachable member
    /// does not fail the call.
    pub async fn transact<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut DocMut) -> crate::crdt::ops::Result<()>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicationError::HandleClosed(self.space_id.clone()));
        }

        let (diff, recipients) = {
            let mut entry = lock_entry(&self.entry);
            let diff = entry.doc.transact(edit)?;
            let recipients: Vec<String> = entry
                .info
                .members
                .iter()
                .filter(|m| **m != self.engine.local_id)
                .cloned()
                .collect();
            (diff, recipients)
        };

        match diff {
            Some(diff) => {
                self.engine
                    .broadcast_change(&self.space_id, &diff, recipients)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Run `callback` after every remote change merged into this space.
    pub fn on_remote_update<F>(&self, callback: F)
    where
        F: Fn(&RemoteUpdate) + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut rx = self.engine.updates.subscribe();
        let space_id = self.space_id.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) if update.space_id == space_id => callback(&update),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Space {} listener lagged, {} updates skipped", space_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Stop all update callbacks. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        log::debug!("Space handle {} closed", self.space_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SpaceHandle {
    fn drop(&mut self) {
        self.close();
    }
}
