//! Replication engine: encrypted, membership-aware sync of CRDT spaces.
//!
//! Flow for a local edit:
//! 1. [`SpaceHandle::transact`] commits the edit to the local [`JsonDoc`]
//!    and takes the resulting diff.
//! 2. The diff is sealed with the space's current group key
//!    ([`encrypt_change`]) and one `content` envelope per other member is
//!    sent concurrently.
//! 3. A receiving engine looks up the key for the stated generation,
//!    decrypts, merges, and notifies `on_remote_update` listeners.
//!
//! Membership: `add_member` seals the current group key to the invitee
//! (`space-invite`) and follows it with the full document state.
//! `remove_member` rotates the key and hands the new generation only to the
//! remaining members. Removed members keep what they already hold but cannot
//! read anything written afterwards.
//!
//! Content that arrives before the key it needs is parked (bounded LRU per
//! space) and replayed when an invite installs the key.

pub mod messages;
pub mod space;

use chrono::Utc;
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ReplicationConfig;
use crate::crdt::{DocError, JsonDoc, ReplicaId};
use crate::crypto::{
    decrypt_change, encrypt_change, fingerprint, CodecError, EncryptedChange, GroupKey,
    GroupKeyRegistry, KeyError, RecipientCipher, SealError,
};
use crate::protocol::{Envelope, MessageType, ReceiptStatus, ResourceRef};
use crate::transport::{Transport, TransportError, CHANNEL_CAPACITY};

pub use messages::{InvitePayload, MemberAction, MemberChange};
pub use space::{RemoteUpdate, SpaceHandle, SpaceInfo, SpaceKind};

use messages::encode_member_keys;
use space::{lock_entry, SharedEntry, SpaceEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Space not found: {0}")]
    SpaceNotFound(String),

    #[error("No usable group key for space {0}")]
    NoKey(String),

    #[error("{member} is not a member of space {space_id}")]
    NotAMember { space_id: String, member: String },

    #[error("Invalid member: {0}")]
    InvalidMember(String),

    #[error("Space handle {0} is closed")]
    HandleClosed(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Document error: {0}")]
    Doc(#[from] DocError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Seal error: {0}")]
    Seal(#[from] SealError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    /// Fanning out a local change. Informational only.
    Syncing,
    /// The transport's incoming stream closed.
    Error,
}

/// What [`ReplicationEngine::receive`] did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Change decrypted and merged; the count of new ops.
    Merged(usize),
    /// Change held until its space or key generation is known.
    Parked,
    /// Invite registered a new space.
    Joined,
    /// Invite installed a key for a space already known.
    KeyInstalled,
    /// Not addressed to us, or not a replication message.
    Ignored,
    /// Failed authentication or parsing; local state untouched.
    Dropped,
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

pub(crate) struct EngineInner {
    pub(crate) local_id: String,
    identity: Arc<dyn RecipientCipher>,
    transport: Arc<dyn Transport>,
    keys: Arc<GroupKeyRegistry>,
    spaces: DashMap<String, SharedEntry>,
    pub(crate) updates: broadcast::Sender<RemoteUpdate>,
    member_changes: broadcast::Sender<MemberChange>,
    parked: Mutex<LruCache<String, VecDeque<EncryptedChange>>>,
    parked_per_space: usize,
    state_tx: watch::Sender<EngineState>,
}

impl EngineInner {
    fn entry(&self, space_id: &str) -> Option<SharedEntry> {
        self.spaces.get(space_id).map(|e| Arc::clone(e.value()))
    }

    fn parked(&self) -> MutexGuard<'_, LruCache<String, VecDeque<EncryptedChange>>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn envelope(&self, message_type: MessageType, to: &str, payload: String, space_id: &str) -> Envelope {
        Envelope::new(message_type, self.local_id.as_str(), to, payload)
            .with_resource_ref(ResourceRef::space(space_id))
    }

    fn notify_member(&self, space_id: &str, member_id: &str, action: MemberAction) {
        let _ = self.member_changes.send(MemberChange {
            space_id: space_id.to_string(),
            member_id: member_id.to_string(),
            action,
        });
    }

    /// Seal `key` to one member and wrap it in a `space-invite` envelope.
    fn invite_envelope(
        &self,
        info: &SpaceInfo,
        member_keys: &BTreeMap<String, Vec<u8>>,
        generation: u32,
        key: &GroupKey,
        member_id: &str,
        member_public_key: &[u8],
    ) -> Result<Envelope> {
        let sealed = self
            .identity
            .encrypt_for_recipient(key.as_bytes(), member_public_key)?;
        let payload = InvitePayload {
            space_id: info.id.clone(),
            generation,
            encrypted_group_key: sealed,
            kind: Some(info.kind),
            members: Some(info.members.clone()),
            member_keys: encode_member_keys(member_keys),
        };
        Ok(self.envelope(
            MessageType::SpaceInvite,
            member_id,
            payload.to_json()?,
            &info.id,
        ))
    }

    /// Send every envelope concurrently. Returns the number that failed.
    async fn send_all(&self, envelopes: Vec<Envelope>) -> usize {
        let mut sends = JoinSet::new();
        for envelope in envelopes {
            let transport = Arc::clone(&self.transport);
            sends.spawn(async move {
                let to = envelope.to_id.clone();
                (to, transport.send(envelope).await)
            });
        }

        let mut failed = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(receipt))) if receipt.status != ReceiptStatus::Failed => {}
                Ok((to, Ok(receipt))) => {
                    log::warn!("Send to {} failed: {:?}", to, receipt.reason);
                    failed += 1;
                }
                Ok((to, Err(e))) => {
                    log::warn!("Send to {} failed: {}", to, e);
                    failed += 1;
                }
                Err(e) => {
                    log::warn!("Send task failed: {}", e);
                    failed += 1;
                }
            }
        }
        failed
    }

    pub(crate) async fn broadcast_change(
        &self,
        space_id: &str,
        diff: &[u8],
        recipients: Vec<String>,
    ) -> Result<()> {
        if recipients.is_empty() {
            return Ok(());
        }

        let (generation, key) = self
            .keys
            .current(space_id)
            .ok_or_else(|| ReplicationError::NoKey(space_id.to_string()))?;
        let payload = encrypt_change(diff, &key, space_id, generation, &self.local_id)?.to_json()?;

        let envelopes: Vec<Envelope> = recipients
            .iter()
            .map(|member| self.envelope(MessageType::Content, member, payload.clone(), space_id))
            .collect();

        let was_running = *self.state_tx.borrow() == EngineState::Running;
        if was_running {
            self.state_tx.send_replace(EngineState::Syncing);
        }
        let failed = self.send_all(envelopes).await;
        if was_running {
            self.state_tx.send_replace(EngineState::Running);
        }

        log::debug!(
            "Change for space {} (gen {}) sent to {} members, {} failed",
            fingerprint(space_id.as_bytes()),
            generation,
            recipients.len(),
            failed
        );
        Ok(())
    }

    fn park(&self, change: EncryptedChange) -> Received {
        let mut parked = self.parked();
        let space_id = change.space_id.clone();
        match parked.get_mut(&space_id) {
            Some(queue) => {
                queue.push_back(change);
                while queue.len() > self.parked_per_space {
                    queue.pop_front();
                }
            }
            None => {
                let mut queue = VecDeque::new();
                queue.push_back(change);
                parked.put(space_id.clone(), queue);
            }
        }
        log::debug!(
            "Change for space {} parked until its key arrives",
            fingerprint(space_id.as_bytes())
        );
        Received::Parked
    }

    fn take_parked(&self, space_id: &str) -> VecDeque<EncryptedChange> {
        self.parked().pop(space_id).unwrap_or_default()
    }

    fn handle_content(&self, change: EncryptedChange) -> Received {
        let entry = match self.entry(&change.space_id) {
            Some(entry) => entry,
            None => return self.park(change),
        };
        if !lock_entry(&entry).info.is_member(&change.from_id) {
            return self.park(change);
        }
        let key = match self.keys.key_by_generation(&change.space_id, change.generation) {
            Some(key) => key,
            None => return self.park(change),
        };

        let diff = match decrypt_change(&change, &key) {
            Ok(diff) => diff,
            Err(e) => {
                log::warn!(
                    "Dropping change from {} for space {} (gen {}): {}",
                    change.from_id,
                    fingerprint(change.space_id.as_bytes()),
                    change.generation,
                    e
                );
                return Received::Dropped;
            }
        };

        let (applied, snapshot) = {
            let mut entry = lock_entry(&entry);
            match entry.doc.merge(&diff) {
                Ok(applied) => (applied, entry.doc.snapshot().clone()),
                Err(e) => {
                    log::warn!("Dropping undecodable change from {}: {}", change.from_id, e);
                    return Received::Dropped;
                }
            }
        };

        if applied > 0 {
            let _ = self.updates.send(RemoteUpdate {
                space_id: change.space_id,
                from_id: change.from_id,
                generation: change.generation,
                snapshot,
            });
        }
        Received::Merged(applied)
    }

    fn handle_invite(&self, from_id: &str, invite: &InvitePayload) -> Result<Received> {
        let raw = self.identity.decrypt_for_me(&invite.encrypted_group_key)?;
        let key = GroupKey::from_slice(&raw)?;

        let received = match self.entry(&invite.space_id) {
            Some(entry) => self.refresh_space(&entry, from_id, invite, key)?,
            None => self.join_space(from_id, invite, key)?,
        };

        for change in self.take_parked(&invite.space_id) {
            self.handle_content(change);
        }
        Ok(received)
    }

    /// Invite for a space we already hold. Only current members may send
    /// one, and only a generation at least as new as ours touches membership.
    fn refresh_space(
        &self,
        entry: &SharedEntry,
        from_id: &str,
        invite: &InvitePayload,
        key: GroupKey,
    ) -> Result<Received> {
        let mut entry = lock_entry(entry);
        if !entry.info.is_member(from_id) {
            return Err(ReplicationError::NotAMember {
                space_id: invite.space_id.clone(),
                member: from_id.to_string(),
            });
        }

        let current = self.keys.current_generation(&invite.space_id);
        self.keys
            .import_key(&invite.space_id, key, invite.generation)?;

        match current {
            Some(current) if invite.generation < current => {
                log::debug!(
                    "Stale invite from {} (gen {} < {}); membership unchanged",
                    from_id,
                    invite.generation,
                    current
                );
            }
            current => {
                let rotated = current.map_or(true, |c| invite.generation > c);
                if let Some(members) = &invite.members {
                    entry.merge_members(members, rotated, &self.local_id);
                }
                entry.merge_member_keys(invite.decoded_member_keys());
            }
        }
        log::info!(
            "Key gen {} installed for space {}",
            invite.generation,
            fingerprint(invite.space_id.as_bytes())
        );
        Ok(Received::KeyInstalled)
    }

    fn join_space(&self, from_id: &str, invite: &InvitePayload, key: GroupKey) -> Result<Received> {
        self.keys
            .import_key(&invite.space_id, key, invite.generation)?;

        let mut joined = false;
        self.spaces
            .entry(invite.space_id.clone())
            .or_insert_with(|| {
                joined = true;
                let members = invite
                    .members
                    .clone()
                    .unwrap_or_else(|| vec![from_id.to_string()]);
                let mut entry = SpaceEntry {
                    info: SpaceInfo {
                        id: invite.space_id.clone(),
                        kind: invite.kind.unwrap_or(SpaceKind::Shared),
                        members: Vec::new(),
                        created_at: Utc::now(),
                    },
                    doc: JsonDoc::empty(ReplicaId::random()),
                    member_keys: BTreeMap::new(),
                };
                entry.replace_members(&members);
                entry.add_member(&self.local_id);
                entry.merge_member_keys(invite.decoded_member_keys());
                Arc::new(Mutex::new(entry))
            });

        if !joined {
            return Ok(Received::KeyInstalled);
        }
        log::info!(
            "Joined space {} at gen {} (invited by {})",
            fingerprint(invite.space_id.as_bytes()),
            invite.generation,
            from_id
        );
        self.notify_member(&invite.space_id, &self.local_id, MemberAction::Added);
        Ok(Received::Joined)
    }

    fn receive(&self, envelope: &Envelope) -> Received {
        if envelope.to_id != self.local_id {
            log::debug!("Ignoring envelope {} addressed to {}", envelope.id, envelope.to_id);
            return Received::Ignored;
        }

        match envelope.message_type {
            MessageType::Content => match EncryptedChange::from_json(&envelope.payload) {
                Ok(change) if change.from_id != envelope.from_id => {
                    log::warn!(
                        "Dropping change {}: sender {} claims to be {}",
                        envelope.id,
                        envelope.from_id,
                        change.from_id
                    );
                    Received::Dropped
                }
                Ok(change) => self.handle_content(change),
                Err(e) => {
                    log::warn!("Dropping malformed content {}: {}", envelope.id, e);
                    Received::Dropped
                }
            },
            MessageType::SpaceInvite => {
                match InvitePayload::from_json(&envelope.payload)
                    .and_then(|invite| self.handle_invite(&envelope.from_id, &invite))
                {
                    Ok(received) => received,
                    Err(e) => {
                        log::warn!("Dropping invite {} from {}: {}", envelope.id, envelope.from_id, e);
                        Received::Dropped
                    }
                }
            }
            _ => Received::Ignored,
        }
    }
}

// ---------------------------------------------------------------------------
// ReplicationEngine
// ---------------------------------------------------------------------------

/// One peer's replication engine: `Idle` until [`start`](Self::start),
/// `Running` until [`stop`](Self::stop).
pub struct ReplicationEngine {
    inner: Arc<EngineInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationEngine {
    pub fn new(
        local_id: impl Into<String>,
        identity: Arc<dyn RecipientCipher>,
        transport: Arc<dyn Transport>,
        keys: Arc<GroupKeyRegistry>,
        config: &ReplicationConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (member_changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(EngineState::Idle);
        let capacity = NonZeroUsize::new(config.parked_spaces).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(EngineInner {
                local_id: local_id.into(),
                identity,
                transport,
                keys,
                spaces: DashMap::new(),
                updates,
                member_changes,
                parked: Mutex::new(LruCache::new(capacity)),
                parked_per_space: config.parked_changes_per_space.max(1),
                state_tx,
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the transport and process incoming envelopes.
    ///
    /// Must be called from within a Tokio runtime. Calling it again restarts
    /// the listener.
    pub fn start(&self) {
        let mut rx = self.inner.transport.subscribe();
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => match engine.upgrade() {
                        Some(inner) => {
                            inner.receive(&envelope);
                        }
                        None => break,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Replication listener lagged, {} envelopes skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        if let Some(inner) = engine.upgrade() {
                            inner.state_tx.send_replace(EngineState::Error);
                        }
                        log::error!("Transport stream closed, replication listener stopped");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.listener().replace(task) {
            previous.abort();
        }
        self.inner.state_tx.send_replace(EngineState::Running);
        log::info!("Replication engine started for {}", self.inner.local_id);
    }

    pub fn stop(&self) {
        if let Some(task) = self.listener().take() {
            task.abort();
        }
        self.inner.state_tx.send_replace(EngineState::Idle);
        log::info!("Replication engine stopped for {}", self.inner.local_id);
    }

    /// Process one incoming envelope. The listener started by
    /// [`start`](Self::start) calls this for every envelope it receives.
    pub fn receive(&self, envelope: &Envelope) -> Received {
        self.inner.receive(envelope)
    }

    /// Create a space seeded with `initial` (a JSON object), with this peer
    /// as the only member and a fresh generation-0 key.
    pub fn create_space(&self, kind: SpaceKind, initial: &serde_json::Value) -> Result<SpaceInfo> {
        let doc = JsonDoc::new(ReplicaId::random(), initial)?;
        let id = uuid::Uuid::new_v4().to_string();
        let info = SpaceInfo {
            id: id.clone(),
            kind,
            members: vec![self.inner.local_id.clone()],
            created_at: Utc::now(),
        };

        let mut member_keys = BTreeMap::new();
        member_keys.insert(self.inner.local_id.clone(), self.inner.identity.public_key());

        self.inner.keys.create_key(&id);
        self.inner.spaces.insert(
            id.clone(),
            Arc::new(Mutex::new(SpaceEntry {
                info: info.clone(),
                doc,
                member_keys,
            })),
        );

        log::info!("Space {} created ({:?})", fingerprint(id.as_bytes()), kind);
        Ok(info)
    }

    /// All known spaces, oldest first.
    pub fn get_spaces(&self) -> Vec<SpaceInfo> {
        let entries: Vec<SharedEntry> = self.inner.spaces.iter().map(|e| Arc::clone(e.value())).collect();
        let mut spaces: Vec<SpaceInfo> = entries.iter().map(|e| lock_entry(e).info.clone()).collect();
        spaces.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        spaces
    }

    pub fn get_space(&self, space_id: &str) -> Option<SpaceInfo> {
        let entry = self.inner.entry(space_id)?;
        let info = lock_entry(&entry).info.clone();
        Some(info)
    }

    pub fn open_space(&self, space_id: &str) -> Result<SpaceHandle> {
        let entry = self
            .inner
            .entry(space_id)
            .ok_or_else(|| ReplicationError::SpaceNotFound(space_id.to_string()))?;
        Ok(SpaceHandle::new(
            space_id.to_string(),
            entry,
            Arc::clone(&self.inner),
        ))
    }

    /// Current key generation of a space, `None` if unknown.
    pub fn key_generation(&self, space_id: &str) -> Option<u32> {
        self.inner.keys.current_generation(space_id)
    }

    pub fn subscribe_member_changes(&self) -> broadcast::Receiver<MemberChange> {
        self.inner.member_changes.subscribe()
    }

    /// Add a member and give them the current key plus the full document.
    ///
    /// Existing members whose public keys are known receive a refreshed
    /// invite carrying the new member list.
    pub async fn add_member(
        &self,
        space_id: &str,
        member_id: &str,
        member_public_key: &[u8],
    ) -> Result<()> {
        if member_id == self.inner.local_id {
            return Err(ReplicationError::InvalidMember(member_id.to_string()));
        }
        let entry = self
            .inner
            .entry(space_id)
            .ok_or_else(|| ReplicationError::SpaceNotFound(space_id.to_string()))?;
        let (generation, key) = self
            .inner
            .keys
            .current(space_id)
            .ok_or_else(|| ReplicationError::NoKey(space_id.to_string()))?;

        let (info, member_keys, full_state, added, previous_key) = {
            let mut entry = lock_entry(&entry);
            let full_state = entry.doc.save()?;
            let added = entry.add_member(member_id);
            let previous_key = entry
                .member_keys
                .insert(member_id.to_string(), member_public_key.to_vec());
            (
                entry.info.clone(),
                entry.member_keys.clone(),
                full_state,
                added,
                previous_key,
            )
        };

        let sent = match self.inner.invite_envelope(
            &info,
            &member_keys,
            generation,
            &key,
            member_id,
            member_public_key,
        ) {
            Ok(invite) => self.inner.transport.send(invite).await.map_err(ReplicationError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            let mut entry = lock_entry(&entry);
            if added {
                entry.remove_member(member_id);
            } else if let Some(previous) = previous_key {
                entry.member_keys.insert(member_id.to_string(), previous);
            }
            log::warn!(
                "Invite to {} for space {} failed; membership unchanged: {}",
                member_id,
                fingerprint(space_id.as_bytes()),
                e
            );
            return Err(e);
        }

        let bootstrap = encrypt_change(&full_state, &key, space_id, generation, &self.inner.local_id)?;
        let content = self.inner.envelope(
            MessageType::Content,
            member_id,
            bootstrap.to_json()?,
            space_id,
        );
        self.inner.transport.send(content).await?;

        let mut refreshes = Vec::new();
        for member in &info.members {
            if *member == self.inner.local_id || member == member_id {
                continue;
            }
            if let Some(public_key) = member_keys.get(member) {
                refreshes.push(self.inner.invite_envelope(
                    &info,
                    &member_keys,
                    generation,
                    &key,
                    member,
                    public_key,
                )?);
            }
        }
        self.inner.send_all(refreshes).await;

        if added {
            self.inner
                .notify_member(space_id, member_id, MemberAction::Added);
        }
        log::info!(
            "Member {} added to space {} (gen {})",
            member_id,
            fingerprint(space_id.as_bytes()),
            generation
        );
        Ok(())
    }

    /// Remove a member and rotate the space key.
    ///
    /// Only the remaining members receive the new generation. The removed
    /// member can still read content under generations they already hold.
    pub async fn remove_member(&self, space_id: &str, member_id: &str) -> Result<()> {
        if member_id == self.inner.local_id {
            return Err(ReplicationError::InvalidMember(member_id.to_string()));
        }
        let entry = self
            .inner
            .entry(space_id)
            .ok_or_else(|| ReplicationError::SpaceNotFound(space_id.to_string()))?;

        let (info, member_keys) = {
            let mut entry = lock_entry(&entry);
            if !entry.remove_member(member_id) {
                return Err(ReplicationError::NotAMember {
                    space_id: space_id.to_string(),
                    member: member_id.to_string(),
                });
            }
            (entry.info.clone(), entry.member_keys.clone())
        };

        let (generation, key) = self.inner.keys.rotate_key(space_id)?;

        let mut invites = Vec::new();
        for member in &info.members {
            if *member == self.inner.local_id {
                continue;
            }
            match member_keys.get(member) {
                Some(public_key) => invites.push(self.inner.invite_envelope(
                    &info,
                    &member_keys,
                    generation,
                    &key,
                    member,
                    public_key,
                )?),
                None => log::warn!(
                    "No public key for {}; gen {} of space {} not delivered",
                    member,
                    generation,
                    fingerprint(space_id.as_bytes())
                ),
            }
        }
        let failed = self.inner.send_all(invites).await;

        self.inner
            .notify_member(space_id, member_id, MemberAction::Removed);
        log::info!(
            "Member {} removed from space {}; rotated to gen {} ({} deliveries failed)",
            member_id,
            fingerprint(space_id.as_bytes()),
            generation,
            failed
        );
        Ok(())
    }
}

impl Drop for ReplicationEngine {
    fn drop(&mut self) {
        if let Some(task) = self.listener().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboxConfig;
    use crate::crypto::X25519Identity;
    use crate::storage::{InMemoryPendingStore, PendingStore};
    use crate::test_support::eventually;
    use crate::transport::{InMemoryBroker, InMemoryTransport, OutboxTransport};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Peer {
        id: String,
        identity: Arc<X25519Identity>,
        keys: Arc<GroupKeyRegistry>,
        transport: Arc<InMemoryTransport>,
        engine: ReplicationEngine,
    }

    impl Peer {
        fn public_key(&self) -> Vec<u8> {
            self.identity.public_key()
        }

        fn doc(&self, space_id: &str) -> Option<Value> {
            self.engine.open_space(space_id).ok().map(|h| h.get_doc())
        }
    }

    fn engine_for(
        id: &str,
        transport: Arc<dyn Transport>,
    ) -> (Arc<X25519Identity>, Arc<GroupKeyRegistry>, ReplicationEngine) {
        let identity = Arc::new(X25519Identity::generate());
        let keys = Arc::new(GroupKeyRegistry::new());
        let engine = ReplicationEngine::new(
            id,
            identity.clone(),
            transport,
            keys.clone(),
            &ReplicationConfig::default(),
        );
        (identity, keys, engine)
    }

    /// Connected peer whose engine is not started yet.
    async fn idle_peer(broker: &InMemoryBroker, id: &str) -> Peer {
        let transport = Arc::new(InMemoryTransport::new(broker.clone()));
        transport.connect(id).await.unwrap();
        let (identity, keys, engine) = engine_for(id, transport.clone());
        Peer {
            id: id.to_string(),
            identity,
            keys,
            transport,
            engine,
        }
    }

    async fn peer(broker: &InMemoryBroker, id: &str) -> Peer {
        let peer = idle_peer(broker, id).await;
        peer.engine.start();
        peer
    }

    async fn invite(owner: &Peer, space_id: &str, member: &Peer) {
        owner
            .engine
            .add_member(space_id, &member.id, &member.public_key())
            .await
            .unwrap();
    }

    fn board() -> Value {
        json!({"counter": 0, "items": []})
    }

    #[tokio::test]
    async fn test_create_space() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        assert_eq!(alice.engine.state(), EngineState::Running);

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        assert_eq!(info.members, vec!["alice".to_string()]);
        assert_eq!(alice.engine.key_generation(&info.id), Some(0));
        assert_eq!(alice.engine.get_space(&info.id), Some(info.clone()));
        assert_eq!(alice.engine.get_spaces(), vec![info.clone()]);
        assert_eq!(alice.doc(&info.id), Some(board()));

        assert_eq!(alice.engine.get_space("missing"), None);
        assert!(matches!(
            alice.engine.open_space("missing"),
            Err(ReplicationError::SpaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_space_requires_object() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        assert!(matches!(
            alice.engine.create_space(SpaceKind::Personal, &json!("nope")),
            Err(ReplicationError::Doc(DocError::NotAnObject))
        ));
        assert!(alice.engine.get_spaces().is_empty());
    }

    #[tokio::test]
    async fn test_edit_reaches_invited_member() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        invite(&alice, &info.id, &bob).await;

        let handle = alice.engine.open_space(&info.id).unwrap();
        handle
            .transact(|doc| {
                doc.set("counter", 42)?;
                doc.push("items", "x")
            })
            .await
            .unwrap();
        assert_eq!(handle.get_doc(), json!({"counter": 42, "items": ["x"]}));

        let expected = json!({"counter": 42, "items": ["x"]});
        assert!(eventually(|| bob.doc(&info.id) == Some(expected.clone())).await);

        let joined = bob.engine.get_space(&info.id).unwrap();
        assert_eq!(joined.kind, SpaceKind::Shared);
        assert!(joined.is_member("alice"));
        assert!(joined.is_member("bob"));
        assert_eq!(bob.engine.key_generation(&info.id), Some(0));
    }

    #[tokio::test]
    async fn test_bidirectional_sync() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        invite(&alice, &info.id, &bob).await;
        assert!(eventually(|| bob.engine.get_space(&info.id).is_some()).await);

        let bob_handle = bob.engine.open_space(&info.id).unwrap();
        bob_handle
            .transact(|doc| doc.push("items", "from-bob"))
            .await
            .unwrap();

        let alice_handle = alice.engine.open_space(&info.id).unwrap();
        alice_handle
            .transact(|doc| doc.set("counter", 7))
            .await
            .unwrap();

        assert!(eventually(|| alice.doc(&info.id) == bob.doc(&info.id)).await);
        assert_eq!(
            alice_handle.get_doc(),
            json!({"counter": 7, "items": ["from-bob"]})
        );
    }

    #[tokio::test]
    async fn test_remote_update_callback_and_close() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        invite(&alice, &info.id, &bob).await;
        assert!(eventually(|| bob.doc(&info.id) == Some(board())).await);

        let bob_handle = bob.engine.open_space(&info.id).unwrap();
        let seen: Arc<Mutex<Vec<RemoteUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bob_handle.on_remote_update(move |update| seen.lock().unwrap().push(update.clone()));
        }
        let counters = |seen: &Arc<Mutex<Vec<RemoteUpdate>>>| -> Vec<Value> {
            seen.lock()
                .unwrap()
                .iter()
                .map(|u| u.snapshot["counter"].clone())
                .collect()
        };

        let alice_handle = alice.engine.open_space(&info.id).unwrap();
        alice_handle.transact(|doc| doc.set("counter", 1)).await.unwrap();
        assert!(eventually(|| counters(&seen).contains(&json!(1))).await);

        let update = seen
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.snapshot["counter"] == json!(1))
            .cloned()
            .unwrap();
        assert_eq!(update.space_id, info.id);
        assert_eq!(update.from_id, "alice");
        assert_eq!(update.generation, 0);

        bob_handle.close();
        bob_handle.close();
        assert!(bob_handle.is_closed());

        alice_handle.transact(|doc| doc.set("counter", 2)).await.unwrap();
        assert!(eventually(|| bob.doc(&info.id).map(|d| d["counter"] == json!(2)).unwrap_or(false)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!counters(&seen).contains(&json!(2)));

        // closing released the subscription, not the document
        assert!(matches!(
            bob_handle.transact(|doc| doc.set("counter", 3)).await,
            Err(ReplicationError::HandleClosed(_))
        ));
        assert_eq!(bob.doc(&info.id).unwrap()["counter"], json!(2));
    }

    #[tokio::test]
    async fn test_removal_rotates_key_and_revokes_future_content() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;
        let carol = peer(&broker, "carol").await;

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        invite(&alice, &info.id, &bob).await;
        invite(&alice, &info.id, &carol).await;
        assert!(eventually(|| bob.doc(&info.id).is_some() && carol.doc(&info.id).is_some()).await);

        let alice_handle = alice.engine.open_space(&info.id).unwrap();
        alice_handle.transact(|doc| doc.set("counter", 1)).await.unwrap();
        assert!(eventually(|| carol.doc(&info.id).map(|d| d["counter"] == json!(1)).unwrap_or(false)).await);

        let mut changes = alice.engine.subscribe_member_changes();
        alice.engine.remove_member(&info.id, "carol").await.unwrap();
        assert_eq!(
            changes.recv().await.unwrap(),
            MemberChange {
                space_id: info.id.clone(),
                member_id: "carol".into(),
                action: MemberAction::Removed,
            }
        );
        assert_eq!(alice.engine.key_generation(&info.id), Some(1));
        assert!(!alice.engine.get_space(&info.id).unwrap().is_member("carol"));
        assert!(eventually(|| bob.engine.key_generation(&info.id) == Some(1)).await);
        assert!(eventually(|| !bob.engine.get_space(&info.id).unwrap().is_member("carol")).await);

        alice_handle.transact(|doc| doc.set("counter", 2)).await.unwrap();
        assert!(eventually(|| bob.doc(&info.id).map(|d| d["counter"] == json!(2)).unwrap_or(false)).await);

        // carol never receives generation 1
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(carol.engine.key_generation(&info.id), Some(0));
        assert_eq!(carol.keys.key_by_generation(&info.id, 1), None);
        assert_eq!(carol.doc(&info.id).unwrap()["counter"], json!(1));

        let carol_key = carol.keys.key_by_generation(&info.id, 0).unwrap();
        let new_key = alice.keys.key_by_generation(&info.id, 1).unwrap();
        let after = encrypt_change(b"secret", &new_key, &info.id, 1, "alice").unwrap();
        assert_eq!(
            decrypt_change(&after, &carol_key),
            Err(CodecError::AuthenticationFailure)
        );

        // history under generation 0 stays readable for carol
        let old_key = alice.keys.key_by_generation(&info.id, 0).unwrap();
        let before = encrypt_change(b"history", &old_key, &info.id, 0, "alice").unwrap();
        assert_eq!(decrypt_change(&before, &carol_key).unwrap(), b"history");
    }

    #[tokio::test]
    async fn test_membership_errors() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();

        assert!(matches!(
            alice.engine.remove_member("missing", "bob").await,
            Err(ReplicationError::SpaceNotFound(_))
        ));
        assert!(matches!(
            alice.engine.remove_member(&info.id, "bob").await,
            Err(ReplicationError::NotAMember { .. })
        ));
        assert!(matches!(
            alice.engine.remove_member(&info.id, "alice").await,
            Err(ReplicationError::InvalidMember(_))
        ));
        assert!(matches!(
            alice.engine.add_member("missing", "bob", &[0u8; 32]).await,
            Err(ReplicationError::SpaceNotFound(_))
        ));
        assert_eq!(alice.engine.key_generation(&info.id), Some(0));
    }

    #[tokio::test]
    async fn test_member_change_events() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;
        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();

        let mut alice_changes = alice.engine.subscribe_member_changes();
        let mut bob_changes = bob.engine.subscribe_member_changes();
        invite(&alice, &info.id, &bob).await;

        let added = alice_changes.recv().await.unwrap();
        assert_eq!(added.member_id, "bob");
        assert_eq!(added.action, MemberAction::Added);

        let joined = tokio::time::timeout(Duration::from_secs(2), bob_changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined.space_id, info.id);
        assert_eq!(joined.member_id, "bob");
    }

    #[tokio::test]
    async fn test_existing_members_learn_new_member() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;
        let carol = peer(&broker, "carol").await;

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        invite(&alice, &info.id, &bob).await;
        assert!(eventually(|| bob.engine.get_space(&info.id).is_some()).await);
        invite(&alice, &info.id, &carol).await;

        assert!(eventually(|| bob
            .engine
            .get_space(&info.id)
            .map(|s| s.is_member("carol"))
            .unwrap_or(false))
        .await);

        // bob's edits now reach carol directly
        let bob_handle = bob.engine.open_space(&info.id).unwrap();
        bob_handle.transact(|doc| doc.push("items", "hi")).await.unwrap();
        assert!(eventually(|| carol.doc(&info.id).map(|d| d["items"] == json!(["hi"])).unwrap_or(false)).await);
    }

    #[tokio::test]
    async fn test_unknown_space_content_is_ignored() {
        let broker = InMemoryBroker::new();
        let bob = idle_peer(&broker, "bob").await;

        let key = GroupKey::generate();
        let change = encrypt_change(b"whatever", &key, "stranger-space", 0, "mallory").unwrap();
        let envelope = Envelope::new(MessageType::Content, "mallory", "bob", change.to_json().unwrap());

        assert_eq!(bob.engine.receive(&envelope), Received::Parked);
        assert!(bob.engine.get_spaces().is_empty());
        assert_eq!(bob.engine.get_space("stranger-space"), None);
    }

    #[tokio::test]
    async fn test_non_replication_and_misaddressed_envelopes_ignored() {
        let broker = InMemoryBroker::new();
        let bob = idle_peer(&broker, "bob").await;

        let ack = Envelope::new(MessageType::Ack, "alice", "bob", "{}");
        assert_eq!(bob.engine.receive(&ack), Received::Ignored);

        let other = Envelope::new(MessageType::Content, "alice", "carol", "{}");
        assert_eq!(bob.engine.receive(&other), Received::Ignored);

        let garbage = Envelope::new(MessageType::Content, "alice", "bob", "not json");
        assert_eq!(bob.engine.receive(&garbage), Received::Dropped);
    }

    /// Bob's engine is idle; his inbox is drained by hand.
    async fn captured_invite(broker: &InMemoryBroker) -> (Peer, Peer, String, Envelope, Envelope) {
        let alice = peer(broker, "alice").await;
        let bob = idle_peer(broker, "bob").await;
        let mut inbox = bob.transport.subscribe();

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        alice
            .engine
            .open_space(&info.id)
            .unwrap()
            .transact(|doc| doc.set("counter", 5))
            .await
            .unwrap();
        invite(&alice, &info.id, &bob).await;

        let invite_env = inbox.recv().await.unwrap();
        let content_env = inbox.recv().await.unwrap();
        assert_eq!(invite_env.message_type, MessageType::SpaceInvite);
        assert_eq!(content_env.message_type, MessageType::Content);
        assert_eq!(
            content_env.resource_ref,
            Some(ResourceRef::space(&info.id))
        );
        (alice, bob, info.id, invite_env, content_env)
    }

    #[tokio::test]
    async fn test_content_before_invite_is_parked_and_replayed() {
        let broker = InMemoryBroker::new();
        let (alice, bob, space_id, invite_env, content_env) = captured_invite(&broker).await;

        assert_eq!(bob.engine.receive(&content_env), Received::Parked);
        assert_eq!(bob.engine.get_space(&space_id), None);

        assert_eq!(bob.engine.receive(&invite_env), Received::Joined);
        assert_eq!(bob.doc(&space_id), alice.doc(&space_id));
        assert_eq!(bob.doc(&space_id).unwrap()["counter"], json!(5));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_harmless() {
        let broker = InMemoryBroker::new();
        let (_alice, bob, space_id, invite_env, content_env) = captured_invite(&broker).await;

        assert_eq!(bob.engine.receive(&invite_env), Received::Joined);
        assert!(matches!(bob.engine.receive(&content_env), Received::Merged(n) if n > 0));
        assert_eq!(bob.engine.receive(&content_env), Received::Merged(0));
        assert_eq!(bob.engine.receive(&invite_env), Received::KeyInstalled);
        assert_eq!(bob.doc(&space_id).unwrap()["counter"], json!(5));
    }

    #[tokio::test]
    async fn test_tampered_change_is_dropped() {
        let broker = InMemoryBroker::new();
        let (_alice, bob, space_id, invite_env, content_env) = captured_invite(&broker).await;
        assert_eq!(bob.engine.receive(&invite_env), Received::Joined);

        let mut change = EncryptedChange::from_json(&content_env.payload).unwrap();
        change.ciphertext[0] ^= 0x01;
        let mut tampered = content_env.clone();
        tampered.payload = change.to_json().unwrap();

        assert_eq!(bob.engine.receive(&tampered), Received::Dropped);
        assert_eq!(bob.doc(&space_id), Some(json!({})));

        // the intact change still merges afterwards
        assert!(matches!(bob.engine.receive(&content_env), Received::Merged(_)));
        assert_eq!(bob.doc(&space_id).unwrap()["counter"], json!(5));
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_dropped() {
        let broker = InMemoryBroker::new();
        let (_alice, bob, _space_id, invite_env, content_env) = captured_invite(&broker).await;
        bob.engine.receive(&invite_env);

        let mut spoofed = content_env;
        spoofed.from_id = "mallory".into();
        assert_eq!(bob.engine.receive(&spoofed), Received::Dropped);
    }

    #[tokio::test]
    async fn test_invite_for_someone_else_is_dropped() {
        let broker = InMemoryBroker::new();
        let (_alice, _bob, space_id, invite_env, _content) = captured_invite(&broker).await;

        // carol cannot open a key sealed to bob
        let carol = idle_peer(&broker, "carol").await;
        let mut stolen = invite_env;
        stolen.to_id = "carol".into();
        assert_eq!(carol.engine.receive(&stolen), Received::Dropped);
        assert_eq!(carol.engine.get_space(&space_id), None);
        assert_eq!(carol.engine.key_generation(&space_id), None);
    }

    #[tokio::test]
    async fn test_newer_generation_content_waits_for_its_invite() {
        let broker = InMemoryBroker::new();
        let (alice, bob, space_id, invite_env, content_env) = captured_invite(&broker).await;
        assert_eq!(bob.engine.receive(&invite_env), Received::Joined);
        assert!(matches!(bob.engine.receive(&content_env), Received::Merged(_)));
        let mut inbox = bob.transport.subscribe();

        let carol = peer(&broker, "carol").await;
        invite(&alice, &space_id, &carol).await;
        let refresh = inbox.recv().await.unwrap();
        assert_eq!(refresh.message_type, MessageType::SpaceInvite);
        assert_eq!(bob.engine.receive(&refresh), Received::KeyInstalled);

        alice.engine.remove_member(&space_id, "carol").await.unwrap();
        let rotation = inbox.recv().await.unwrap();
        assert_eq!(rotation.message_type, MessageType::SpaceInvite);

        alice
            .engine
            .open_space(&space_id)
            .unwrap()
            .transact(|doc| doc.set("counter", 9))
            .await
            .unwrap();
        let newer = inbox.recv().await.unwrap();
        assert_eq!(newer.message_type, MessageType::Content);
        assert_eq!(EncryptedChange::from_json(&newer.payload).unwrap().generation, 1);

        // bob holds the space but not generation 1 yet
        assert_eq!(bob.engine.receive(&newer), Received::Parked);
        assert_eq!(bob.doc(&space_id).unwrap()["counter"], json!(5));

        assert_eq!(bob.engine.receive(&rotation), Received::KeyInstalled);
        assert_eq!(bob.engine.key_generation(&space_id), Some(1));
        assert_eq!(bob.doc(&space_id).unwrap()["counter"], json!(9));
        assert_eq!(bob.doc(&space_id), alice.doc(&space_id));
        assert_eq!(
            bob.engine.get_space(&space_id).unwrap().members,
            vec!["alice", "bob"]
        );
    }

    #[tokio::test]
    async fn test_removed_member_cannot_rewrite_membership() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;
        let mallory = peer(&broker, "mallory").await;
        let zed = peer(&broker, "zed").await;

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        invite(&alice, &info.id, &bob).await;
        invite(&alice, &info.id, &mallory).await;
        assert!(eventually(|| bob
            .engine
            .get_space(&info.id)
            .map(|s| s.is_member("mallory"))
            .unwrap_or(false))
        .await);
        assert!(eventually(|| mallory.doc(&info.id).is_some()).await);

        alice.engine.remove_member(&info.id, "mallory").await.unwrap();
        assert!(eventually(|| bob.engine.key_generation(&info.id) == Some(1)).await);

        // mallory's own view still lists everyone, so these go out at gen 0
        mallory
            .engine
            .add_member(&info.id, "zed", &zed.public_key())
            .await
            .unwrap();
        mallory
            .engine
            .open_space(&info.id)
            .unwrap()
            .transact(|doc| doc.set("counter", 666))
            .await
            .unwrap();
        assert!(eventually(|| zed.doc(&info.id).is_some()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        for member in [&alice, &bob] {
            let space = member.engine.get_space(&info.id).unwrap();
            assert_eq!(space.members, vec!["alice", "bob"]);
            assert_eq!(member.doc(&info.id).unwrap()["counter"], json!(0));
        }

        let carol = peer(&broker, "carol").await;
        invite(&alice, &info.id, &carol).await;
        assert!(eventually(|| bob
            .engine
            .get_space(&info.id)
            .map(|s| s.is_member("carol"))
            .unwrap_or(false))
        .await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mallory.engine.key_generation(&info.id), Some(0));
        assert_eq!(mallory.keys.key_by_generation(&info.id, 1), None);
        assert!(!alice.engine.get_space(&info.id).unwrap().is_member("zed"));
    }

    #[tokio::test]
    async fn test_same_generation_invite_only_adds_members() {
        let broker = InMemoryBroker::new();
        let (alice, bob, space_id, invite_env, _content) = captured_invite(&broker).await;
        assert_eq!(bob.engine.receive(&invite_env), Received::Joined);
        let mut inbox = bob.transport.subscribe();

        let carol = peer(&broker, "carol").await;
        invite(&alice, &space_id, &carol).await;
        let refresh = inbox.recv().await.unwrap();
        assert_eq!(bob.engine.receive(&refresh), Received::KeyInstalled);

        // the original invite predates carol; replaying it must not drop carol
        assert_eq!(bob.engine.receive(&invite_env), Received::KeyInstalled);
        assert_eq!(
            bob.engine.get_space(&space_id).unwrap().members,
            vec!["alice", "bob", "carol"]
        );
    }

    #[tokio::test]
    async fn test_failed_invite_leaves_membership_unchanged() {
        let broker = InMemoryBroker::new();
        let transport = Arc::new(InMemoryTransport::new(broker));
        let (_identity, _keys, engine) = engine_for("alice", transport);
        let info = engine.create_space(SpaceKind::Shared, &board()).unwrap();
        let mut changes = engine.subscribe_member_changes();
        let bob_key = X25519Identity::generate().public_key();

        let err = engine.add_member(&info.id, "bob", &bob_key).await.unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::Transport(TransportError::NotConnected)
        ));
        assert_eq!(engine.get_space(&info.id).unwrap().members, vec!["alice"]);
        let entry = engine.inner.entry(&info.id).unwrap();
        assert!(!lock_entry(&entry).member_keys.contains_key("bob"));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_parked_buffer_is_bounded() {
        let broker = InMemoryBroker::new();
        let transport = Arc::new(InMemoryTransport::new(broker.clone()));
        let identity = Arc::new(X25519Identity::generate());
        let config = ReplicationConfig {
            parked_spaces: 2,
            parked_changes_per_space: 2,
        };
        let engine = ReplicationEngine::new(
            "bob",
            identity,
            transport,
            Arc::new(GroupKeyRegistry::new()),
            &config,
        );

        let key = GroupKey::generate();
        for space in ["s1", "s2", "s3"] {
            for _ in 0..3 {
                let change = encrypt_change(b"x", &key, space, 0, "alice").unwrap();
                let env = Envelope::new(MessageType::Content, "alice", "bob", change.to_json().unwrap());
                assert_eq!(engine.receive(&env), Received::Parked);
            }
        }

        let parked = engine.inner.parked();
        assert_eq!(parked.len(), 2);
        assert!(!parked.contains("s1"));
        assert_eq!(parked.peek("s3").map(VecDeque::len), Some(2));
    }

    #[tokio::test]
    async fn test_offline_sender_flushes_after_reconnect() {
        let broker = InMemoryBroker::new();
        let bob = peer(&broker, "bob").await;

        let store = Arc::new(InMemoryPendingStore::new());
        let outbox = Arc::new(OutboxTransport::new(
            InMemoryTransport::new(broker.clone()),
            store.clone() as Arc<dyn PendingStore>,
            &OutboxConfig::default(),
        ));
        let (_identity, _keys, alice) = engine_for("alice", outbox.clone());
        alice.start();

        let info = alice.create_space(SpaceKind::Shared, &board()).unwrap();
        alice
            .add_member(&info.id, "bob", &bob.public_key())
            .await
            .unwrap();
        alice
            .open_space(&info.id)
            .unwrap()
            .transact(|doc| doc.set("counter", 9))
            .await
            .unwrap();
        assert_eq!(store.count().unwrap(), 3);

        outbox.connect("alice").await.unwrap();
        assert!(eventually(|| store.count().unwrap() == 0).await);
        assert!(eventually(|| bob.doc(&info.id).map(|d| d["counter"] == json!(9)).unwrap_or(false)).await);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let broker = InMemoryBroker::new();
        let alice = idle_peer(&broker, "alice").await;
        let mut state = alice.engine.watch_state();
        assert_eq!(alice.engine.state(), EngineState::Idle);

        alice.engine.start();
        assert_eq!(*state.borrow_and_update(), EngineState::Running);
        alice.engine.stop();
        assert_eq!(alice.engine.state(), EngineState::Idle);
        assert_eq!(alice.engine.local_id(), "alice");
    }

    #[tokio::test]
    async fn test_stopped_engine_does_not_process() {
        let broker = InMemoryBroker::new();
        let alice = peer(&broker, "alice").await;
        let bob = peer(&broker, "bob").await;
        bob.engine.stop();

        let info = alice.engine.create_space(SpaceKind::Shared, &board()).unwrap();
        invite(&alice, &info.id, &bob).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(bob.engine.get_space(&info.id), None);
    }
}
