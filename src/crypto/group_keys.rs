use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::fingerprint;

/// Symmetric group keys are 32 bytes (XChaCha20-Poly1305).
pub const GROUP_KEY_LEN: usize = 32;

/// Largest jump an imported generation may make past the highest known slot.
/// Bounds the placeholder padding a single invite can force.
pub const MAX_GENERATION_GAP: u32 = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("No key ring for space {0}")]
    NotFound(String),
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Generation {generation} is too far ahead of {known}")]
    GenerationOutOfRange { generation: u32, known: u32 },
}

pub type Result<T> = std::result::Result<T, KeyError>;

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey([u8; GROUP_KEY_LEN]);

impl GroupKey {
    /// Fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; GROUP_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; GROUP_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; GROUP_KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidKeyLength)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_KEY_LEN] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupKey({})", self.fingerprint())
    }
}

/// One generation's slot in a key ring.
///
/// `Pending` marks a generation we know exists (a later one was imported)
/// but whose key has not reached us. It is never handed out as a usable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySlot {
    Known(GroupKey),
    Pending,
}

#[derive(Debug, Default)]
struct KeyRing {
    slots: Vec<KeySlot>,
    /// Highest generation whose key is `Known`.
    current: Option<u32>,
}

impl KeyRing {
    fn with_key(key: GroupKey) -> Self {
        Self {
            slots: vec![KeySlot::Known(key)],
            current: Some(0),
        }
    }

    fn key_at(&self, generation: u32) -> Option<&GroupKey> {
        match self.slots.get(generation as usize)? {
            KeySlot::Known(key) => Some(key),
            KeySlot::Pending => None,
        }
    }
}

/// Per-space rings of symmetric keys indexed by generation.
///
/// Rings only grow: rotation appends, import fills a slot, and no key is
/// ever removed, so ciphertext from any held generation stays decryptable.
/// Rings are sharded by space id; work on one space never blocks another.
#[derive(Default)]
pub struct GroupKeyRegistry {
    rings: DashMap<String, KeyRing>,
}

impl GroupKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint generation 0 for a space, replacing any previous ring.
    pub fn create_key(&self, space_id: &str) -> GroupKey {
        let key = GroupKey::generate();
        self.rings
            .insert(space_id.to_string(), KeyRing::with_key(key.clone()));
        log::info!(
            "Group key created for space {} (gen 0, key {})",
            fingerprint(space_id.as_bytes()),
            key.fingerprint()
        );
        key
    }

    /// Append a fresh key as the next generation.
    ///
    /// Rotating a space that was never created is a caller error and fails
    /// with `NotFound`; it never creates a ring implicitly.
    pub fn rotate_key(&self, space_id: &str) -> Result<(u32, GroupKey)> {
        let mut ring = self
            .rings
            .get_mut(space_id)
            .ok_or_else(|| KeyError::NotFound(space_id.to_string()))?;

        let key = GroupKey::generate();
        let generation = ring.slots.len() as u32;
        ring.slots.push(KeySlot::Known(key.clone()));
        ring.current = Some(generation);

        log::info!(
            "Group key rotated for space {} (gen {}, key {})",
            fingerprint(space_id.as_bytes()),
            generation,
            key.fingerprint()
        );
        Ok((generation, key))
    }

    pub fn current_key(&self, space_id: &str) -> Option<GroupKey> {
        let ring = self.rings.get(space_id)?;
        let generation = ring.current?;
        ring.key_at(generation).cloned()
    }

    /// Latest usable generation, or `None` for an unknown space.
    pub fn current_generation(&self, space_id: &str) -> Option<u32> {
        self.rings.get(space_id)?.current
    }

    /// Key and generation read under one lock, so a concurrent rotation
    /// cannot pair a key with the wrong generation.
    pub fn current(&self, space_id: &str) -> Option<(u32, GroupKey)> {
        let ring = self.rings.get(space_id)?;
        let generation = ring.current?;
        ring.key_at(generation).map(|key| (generation, key.clone()))
    }

    /// `None` for unknown spaces, generations beyond the ring, and pending
    /// placeholders.
    pub fn key_by_generation(&self, space_id: &str, generation: u32) -> Option<GroupKey> {
        self.rings.get(space_id)?.key_at(generation).cloned()
    }

    /// Install a key received out of band at a specific generation.
    ///
    /// Skipped generations are padded with `Pending` slots. The current
    /// generation only moves forward.
    pub fn import_key(&self, space_id: &str, key: GroupKey, generation: u32) -> Result<()> {
        let check_gap = |known: usize| {
            let known = known as u32;
            if generation > known.saturating_add(MAX_GENERATION_GAP) {
                return Err(KeyError::GenerationOutOfRange { generation, known });
            }
            Ok(())
        };

        // The gap is measured under the entry lock so a concurrent import
        // cannot grow the ring between the check and the write.
        let mut ring = match self.rings.entry(space_id.to_string()) {
            Entry::Occupied(slot) => {
                check_gap(slot.get().slots.len())?;
                slot.into_ref()
            }
            Entry::Vacant(slot) => {
                check_gap(0)?;
                slot.insert(KeyRing::default())
            }
        };

        while ring.slots.len() <= generation as usize {
            ring.slots.push(KeySlot::Pending);
        }
        ring.slots[generation as usize] = KeySlot::Known(key);
        if ring.current.map_or(true, |current| generation > current) {
            ring.current = Some(generation);
        }

        log::debug!(
            "Group key imported for space {} (gen {})",
            fingerprint(space_id.as_bytes()),
            generation
        );
        Ok(())
    }

    pub fn has_space(&self, space_id: &str) -> bool {
        self.rings.contains_key(space_id)
    }

    /// Number of slots, pending placeholders included.
    pub fn slot_count(&self, space_id: &str) -> usize {
        self.rings.get(space_id).map_or(0, |ring| ring.slots.len())
    }
}
