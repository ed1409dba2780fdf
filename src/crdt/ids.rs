/// Identity types for the document CRDT.
///
/// - `ReplicaId`: 16-byte identity of one document instance
/// - `OpId`: globally unique, totally ordered operation identifier

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ReplicaId
// ---------------------------------------------------------------------------

/// Identity of one replica of a document: BLAKE3("TS-REPLICA" || random32)[0..16].
///
/// Every local document instance gets its own replica id, so two devices of
/// the same peer never mint colliding op ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub [u8; 16]);

impl ReplicaId {
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"TS-REPLICA");
        hasher.update(&seed);

        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        ReplicaId(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ReplicaId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// OpId
// ---------------------------------------------------------------------------

/// Operation identifier, ordered by `(lamport, replica)`.
///
/// The lamport clock of a replica always exceeds every op it has seen, so an
/// op's id is greater than the id of anything it was based on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(lamport: u64, replica: ReplicaId) -> Self {
        OpId { lamport, replica }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({}@{})", self.lamport, &self.replica.to_hex()[..8])
    }
}
