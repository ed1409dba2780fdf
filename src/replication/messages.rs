//! Wire payloads of the envelopes the replication engine exchanges.
//!
//! A `content` envelope carries a JSON-encoded
//! [`EncryptedChange`](crate::crypto::EncryptedChange) directly. A
//! `space-invite` envelope carries an [`InvitePayload`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::space::SpaceKind;
use super::ReplicationError;
use crate::crypto::SealedPayload;

/// Group key for one generation, sealed to the invitee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub space_id: String,
    pub generation: u32,
    pub encrypted_group_key: SealedPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SpaceKind>,
    /// Full member list as the sender knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,
    /// Members' public keys (base64), so any member can later redistribute.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub member_keys: BTreeMap<String, String>,
}

impl InvitePayload {
    pub fn to_json(&self) -> Result<String, ReplicationError> {
        serde_json::to_string(self).map_err(|e| ReplicationError::Malformed(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ReplicationError> {
        serde_json::from_str(json).map_err(|e| ReplicationError::Malformed(e.to_string()))
    }

    /// Decoded member keys. Entries that are not valid base64 are skipped.
    pub fn decoded_member_keys(&self) -> BTreeMap<String, Vec<u8>> {
        self.member_keys
            .iter()
            .filter_map(|(member, key)| {
                STANDARD
                    .decode(key.as_bytes())
                    .ok()
                    .map(|bytes| (member.clone(), bytes))
            })
            .collect()
    }
}

pub(crate) fn encode_member_keys(keys: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
    keys.iter()
        .map(|(member, key)| (member.clone(), STANDARD.encode(key)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberAction {
    Added,
    Removed,
}

/// Emitted whenever a space's member list changes on this peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberChange {
    pub space_id: String,
    pub member_id: String,
    pub action: MemberAction,
}
