//! Space key material: the generational group-key registry, the AEAD codec
//! for CRDT changes, and the recipient cipher used to hand a group key to a
//! new member.

pub mod change_codec;
pub mod group_keys;
pub mod sealed_box;

pub use change_codec::{decrypt_change, encrypt_change, CodecError, EncryptedChange};
pub use group_keys::{GroupKey, GroupKeyRegistry, KeyError, KeySlot, GROUP_KEY_LEN};
pub use sealed_box::{RecipientCipher, SealError, SealedPayload, X25519Identity};

/// Short, non-reversible tag for log lines. Never log key bytes themselves.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(&blake3::hash(bytes).as_bytes()[..4])
}

/// Serde adapter storing byte vectors as standard base64 strings.
pub(crate) mod serde_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
