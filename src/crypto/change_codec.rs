use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::group_keys::GroupKey;
use super::serde_base64;

/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;

/// Domain separator mixed into the associated data of every change.
const CHANGE_AAD_CONTEXT: &[u8] = b"trustspace-change-v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Authentication failed: wrong key or tampered change")]
    AuthenticationFailure,
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid nonce length")]
    InvalidNonceLength,
    #[error("Malformed change: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// An encrypted CRDT diff plus the clear routing metadata needed to pick the
/// decryption key. The metadata is authenticated as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedChange {
    pub space_id: String,
    pub generation: u32,
    #[serde(with = "serde_base64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub nonce: Vec<u8>,
    pub from_id: String,
}

impl EncryptedChange {
    /// JSON form carried in a `content` envelope payload.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

/// Length-prefixed `context || space_id || generation || from_id`.
fn associated_data(space_id: &str, generation: u32, from_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CHANGE_AAD_CONTEXT.len() + space_id.len() + from_id.len() + 12);
    aad.extend_from_slice(CHANGE_AAD_CONTEXT);
    aad.extend_from_slice(&(space_id.len() as u32).to_be_bytes());
    aad.extend_from_slice(space_id.as_bytes());
    aad.extend_from_slice(&generation.to_be_bytes());
    aad.extend_from_slice(&(from_id.len() as u32).to_be_bytes());
    aad.extend_from_slice(from_id.as_bytes());
    aad
}

/// Encrypt a diff under a group key with a fresh random nonce.
pub fn encrypt_change(
    diff: &[u8],
    key: &GroupKey,
    space_id: &str,
    generation: u32,
    from_id: &str,
) -> Result<EncryptedChange> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CodecError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let aad = associated_data(space_id, generation, from_id);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: diff, aad: &aad })
        .map_err(|_| CodecError::EncryptionFailed)?;

    Ok(EncryptedChange {
        space_id: space_id.to_string(),
        generation,
        ciphertext,
        nonce: nonce_bytes.to_vec(),
        from_id: from_id.to_string(),
    })
}

/// Decrypt a change. Any tampering with the ciphertext, nonce or routing
/// metadata surfaces as `AuthenticationFailure`.
pub fn decrypt_change(change: &EncryptedChange, key: &GroupKey) -> Result<Vec<u8>> {
    if change.nonce.len() != NONCE_LEN {
        return Err(CodecError::InvalidNonceLength);
    }

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CodecError::InvalidKeyLength)?;
    let nonce = XNonce::from_slice(&change.nonce);
    let aad = associated_data(&change.space_id, change.generation, &change.from_id);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &change.ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CodecError::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal(diff: &[u8], key: &GroupKey) -> EncryptedChange {
        encrypt_change(diff, key, "space-1", 2, "alice").unwrap()
    }

    #[test]
    fn test_roundtrip_various_lengths() {
        let key = GroupKey::generate();
        for len in [0usize, 1, 15, 16, 17, 1024, 65_537] {
            let diff: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let change = seal(&diff, &key);
            assert_eq!(change.space_id, "space-1");
            assert_eq!(change.generation, 2);
            assert_eq!(change.from_id, "alice");
            assert_eq!(decrypt_change(&change, &key).unwrap(), diff);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let change = seal(b"diff", &GroupKey::generate());
        assert_eq!(
            decrypt_change(&change, &GroupKey::generate()),
            Err(CodecError::AuthenticationFailure)
        );
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = GroupKey::generate();
        let a = seal(b"same", &key);
        let b = seal(b"same", &key);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampering_is_detected() {
        let key = GroupKey::generate();
        let original = seal(b"counter=42", &key);

        let mut flipped = original.clone();
        flipped.ciphertext[0] ^= 0x01;
        assert_eq!(
            decrypt_change(&flipped, &key),
            Err(CodecError::AuthenticationFailure)
        );

        let mut renonced = original.clone();
        renonced.nonce[3] ^= 0xff;
        assert_eq!(
            decrypt_change(&renonced, &key),
            Err(CodecError::AuthenticationFailure)
        );

        let mut regenerated = original.clone();
        regenerated.generation = 3;
        assert_eq!(
            decrypt_change(&regenerated, &key),
            Err(CodecError::AuthenticationFailure)
        );

        let mut spoofed = original;
        spoofed.from_id = "mallory".into();
        assert_eq!(
            decrypt_change(&spoofed, &key),
            Err(CodecError::AuthenticationFailure)
        );
    }

    #[test]
    fn test_short_nonce_rejected() {
        let key = GroupKey::generate();
        let mut change = seal(b"x", &key);
        change.nonce.truncate(12);
        assert_eq!(
            decrypt_change(&change, &key),
            Err(CodecError::InvalidNonceLength)
        );
    }

    #[test]
    fn test_json_wire_shape() {
        let key = GroupKey::generate();
        let change = seal(b"hello", &key);
        let json: serde_json::Value = serde_json::from_str(&change.to_json().unwrap()).unwrap();

        assert_eq!(json["spaceId"], "space-1");
        assert_eq!(json["generation"], 2);
        assert_eq!(json["fromId"], "alice");
        assert!(json["ciphertext"].is_string());
        assert!(json["nonce"].is_string());

        let decoded = EncryptedChange::from_json(&change.to_json().unwrap()).unwrap();
        assert_eq!(decrypt_change(&decoded, &key).unwrap(), b"hello");
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            EncryptedChange::from_json("{\"spaceId\":1}"),
            Err(CodecError::Malformed(_))
        ));
    }
}
