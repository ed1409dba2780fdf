use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::serde_base64;

/// HKDF info string binding derived keys to this construction.
const SEAL_INFO: &[u8] = b"trustspace-ecies-v1";

const NONCE_LEN: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("Invalid recipient public key")]
    InvalidPublicKey,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
}

pub type Result<T> = std::result::Result<T, SealError>;

/// Output of [`RecipientCipher::encrypt_for_recipient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedPayload {
    #[serde(with = "serde_base64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub ephemeral_public_key: Vec<u8>,
}

/// Asymmetric encrypt-for-recipient / decrypt-for-me capability.
///
/// The replication engine only uses it to deliver group keys to members.
pub trait RecipientCipher: Send + Sync {
    /// Public key other peers encrypt to.
    fn public_key(&self) -> Vec<u8>;

    fn encrypt_for_recipient(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8],
    ) -> Result<SealedPayload>;

    fn decrypt_for_me(&self, sealed: &SealedPayload) -> Result<Vec<u8>>;
}

/// X25519 identity: ephemeral-static ECDH, HKDF-SHA256, XChaCha20-Poly1305.
pub struct X25519Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519Identity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let raw: [u8; 32] = bytes.try_into().map_err(|_| SealError::InvalidPublicKey)?;
    Ok(PublicKey::from(raw))
}

/// Derive the one-shot AEAD key from a shared secret.
fn derive_seal_key(shared_secret: &[u8; 32]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(SEAL_INFO, &mut key)
        .map_err(|_| SealError::EncryptionFailed)?;
    Ok(key)
}

/// `ephemeral_pk || recipient_pk`, binding the ciphertext to both parties.
fn seal_aad(ephemeral: &[u8], recipient: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(64);
    aad.extend_from_slice(ephemeral);
    aad.extend_from_slice(recipient);
    aad
}

impl RecipientCipher for X25519Identity {
    fn public_key(&self) -> Vec<u8> {
        self.public.to_bytes().to_vec()
    }

    fn encrypt_for_recipient(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8],
    ) -> Result<SealedPayload> {
        let recipient = parse_public_key(recipient_public_key)?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);

        let mut key = derive_seal_key(shared.as_bytes())?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key);
        key.zeroize();
        let cipher = cipher.map_err(|_| SealError::EncryptionFailed)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let aad = seal_aad(ephemeral_public.as_bytes(), recipient.as_bytes());
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| SealError::EncryptionFailed)?;

        Ok(SealedPayload {
            ciphertext,
            nonce: nonce.to_vec(),
            ephemeral_public_key: ephemeral_public.to_bytes().to_vec(),
        })
    }

    fn decrypt_for_me(&self, sealed: &SealedPayload) -> Result<Vec<u8>> {
        if sealed.nonce.len() != NONCE_LEN {
            return Err(SealError::DecryptionFailed);
        }
        let ephemeral_public = parse_public_key(&sealed.ephemeral_public_key)?;
        let shared = self.secret.diffie_hellman(&ephemeral_public);

        let mut key = derive_seal_key(shared.as_bytes()).map_err(|_| SealError::DecryptionFailed)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key);
        key.zeroize();
        let cipher = cipher.map_err(|_| SealError::DecryptionFailed)?;

        let aad = seal_aad(ephemeral_public.as_bytes(), self.public.as_bytes());
        cipher
            .decrypt(
                XNonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SealError::DecryptionFailed)
    }
}
