//! Node identity and channel crypto. The transport assigns each node a
//! random participant id and an X25519 keypair; frames on a channel are
//! sealed with the pairwise ChaCha20-Poly1305 key both ends derive.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Handshake format version exchanged before any frame.
pub const TRANSPORT_VERSION: u8 = 1;

pub struct NodeIdentity {
    secret: StaticSecret,
    public: [u8; 32],
    id: Uuid,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self {
            secret,
            public,
            id: Uuid::new_v4(),
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn id_bytes(&self) -> [u8; 16] {
        *self.id.as_bytes()
    }

    /// The opaque participant id this node hands out in handshakes.
    pub fn participant_id(&self) -> String {
        self.id.to_string()
    }

    /// Pairwise session key with a peer. Both ends derive the same key from
    /// the Diffie-Hellman shared secret.
    pub fn session_key(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer_public))
            .to_bytes();
        let mut hasher = Sha256::new();
        hasher.update(b"pixdrop-session-v1");
        hasher.update(shared);
        hasher.finalize().into()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameCryptoError {
    #[error("invalid key")]
    Key,
    #[error("seal failed")]
    Seal,
    #[error("open failed")]
    Open,
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut bytes = [0u8; 12];
    bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    bytes
}

/// Seal one frame. The nonce is a per-direction counter; never reused.
pub fn seal_frame(key: &[u8; 32], nonce: u64, plaintext: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| FrameCryptoError::Key)?;
    let bytes = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&bytes);
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| FrameCryptoError::Seal)
}

/// Open one sealed frame.
pub fn open_frame(key: &[u8; 32], nonce: u64, sealed: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| FrameCryptoError::Key)?;
    let bytes = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&bytes);
    cipher
        .decrypt(nonce_arr, sealed)
        .map_err(|_| FrameCryptoError::Open)
}
