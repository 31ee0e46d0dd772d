//! Crypto capability used by the session machinery.
//!
//! The orchestrator never touches key material directly. It asks a
//! [`CryptoProvider`] to export the local public key, to turn a peer's JWK
//! into a per-session [`SharedKey`], and to seal or open payloads.

use protocol::{EncryptedPayload, KeyPair, PeerPublicKey, PublicKeyJwk, SharedKey};
use serde_json::Value;

use crate::storage::{KeyStore, StorageResult};

/// Key agreement and payload encryption.
pub trait CryptoProvider: Send + Sync {
    /// The local public key as a JWK object.
    fn public_key_jwk(&self) -> Value;

    /// Import a peer's JWK and derive the shared key for it.
    fn derive_shared_key(&self, peer_jwk: &Value) -> protocol::Result<SharedKey>;

    fn encrypt(&self, key: &SharedKey, plaintext: &[u8]) -> protocol::Result<EncryptedPayload>;

    fn decrypt(&self, key: &SharedKey, payload: &EncryptedPayload) -> protocol::Result<Vec<u8>>;
}

/// X25519 + HKDF-SHA256 + AES-256-GCM with a local identity key.
#[derive(Debug)]
pub struct LocalCryptoProvider {
    key_pair: KeyPair,
}

impl LocalCryptoProvider {
    pub fn new(key_pair: KeyPair) -> Self {
        Self { key_pair }
    }

    /// Uses a fresh, unsaved key pair.
    pub fn ephemeral() -> Self {
        Self::new(KeyPair::generate())
    }

    /// Uses the key pair in `store`, creating it on first use.
    pub fn from_key_store(store: &KeyStore) -> StorageResult<Self> {
        Ok(Self::new(store.load_or_generate()?))
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

impl CryptoProvider for LocalCryptoProvider {
    fn public_key_jwk(&self) -> Value {
        self.key_pair.public_jwk().to_value()
    }

    fn derive_shared_key(&self, peer_jwk: &Value) -> protocol::Result<SharedKey> {
        let jwk = PublicKeyJwk::from_value(peer_jwk)?;
        let peer = PeerPublicKey::from_jwk(&jwk)?;
        self.key_pair.derive_shared_key(&peer)
    }

    fn encrypt(&self, key: &SharedKey, plaintext: &[u8]) -> protocol::Result<EncryptedPayload> {
        key.encrypt(plaintext)
    }

    fn decrypt(&self, key: &SharedKey, payload: &EncryptedPayload) -> protocol::Result<Vec<u8>> {
        key.decrypt(payload)
    }
}
