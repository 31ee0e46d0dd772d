//! Key agreement and payload encryption for peer data channels.
//!
//! Each client holds one long-lived X25519 key pair. On every channel open the
//! public half is sent to the peer as a JWK-style object
//! (`{"kty":"OKP","crv":"X25519","x":<base64url>}`). Both sides run
//! Diffie-Hellman, expand the result with HKDF-SHA256 and use the output as an
//! AES-256-GCM key. Every encryption uses a fresh random 12-byte IV.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{ProtocolError, Result};
use crate::messages::EncryptedPayload;

/// Length of an X25519 key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of the AES-GCM IV in bytes.
pub const IV_LENGTH: usize = 12;

/// HKDF info string binding derived keys to this protocol.
const KDF_INFO: &[u8] = b"peerchat/v1 aes-256-gcm";

/// Public key in JWK form as exchanged in `publicKey` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

impl PublicKeyJwk {
    /// Convert to the untyped JSON carried on the wire.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "kty": self.kty, "crv": self.crv, "x": self.x })
    }

    /// Parse from the untyped JSON carried on the wire.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
    }
}

/// The local key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Secret bytes for persistence. Keep these confidential.
    pub fn secret_bytes(&self) -> [u8; KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// The public half.
    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey(self.public)
    }

    /// Export the public half as a JWK.
    pub fn public_jwk(&self) -> PublicKeyJwk {
        self.public_key().to_jwk()
    }

    /// Derive the symmetric key shared with `peer`.
    pub fn derive_shared_key(&self, peer: &PeerPublicKey) -> Result<SharedKey> {
        let shared = self.secret.diffie_hellman(&peer.0);
        if !shared.was_contributory() {
            return Err(ProtocolError::KeyDerivation(
                "peer public key is a low-order point".to_string(),
            ));
        }

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; KEY_LENGTH];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
        Ok(SharedKey(okm))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key().to_jwk().x)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A remote peer's public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerPublicKey(PublicKey);

impl PeerPublicKey {
    /// Import from a JWK, checking key type, curve and length.
    pub fn from_jwk(jwk: &PublicKeyJwk) -> Result<Self> {
        if jwk.kty != "OKP" || jwk.crv != "X25519" {
            return Err(ProtocolError::InvalidPublicKey(format!(
                "unsupported key type {}/{}",
                jwk.kty, jwk.crv
            )));
        }
        let raw = URL_SAFE_NO_PAD.decode(jwk.x.trim_end_matches('='))?;
        let bytes: [u8; KEY_LENGTH] = raw.as_slice().try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                raw.len()
            ))
        })?;
        Ok(Self(PublicKey::from(bytes)))
    }

    /// Export as a JWK.
    pub fn to_jwk(&self) -> PublicKeyJwk {
        PublicKeyJwk {
            kty: "OKP".to_string(),
            crv: "X25519".to_string(),
            x: URL_SAFE_NO_PAD.encode(self.0.as_bytes()),
        }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PeerPublicKey")
            .field(&URL_SAFE_NO_PAD.encode(self.0.as_bytes()))
            .finish()
    }
}

/// Symmetric key shared with one peer.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_LENGTH]);

impl SharedKey {
    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| ProtocolError::Encryption(e.to_string()))
    }

    /// Encrypt with a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

        Ok(EncryptedPayload {
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt and authenticate.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        if payload.iv.len() != IV_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "iv must be {} bytes, got {}",
                IV_LENGTH,
                payload.iv.len()
            )));
        }
        self.cipher()?
            .decrypt(Nonce::from_slice(&payload.iv), payload.ciphertext.as_slice())
            .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey([REDACTED])")
    }
}
