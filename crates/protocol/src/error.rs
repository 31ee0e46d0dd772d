//! Error types for the protocol crate.

use thiserror::Error;

/// Everything that can go wrong encoding, decoding or sealing a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The frame was not valid JSON, or not the expected shape.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A message had a known type but its payload did not match that type.
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: String, reason: String },

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Wrong key, tampered ciphertext, or a bad IV.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A JWK that is not an X25519 public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// A binary frame without a usable `<transferId>|` prefix.
    #[error("invalid file chunk: {0}")]
    InvalidChunk(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

// Base64 only appears in JWK coordinates
impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidPublicKey(err.to_string())
    }
}
