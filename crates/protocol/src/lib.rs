//! # PeerChat Protocol Library
//!
//! This crate provides the wire formats and cryptographic primitives shared
//! by every PeerChat component.
//!
//! ## Overview
//!
//! - **Signaling**: envelopes exchanged through the rendezvous relay
//!   (register, offer, answer, candidate, error, busy, user_disconnected)
//! - **Application Messages**: the tagged union carried over a peer data
//!   channel, including the `encrypted` wrapper
//! - **Chunk Framing**: binary file chunks prefixed with their transfer id
//! - **Crypto**: X25519 key agreement, HKDF-SHA256, AES-256-GCM
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  JSON {type, payload}
//! ├─────────────────────────────────────────┤
//! │           Payload Encryption            │  AES-256-GCM, per-peer key
//! ├─────────────────────────────────────────┤
//! │      Data Channel (WebRTC, ordered)     │  text frames + binary chunks
//! ├─────────────────────────────────────────┤
//! │   Signaling Relay (WebSocket, JSON)     │  offer / answer / candidates
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_frame, AppMessage, InboundFrame, KeyPair};
//!
//! let alice = KeyPair::generate();
//! let bob = KeyPair::generate();
//! let key = alice.derive_shared_key(&bob.public_key()).unwrap();
//!
//! let plaintext = AppMessage::text("hi").to_json_bytes().unwrap();
//! let sealed = key.encrypt(&plaintext).unwrap();
//! let wire = protocol::encode_encrypted(&sealed).unwrap();
//!
//! assert!(matches!(decode_frame(&wire).unwrap(), InboundFrame::Encrypted(_)));
//! ```
//!
//! ## Modules
//!
//! - [`signaling`]: Relay envelopes
//! - [`messages`]: Data-channel message definitions
//! - [`framing`]: File chunk framing
//! - [`crypto`]: Key agreement and payload encryption
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;
pub mod signaling;

pub use crypto::{KeyPair, PeerPublicKey, PublicKeyJwk, SharedKey, IV_LENGTH, KEY_LENGTH};
pub use error::{ProtocolError, Result};
pub use framing::{
    chunk_frames, decode_chunk, encode_chunk, FileChunk, CHUNK_SEPARATOR, FILE_CHUNK_SIZE,
    TRANSFER_ID_SEARCH_WINDOW,
};
pub use messages::{
    decode_decrypted, decode_frame, encode_encrypted, AppMessage, EncryptedPayload, InboundFrame,
    MessageKind,
};
pub use signaling::{IceCandidate, SignalEnvelope, SignalMessage};
