//! Data-channel application messages.
//!
//! Every text frame on a peer data channel is a JSON object of the form
//! `{"type": ..., "payload": {...}}`. [`AppMessage`] is the tagged union of all
//! known types. The `encrypted` wrapper is handled separately by
//! [`decode_frame`] and [`encode_encrypted`] because its payload is opaque until
//! a shared key decrypts it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ProtocolError, Result};

/// Wire name of the encrypted envelope type.
pub const ENCRYPTED_TYPE: &str = "encrypted";

/// Application message exchanged over an open data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AppMessage {
    /// Chat text.
    #[serde(rename = "text")]
    Text(TextPayload),
    /// Announces an incoming file transfer.
    #[serde(rename = "fileMeta")]
    FileMeta(FileMeta),
    /// Typing indicator.
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    /// Public key for shared-key derivation.
    #[serde(rename = "publicKey")]
    PublicKey(PublicKeyPayload),
    /// Friend request from the sender.
    #[serde(rename = "friend_request")]
    FriendRequest(FriendRequestPayload),
    /// Acceptance of an outstanding friend request.
    #[serde(rename = "friend_accept")]
    FriendAccept(FriendAcceptPayload),
    /// Refusal of an outstanding friend request.
    #[serde(rename = "friend_decline")]
    FriendDecline(FriendDeclinePayload),
    /// Withdrawal of a friend request previously sent.
    #[serde(rename = "friend_cancel")]
    FriendCancel(FriendCancelPayload),
    /// Receiver confirms a completed file transfer.
    #[serde(rename = "file_ack")]
    FileAck(FileAckPayload),
    /// Receiver does not know the sender as a contact.
    #[serde(rename = "not_friend_error")]
    NotFriendError(NotFriendErrorPayload),
    /// Display metadata broadcast.
    #[serde(rename = "profile_info")]
    ProfileInfo(ProfileInfoPayload),
}

/// Discriminant of [`AppMessage`], usable before the payload is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    FileMeta,
    Typing,
    PublicKey,
    FriendRequest,
    FriendAccept,
    FriendDecline,
    FriendCancel,
    FileAck,
    NotFriendError,
    ProfileInfo,
}

impl MessageKind {
    /// All known kinds in wire order.
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Text,
        MessageKind::FileMeta,
        MessageKind::Typing,
        MessageKind::PublicKey,
        MessageKind::FriendRequest,
        MessageKind::FriendAccept,
        MessageKind::FriendDecline,
        MessageKind::FriendCancel,
        MessageKind::FileAck,
        MessageKind::NotFriendError,
        MessageKind::ProfileInfo,
    ];

    /// The `type` string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::FileMeta => "fileMeta",
            MessageKind::Typing => "typing",
            MessageKind::PublicKey => "publicKey",
            MessageKind::FriendRequest => "friend_request",
            MessageKind::FriendAccept => "friend_accept",
            MessageKind::FriendDecline => "friend_decline",
            MessageKind::FriendCancel => "friend_cancel",
            MessageKind::FileAck => "file_ack",
            MessageKind::NotFriendError => "not_friend_error",
            MessageKind::ProfileInfo => "profile_info",
        }
    }

    /// Look up a kind by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether messages of this kind are always sent without encryption.
    ///
    /// Key exchange and the friend workflow must be readable by a peer that
    /// holds no shared key yet. `file_ack` is deliberately absent.
    pub fn is_plaintext_exempt(self) -> bool {
        matches!(
            self,
            MessageKind::PublicKey
                | MessageKind::FriendRequest
                | MessageKind::FriendAccept
                | MessageKind::FriendDecline
                | MessageKind::FriendCancel
                | MessageKind::NotFriendError
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Chat text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
}

/// Metadata announcing a file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    /// Identifier prefixed to every binary chunk of this transfer.
    pub transfer_id: String,
    /// Original file name.
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// MIME type, empty when unknown.
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(default)]
    pub is_typing: bool,
}

/// Public key in JWK form. The object is kept opaque at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKeyPayload {
    pub jwk: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestPayload {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendAcceptPayload {
    pub acceptor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendDeclinePayload {
    pub decliner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendCancelPayload {
    pub canceller_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAckPayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFriendErrorPayload {
    pub sender_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfoPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ProfileInfoPayload {
    /// A profile broadcast carries at least one field.
    pub fn is_empty(&self) -> bool {
        self.nickname.is_none() && self.avatar.is_none()
    }
}

/// AES-GCM output as carried inside an `encrypted` envelope.
///
/// Both fields serialize as JSON number arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

// ============================================================================
// Encoding / decoding
// ============================================================================

impl AppMessage {
    /// Convenience constructor for a text message.
    pub fn text(text: impl Into<String>) -> Self {
        AppMessage::Text(TextPayload { text: text.into() })
    }

    /// The discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            AppMessage::Text(_) => MessageKind::Text,
            AppMessage::FileMeta(_) => MessageKind::FileMeta,
            AppMessage::Typing(_) => MessageKind::Typing,
            AppMessage::PublicKey(_) => MessageKind::PublicKey,
            AppMessage::FriendRequest(_) => MessageKind::FriendRequest,
            AppMessage::FriendAccept(_) => MessageKind::FriendAccept,
            AppMessage::FriendDecline(_) => MessageKind::FriendDecline,
            AppMessage::FriendCancel(_) => MessageKind::FriendCancel,
            AppMessage::FileAck(_) => MessageKind::FileAck,
            AppMessage::NotFriendError(_) => MessageKind::NotFriendError,
            AppMessage::ProfileInfo(_) => MessageKind::ProfileInfo,
        }
    }

    /// Serialize to the JSON text sent on the channel.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Serialize to JSON bytes, the plaintext fed to encryption.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Wrap an encrypted payload in its outer envelope.
pub fn encode_encrypted(payload: &EncryptedPayload) -> Result<String> {
    serde_json::to_string(&json!({ "type": ENCRYPTED_TYPE, "payload": payload }))
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Result of decoding one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Opaque ciphertext that must be decrypted and decoded again.
    Encrypted(EncryptedPayload),
    /// A fully typed application message.
    Message(AppMessage),
    /// Well-formed envelope with a type this build does not know.
    Unknown(String),
}

/// Decode a text frame received on a data channel.
///
/// Input that is not JSON, or JSON without a string `type`, is treated as a
/// plain chat message rather than an error. A known type whose payload does
/// not fit returns [`ProtocolError::MalformedPayload`].
pub fn decode_frame(raw: &str) -> Result<InboundFrame> {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(_) => return Ok(InboundFrame::Message(AppMessage::text(raw))),
    };

    let mut object = match value {
        Value::Object(object) => object,
        Value::String(text) => return Ok(InboundFrame::Message(AppMessage::text(text))),
        _ => return Ok(InboundFrame::Message(AppMessage::text(raw))),
    };

    let kind = match object.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Ok(InboundFrame::Message(AppMessage::text(raw))),
    };
    let payload = match object.remove("payload") {
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(payload) => payload,
    };

    if kind == ENCRYPTED_TYPE {
        let encrypted = serde_json::from_value::<EncryptedPayload>(payload).map_err(|e| {
            ProtocolError::MalformedPayload {
                kind,
                reason: e.to_string(),
            }
        })?;
        return Ok(InboundFrame::Encrypted(encrypted));
    }

    if MessageKind::from_wire(&kind).is_none() {
        return Ok(InboundFrame::Unknown(kind));
    }

    serde_json::from_value::<AppMessage>(json!({ "type": kind, "payload": payload }))
        .map(InboundFrame::Message)
        .map_err(|e| ProtocolError::MalformedPayload {
            kind,
            reason: e.to_string(),
        })
}

/// Decode the plaintext recovered from an `encrypted` envelope.
///
/// A nested `encrypted` envelope is rejected; everything else follows
/// [`decode_frame`].
pub fn decode_decrypted(plaintext: &[u8]) -> Result<InboundFrame> {
    let text = String::from_utf8_lossy(plaintext);
    match decode_frame(&text)? {
        InboundFrame::Encrypted(_) => Err(ProtocolError::MalformedPayload {
            kind: ENCRYPTED_TYPE.to_string(),
            reason: "nested encrypted envelope".to_string(),
        }),
        other => Ok(other),
    }
}
