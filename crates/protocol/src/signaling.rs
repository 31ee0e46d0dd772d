//! Signaling relay envelopes.
//!
//! Control messages travel through the rendezvous relay as
//! `{"type": ..., "from": ..., "payload": {...}}`. The relay injects `from`
//! when forwarding; clients never set it themselves.
//!
//! [`SignalEnvelope`] is the loose wire form so that routing code can look at
//! `type` and `from` without understanding the payload. [`SignalMessage`] is
//! the typed view obtained through [`SignalEnvelope::message`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ProtocolError, Result};

/// A signaling message as it appears on the relay socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Originating peer, filled in by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// Typed signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Binds the socket to a peer id. Must be the first message sent.
    Register(RegisterPayload),
    /// SDP offer for the target peer.
    Offer(SdpPayload),
    /// SDP answer for the target peer.
    Answer(SdpPayload),
    /// Trickled ICE candidate; `None` marks end of candidates.
    Candidate(CandidatePayload),
    /// Relay or peer reported a failure.
    Error(ErrorPayload),
    /// Peer refuses a connection because it is occupied.
    Busy(BusyPayload),
    /// Relay reports that a registered peer went away.
    UserDisconnected(UserDisconnectedPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    pub target_user_id: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub target_user_id: String,
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// An empty candidate string is the legacy end-of-candidates marker.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    /// Older relays name the target with this field instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
}

impl ErrorPayload {
    /// The peer this error is about, if the payload names one.
    pub fn target(&self) -> Option<&str> {
        self.target_user_id
            .as_deref()
            .or(self.target_user.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDisconnectedPayload {
    pub user_id: String,
}

impl SignalMessage {
    /// Wire name of this message type.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Register(_) => "register",
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::Candidate(_) => "candidate",
            SignalMessage::Error(_) => "error",
            SignalMessage::Busy(_) => "busy",
            SignalMessage::UserDisconnected(_) => "user_disconnected",
        }
    }

    /// The peer a client-originated message is addressed to.
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer(p) | SignalMessage::Answer(p) => Some(&p.target_user_id),
            SignalMessage::Candidate(p) => Some(&p.target_user_id),
            SignalMessage::Busy(p) => p.target_user_id.as_deref(),
            _ => None,
        }
    }

    /// Wrap into an envelope, optionally stamping the sender.
    pub fn into_envelope(self, from: Option<String>) -> Result<SignalEnvelope> {
        let mut value =
            serde_json::to_value(&self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(SignalEnvelope {
            kind: self.kind().to_string(),
            from,
            payload,
        })
    }
}

impl SignalEnvelope {
    /// Parse an envelope from relay text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to relay text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode the typed message carried by this envelope.
    pub fn message(&self) -> Result<SignalMessage> {
        let payload = match &self.payload {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(json!({ "type": self.kind, "payload": payload })).map_err(|e| {
            ProtocolError::MalformedPayload {
                kind: self.kind.clone(),
                reason: e.to_string(),
            }
        })
    }
}
