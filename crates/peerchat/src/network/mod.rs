//! Network module for peer-to-peer connections.
//!
//! This module provides:
//! - The transport seam ([`PeerTransport`], [`DataChannel`], [`TransportFactory`])
//!   that the session machinery is written against
//! - WebRTC implementations of that seam (ICE, SDP, data channels)
//! - The WebSocket signaling client used for the offer/answer exchange
//!
//! Transports never call back into the orchestrator. Every callback is
//! converted into a [`SessionEvent`] and pushed onto one inbox, tagged with
//! the peer id and the session generation that created the transport, so
//! events from a torn-down transport can be recognised and discarded.

pub mod signaling;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod fake;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use protocol::signaling::IceCandidate;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::state::{
    IceConnectionState, PeerConnectionState, SignalingState,
};

/// Boxed future used by the object-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Label of the single application data channel.
pub const CHAT_CHANNEL_LABEL: &str = "chat";

/// Errors raised by a peer transport or its data channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to create transport: {0}")]
    Creation(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("failed to add ICE candidate: {0}")]
    Candidate(String),

    #[error("data channel error: {0}")]
    Channel(String),

    #[error("transport closed")]
    Closed,
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Which side of the offer/answer exchange a description comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A point-to-point transport to one remote peer.
pub trait PeerTransport: Send + Sync {
    /// Create a locally initiated, ordered data channel.
    fn create_data_channel<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, TransportResult<Arc<dyn DataChannel>>>;

    /// Create an offer, apply it as local description and return its SDP.
    fn create_offer(&self) -> BoxFuture<'_, TransportResult<String>>;

    /// Create an answer, apply it as local description and return its SDP.
    fn create_answer(&self) -> BoxFuture<'_, TransportResult<String>>;

    /// Apply the remote description.
    fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> BoxFuture<'_, TransportResult<()>>;

    /// Whether a remote description has been applied.
    fn has_remote_description(&self) -> BoxFuture<'_, bool>;

    /// Add a remote ICE candidate. Requires a remote description.
    fn add_ice_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, TransportResult<()>>;

    /// Current SDP signaling state.
    fn signaling_state(&self) -> SignalingState;

    /// Close the transport and every channel on it.
    fn close(&self) -> BoxFuture<'_, TransportResult<()>>;
}

/// An ordered, reliable message channel on a transport.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Bytes queued locally and not yet handed to the network.
    fn buffered_amount(&self) -> BoxFuture<'_, usize>;

    fn send_text(&self, text: String) -> BoxFuture<'_, TransportResult<()>>;

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, TransportResult<()>>;

    fn close(&self) -> BoxFuture<'_, TransportResult<()>>;
}

/// Creates transports wired to an event sink.
pub trait TransportFactory: Send + Sync {
    fn create(&self, sink: EventSink) -> BoxFuture<'_, TransportResult<Arc<dyn PeerTransport>>>;
}

/// Error reported by a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    /// Error class, e.g. `OperationError`.
    pub name: String,
    pub message: String,
}

impl ChannelError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The remote side aborting the association right after a transfer
    /// surfaces as an `OperationError` with a "User-Initiated Abort" message.
    /// It is not a fault of the local session.
    pub fn is_benign_abort(&self) -> bool {
        self.name == "OperationError" && self.message.contains("User-Initiated Abort")
    }
}

/// Message received on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Callback from a transport, as a value.
#[derive(Clone)]
pub enum TransportEvent {
    /// Locally gathered candidate; `None` ends gathering.
    LocalCandidate(Option<IceCandidate>),
    IceConnectionState(IceConnectionState),
    ConnectionState(PeerConnectionState),
    SignalingState(SignalingState),
    /// The remote side opened a channel.
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClose,
    ChannelError(ChannelError),
    ChannelMessage(ChannelMessage),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::IceConnectionState(s) => {
                f.debug_tuple("IceConnectionState").field(s).finish()
            }
            TransportEvent::ConnectionState(s) => {
                f.debug_tuple("ConnectionState").field(s).finish()
            }
            TransportEvent::SignalingState(s) => f.debug_tuple("SignalingState").field(s).finish(),
            TransportEvent::IncomingChannel(c) => {
                f.debug_tuple("IncomingChannel").field(&c.label()).finish()
            }
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelClose => f.write_str("ChannelClose"),
            TransportEvent::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
            TransportEvent::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
        }
    }
}

/// A transport event tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Where a transport delivers its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(
        peer_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Push an event. Dropped silently once the orchestrator is gone.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(SessionEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

// Re-export key types
pub use self::webrtc::{IceServer, WebRtcConfig, WebRtcTransportFactory};
pub use signaling::{
    ConnectionState as SignalingConnectionState, SignalingClient, SignalingConfig, SignalingError,
    SignalingEvent, WebSocketSignalingClient,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_abort_predicate() {
        let benign = ChannelError::new(
            "OperationError",
            "User-Initiated Abort, reason=Close called",
        );
        assert!(benign.is_benign_abort());
    }

    #[test]
    fn test_other_errors_are_not_benign() {
        assert!(!ChannelError::new("OperationError", "SCTP failure").is_benign_abort());
        assert!(!ChannelError::new("NetworkError", "User-Initiated Abort").is_benign_abort());
        assert!(!ChannelError::new("OperationError", "user-initiated abort").is_benign_abort());
    }

    #[tokio::test]
    async fn test_event_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("bob", 7, tx);
        sink.emit(TransportEvent::ChannelOpen);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_id, "bob");
        assert_eq!(event.generation, 7);
        assert!(matches!(event.event, TransportEvent::ChannelOpen));
    }

    #[test]
    fn test_event_sink_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        EventSink::new("bob", 1, tx).emit(TransportEvent::ChannelClose);
    }
}
