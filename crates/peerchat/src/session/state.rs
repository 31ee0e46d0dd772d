//! Session state and its derivation from transport sub-states.
//!
//! A peer transport reports three independent state machines (ICE, overall
//! connection, SDP signaling) and the data channel reports its own readiness.
//! [`derive_session_state`] folds these into a single [`SessionState`]. It is a
//! pure function so that every combination can be tested without a network.

use std::fmt;

/// Lifecycle of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Created, nothing negotiated yet.
    #[default]
    New,
    /// Negotiation in progress or channel not yet open.
    Connecting,
    /// Transport connected and channel open.
    Connected,
    /// Transport lost connectivity.
    Disconnected,
    /// Transport reported failure.
    Failed,
    /// Transport or signaling closed.
    Closed,
}

impl SessionState {
    /// Terminal states are only left by tearing down and recreating the session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }

    /// Connected or connecting.
    pub fn is_active_or_pending(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Connecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE agent connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Aggregate peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// SDP offer/answer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Data channel readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    /// No channel yet, or created but not open.
    #[default]
    Pending,
    Open,
    Closed,
}

/// Latest value of every sub-signal for one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubSignals {
    pub ice: IceConnectionState,
    pub connection: PeerConnectionState,
    pub signaling: SignalingState,
    pub channel: ChannelState,
}

/// Reduce the sub-signals to a session state.
///
/// Rules, first match wins:
/// 1. Terminal states are sticky.
/// 2. ICE or overall `failed` gives `failed`.
/// 3. ICE or overall `closed`/`disconnected` gives `disconnected` for an
///    established session, otherwise the reported state itself.
/// 4. Signaling `closed` or channel `closed` gives `closed`.
/// 5. Overall `connected` with an open channel gives `connected`.
/// 6. Overall `connected` without an open channel, or overall `connecting`,
///    gives `connecting`.
/// 7. Otherwise the current state is kept.
pub fn derive_session_state(current: SessionState, signals: &SubSignals) -> SessionState {
    if current.is_terminal() {
        return current;
    }

    if signals.ice == IceConnectionState::Failed
        || signals.connection == PeerConnectionState::Failed
    {
        return SessionState::Failed;
    }

    let lost = match (signals.connection, signals.ice) {
        (PeerConnectionState::Closed, _) | (_, IceConnectionState::Closed) => {
            Some(SessionState::Closed)
        }
        (PeerConnectionState::Disconnected, _) | (_, IceConnectionState::Disconnected) => {
            Some(SessionState::Disconnected)
        }
        _ => None,
    };
    if let Some(lost) = lost {
        return if current == SessionState::Connected {
            SessionState::Disconnected
        } else {
            lost
        };
    }

    if signals.signaling == SignalingState::Closed || signals.channel == ChannelState::Closed {
        return SessionState::Closed;
    }

    match (signals.connection, signals.channel) {
        (PeerConnectionState::Connected, ChannelState::Open) => SessionState::Connected,
        (PeerConnectionState::Connected, _) | (PeerConnectionState::Connecting, _) => {
            SessionState::Connecting
        }
        _ => current,
    }
}

/// Presence of a contact as projected from its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContactPresence {
    #[default]
    Offline,
    Connecting,
    Online,
}

impl ContactPresence {
    /// Online only when the session is connected and the channel is open.
    pub fn project(state: SessionState, channel_open: bool) -> Self {
        match state {
            SessionState::Connected if channel_open => ContactPresence::Online,
            SessionState::Connected | SessionState::Connecting => ContactPresence::Connecting,
            _ => ContactPresence::Offline,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContactPresence::Offline => "offline",
            ContactPresence::Connecting => "connecting",
            ContactPresence::Online => "online",
        }
    }
}

impl fmt::Display for ContactPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
