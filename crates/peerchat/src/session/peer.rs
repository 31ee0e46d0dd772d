//! One peer session: transport, channel, candidate queue and keys.
//!
//! A [`PeerSession`] is created for one connection attempt and discarded by
//! [`PeerSession::teardown`]. Everything that belongs to the attempt lives
//! here so that a single teardown releases all of it.

use std::collections::VecDeque;
use std::sync::Arc;

use protocol::signaling::IceCandidate;
use protocol::SharedKey;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::state::{
    derive_session_state, ChannelState, ContactPresence, SessionState, SubSignals,
};
use crate::network::{DataChannel, PeerTransport, TransportError};

/// Why a connect attempt did not produce an open channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("peer id must not be empty")]
    EmptyPeerId,

    #[error("already connecting to {0}")]
    AlreadyConnecting(String),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("signaling unavailable: {0}")]
    Signaling(String),

    #[error("ICE negotiation failed")]
    IceFailed,

    #[error("peer connection failed")]
    ConnectionFailed,

    #[error("connection closed before the channel opened")]
    ClosedBeforeOpen,

    #[error("data channel error: {0}")]
    Channel(String),

    #[error("{0} is busy")]
    Busy(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("connection reset: {0}")]
    Aborted(String),
}

/// Outcome delivered to a waiting `connect` call.
pub type ConnectOutcome = Result<Arc<dyn DataChannel>, ConnectError>;

/// A state change caused by a transport signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

impl Transition {
    /// The session just became unusable and must be torn down.
    pub fn entered_terminal(&self) -> bool {
        self.to.is_terminal() && !self.from.is_terminal()
    }
}

/// Connection state for one remote peer.
pub struct PeerSession {
    peer_id: String,
    /// Distinguishes this attempt from earlier ones for the same peer.
    generation: u64,
    state: SessionState,
    signals: SubSignals,
    transport: Option<Arc<dyn PeerTransport>>,
    channel: Option<Arc<dyn DataChannel>>,
    making_offer: bool,
    pending_candidates: VecDeque<IceCandidate>,
    shared_key: Option<SharedKey>,
    peer_public_key: Option<Value>,
    connect_waiter: Option<oneshot::Sender<ConnectOutcome>>,
    connect_timeout: Option<JoinHandle<()>>,
    /// Last reply waiting on channel backpressure; later replies queue behind it.
    reply_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("signals", &self.signals)
            .field("has_transport", &self.transport.is_some())
            .field("has_channel", &self.channel.is_some())
            .field("making_offer", &self.making_offer)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("has_key", &self.shared_key.is_some())
            .field("queued_replies", &self.has_queued_replies())
            .finish()
    }
}

impl PeerSession {
    pub fn new(peer_id: impl Into<String>, generation: u64) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            state: SessionState::New,
            signals: SubSignals::default(),
            transport: None,
            channel: None,
            making_offer: false,
            pending_candidates: VecDeque::new(),
            shared_key: None,
            peer_public_key: None,
            connect_waiter: None,
            connect_timeout: None,
            reply_task: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn signals(&self) -> &SubSignals {
        &self.signals
    }

    /// Marks the start of negotiation.
    pub fn begin_connecting(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Connecting;
        }
    }

    pub fn transport(&self) -> Option<&Arc<dyn PeerTransport>> {
        self.transport.as_ref()
    }

    pub fn attach_transport(&mut self, transport: Arc<dyn PeerTransport>) {
        self.transport = Some(transport);
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref()
    }

    pub fn attach_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.channel = Some(channel);
    }

    /// The channel, if it is open.
    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.as_ref().filter(|c| c.is_open()).cloned()
    }

    pub fn is_channel_open(&self) -> bool {
        self.open_channel().is_some()
    }

    /// Connected with an open channel.
    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Connected && self.is_channel_open()
    }

    pub fn presence(&self) -> ContactPresence {
        ContactPresence::project(self.state, self.is_channel_open())
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn set_making_offer(&mut self, making_offer: bool) {
        self.making_offer = making_offer;
    }

    /// Apply a sub-signal change and re-derive the session state.
    ///
    /// Returns the transition if the state changed.
    pub fn update_signals(&mut self, update: impl FnOnce(&mut SubSignals)) -> Option<Transition> {
        update(&mut self.signals);
        let next = derive_session_state(self.state, &self.signals);
        if next == self.state {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to: next,
        };
        tracing::debug!(
            peer = %self.peer_id,
            generation = self.generation,
            from = %transition.from,
            to = %transition.to,
            "session state changed"
        );
        self.state = next;
        Some(transition)
    }

    /// Record the channel becoming open or closed.
    pub fn set_channel_state(&mut self, channel: ChannelState) -> Option<Transition> {
        self.update_signals(|s| s.channel = channel)
    }

    // ------------------------------------------------------------------------
    // Candidate queue
    // ------------------------------------------------------------------------

    /// Queue a remote candidate that arrived before the remote description.
    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push_back(candidate);
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Take every queued candidate in arrival order.
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending_candidates.drain(..).collect()
    }

    // ------------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------------

    pub fn shared_key(&self) -> Option<&SharedKey> {
        self.shared_key.as_ref()
    }

    pub fn peer_public_key(&self) -> Option<&Value> {
        self.peer_public_key.as_ref()
    }

    pub fn set_keys(&mut self, peer_public_key: Value, shared_key: SharedKey) {
        self.peer_public_key = Some(peer_public_key);
        self.shared_key = Some(shared_key);
    }

    // ------------------------------------------------------------------------
    // Connect settlement
    // ------------------------------------------------------------------------

    pub fn install_waiter(&mut self, waiter: oneshot::Sender<ConnectOutcome>) {
        self.connect_waiter = Some(waiter);
    }

    pub fn has_waiter(&self) -> bool {
        self.connect_waiter.is_some()
    }

    pub fn set_connect_timeout(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.connect_timeout.replace(handle) {
            previous.abort();
        }
    }

    /// Whether a reply is still waiting for the channel to drain.
    pub fn has_queued_replies(&self) -> bool {
        self.reply_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn take_reply_task(&mut self) -> Option<JoinHandle<()>> {
        self.reply_task.take()
    }

    pub fn set_reply_task(&mut self, handle: JoinHandle<()>) {
        self.reply_task = Some(handle);
    }

    /// Settle the pending connect, if any. Clears the timeout.
    ///
    /// Returns `false` when there was nothing left to settle.
    pub fn settle(&mut self, outcome: ConnectOutcome) -> bool {
        if let Some(timeout) = self.connect_timeout.take() {
            timeout.abort();
        }
        match self.connect_waiter.take() {
            Some(waiter) => {
                // The caller may have stopped waiting
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Close and release everything this session owns.
    ///
    /// Safe to call any number of times. Ends in `Disconnected` with no
    /// transport, channel, candidates, keys, offer flag or timeout. A pending
    /// connect is rejected with `reason` after the resources are released.
    pub async fn teardown(&mut self, reason: ConnectError) -> bool {
        let channel = self.channel.take();
        let transport = self.transport.take();
        let had_resources = channel.is_some() || transport.is_some();

        if let Some(replies) = self.reply_task.take() {
            replies.abort();
        }

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                tracing::debug!(peer = %self.peer_id, error = %e, "error closing data channel");
            }
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::debug!(peer = %self.peer_id, error = %e, "error closing transport");
            }
        }

        self.pending_candidates.clear();
        self.making_offer = false;
        self.shared_key = None;
        self.peer_public_key = None;
        self.state = SessionState::Disconnected;
        self.settle(Err(reason));

        had_resources
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(timeout) = self.connect_timeout.take() {
            timeout.abort();
        }
        if let Some(replies) = self.reply_task.take() {
            replies.abort();
        }
    }
}
