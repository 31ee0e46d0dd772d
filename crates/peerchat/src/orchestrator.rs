//! Connection orchestrator for wiring together all components.
//!
//! The [`ConnectionOrchestrator`] is the public surface of the chat core. It
//! owns the session registry and runs a single event loop that consumes
//! signaling messages, transport events and connect timeouts. Every state
//! change for a peer happens while holding the registry lock, so the loop and
//! the public API never race each other on the same session. Sends that have
//! to wait for a congested channel never hold the lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::messages::{
    FileMeta, FriendAcceptPayload, FriendCancelPayload, FriendDeclinePayload,
    FriendRequestPayload, ProfileInfoPayload, PublicKeyPayload, TypingPayload,
};
use protocol::signaling::{CandidatePayload, IceCandidate, SdpPayload};
use protocol::{encode_chunk, encode_encrypted, AppMessage, ProtocolError, SharedKey, SignalMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::contacts::{Contact, ContactBook, FriendStatus, PendingRequest};
use crate::crypto::CryptoProvider;
use crate::files::new_transfer_id;
use crate::network::signaling::{ConnectionState, SignalingClient, SignalingEvent};
use crate::network::{
    ChannelMessage, DataChannel, EventSink, PeerTransport, SdpKind, SessionEvent,
    TransportError, TransportEvent, TransportFactory, CHAT_CHANNEL_LABEL,
};
use crate::notifier::{UiNotifier, PROGRESS_FAILED};
use crate::router::{MessageRouter, RouteContext, RouterAction};
use crate::session::state::{IceConnectionState, SignalingState};
use crate::session::{
    ChannelState, ConnectError, ContactPresence, PeerSession, SessionRegistry, SessionState,
    Transition,
};
use crate::storage::{Direction, MessageStore, StorageError, StoredMessage};

/// Sends wait while more than this many bytes are queued on the channel.
const BUFFER_THRESHOLD: usize = 1024 * 1024;

/// How often a blocked send re-checks the buffered amount.
const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default time allowed for a connect attempt to open its channel.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, connecting to signaling.
    Starting,
    /// Running and handling events.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Errors returned by the send and contact operations.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no open data channel to {0}")]
    ChannelNotOpen(String),

    #[error("data channel closed while waiting to send")]
    ChannelClosed,

    #[error("{0}")]
    InvalidPeer(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to update history: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to save contacts: {0}")]
    Contacts(String),
}

/// Tunables and identity for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub local_id: String,
    /// Sent to every peer as `profile_info` when a channel opens.
    pub profile: ProfileInfoPayload,
    pub connect_timeout: Duration,
    pub chunk_size: usize,
    pub max_file_size: u64,
    /// Where completed incoming files are written. `None` keeps them in memory.
    pub download_dir: Option<PathBuf>,
}

impl OrchestratorOptions {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            profile: ProfileInfoPayload::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            chunk_size: protocol::FILE_CHUNK_SIZE,
            max_file_size: 100 * 1024 * 1024,
            download_dir: None,
        }
    }

    pub fn from_config(config: &Config, local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            profile: ProfileInfoPayload {
                nickname: config.profile.nickname.clone(),
                avatar: config.profile.avatar.clone(),
            },
            connect_timeout: Duration::from_secs(config.network.connect_timeout_secs),
            chunk_size: config.files.chunk_size,
            max_file_size: config.files.max_file_size,
            download_dir: Some(config.files.download_dir.clone()),
        }
    }
}

/// Collaborators the orchestrator is built from.
pub struct Components {
    pub signaling: Arc<dyn SignalingClient>,
    pub transports: Arc<dyn TransportFactory>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub contacts: Arc<ContactBook>,
    pub store: Arc<dyn MessageStore>,
    pub notifier: Arc<dyn UiNotifier>,
}

struct Inboxes {
    sessions: mpsc::UnboundedReceiver<SessionEvent>,
    timeouts: mpsc::UnboundedReceiver<(String, u64)>,
}

/// Keeps at most one session per peer and drives it to an open channel.
pub struct ConnectionOrchestrator {
    options: OrchestratorOptions,
    signaling: Arc<dyn SignalingClient>,
    transports: Arc<dyn TransportFactory>,
    crypto: Arc<dyn CryptoProvider>,
    contacts: Arc<ContactBook>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn UiNotifier>,
    router: MessageRouter,
    registry: tokio::sync::Mutex<SessionRegistry>,
    state: RwLock<OrchestratorState>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    timeout_tx: mpsc::UnboundedSender<(String, u64)>,
    inboxes: Mutex<Option<Inboxes>>,
    shutdown_token: CancellationToken,
}

impl ConnectionOrchestrator {
    /// Creates a new orchestrator. Nothing runs until [`start`](Self::start).
    pub fn new(options: OrchestratorOptions, components: Components) -> Self {
        let Components {
            signaling,
            transports,
            crypto,
            contacts,
            store,
            notifier,
        } = components;

        let router = MessageRouter::new(
            options.local_id.clone(),
            Arc::clone(&contacts),
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&crypto),
            options.max_file_size,
            options.download_dir.clone(),
        );

        let (event_tx, sessions) = mpsc::unbounded_channel();
        let (timeout_tx, timeouts) = mpsc::unbounded_channel();

        Self {
            options,
            signaling,
            transports,
            crypto,
            contacts,
            store,
            notifier,
            router,
            registry: tokio::sync::Mutex::new(SessionRegistry::new()),
            state: RwLock::new(OrchestratorState::Stopped),
            event_tx,
            timeout_tx,
            inboxes: Mutex::new(Some(Inboxes { sessions, timeouts })),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.options.local_id
    }

    /// Returns the current lifecycle state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn contacts(&self) -> &Arc<ContactBook> {
        &self.contacts
    }

    /// The local public key as a JWK, for display.
    pub fn public_key_jwk(&self) -> serde_json::Value {
        self.crypto.public_key_jwk()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the event loop and connects to signaling.
    ///
    /// A failed signaling connection is reported but does not fail startup;
    /// the signaling client retries on its own when configured to.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        let inboxes = self
            .inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("Orchestrator cannot be restarted after shutdown")?;

        info!(local_id = %self.options.local_id, "starting connection orchestrator");
        tokio::spawn(Arc::clone(self).run(inboxes));

        if let Err(e) = self.signaling.connect(&self.options.local_id).await {
            warn!(error = %e, "initial signaling connection failed");
            self.notifier.on_system_message(
                &format!("Could not reach the signaling server: {e}"),
                None,
                true,
            );
        }

        *self.state.write().await = OrchestratorState::Running;
        Ok(())
    }

    /// Tears down every session and closes signaling.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if matches!(
                *state,
                OrchestratorState::Stopped | OrchestratorState::ShuttingDown
            ) {
                return;
            }
            *state = OrchestratorState::ShuttingDown;
        }
        info!("stopping connection orchestrator");
        self.shutdown_token.cancel();

        let peers = self
            .registry
            .lock()
            .await
            .reset_all(ConnectError::Aborted("shutting down".into()))
            .await;
        for peer in &peers {
            self.router.discard_transfers(peer);
        }
        for peer in self.contacts.set_all_offline() {
            self.notifier
                .on_contact_status(&peer, ContactPresence::Offline);
        }
        if let Err(e) = self.signaling.close().await {
            debug!(error = %e, "error closing signaling");
        }
        if let Err(e) = self.contacts.save() {
            warn!(error = %e, "failed to save contacts on shutdown");
        }

        *self.state.write().await = OrchestratorState::Stopped;
    }

    async fn run(self: Arc<Self>, mut inboxes: Inboxes) {
        // A client that hands out no receiver still leaves the loop pending
        let (_keepalive, fallback) = mpsc::channel(1);
        let mut signaling_events = self.signaling.events().unwrap_or(fallback);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("orchestrator loop received shutdown signal");
                    break;
                }
                Some(event) = inboxes.sessions.recv() => {
                    self.handle_session_event(event).await;
                }
                Some((peer_id, generation)) = inboxes.timeouts.recv() => {
                    self.handle_connect_timeout(&peer_id, generation).await;
                }
                Some(event) = signaling_events.recv() => {
                    self.handle_signaling_event(event).await;
                }
            }
        }
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    /// Resolve with an open channel to `peer_id`, dialing if needed.
    ///
    /// An already usable session resolves immediately. A second call while
    /// an attempt is in flight is rejected instead of starting another one.
    pub async fn connect_to_peer(
        &self,
        peer_id: &str,
    ) -> Result<Arc<dyn DataChannel>, ConnectError> {
        if peer_id.is_empty() {
            return Err(ConnectError::EmptyPeerId);
        }

        let waiter = {
            let mut registry = self.registry.lock().await;
            if let Some(session) = registry.get(peer_id) {
                if let Some(channel) = session.open_channel().filter(|_| session.is_usable()) {
                    return Ok(channel);
                }
                if session.state() == SessionState::Connecting {
                    return Err(ConnectError::AlreadyConnecting(peer_id.to_string()));
                }
            }

            info!(peer = %peer_id, "connecting to peer");
            self.notifier.on_system_message(
                &format!("Connecting to {}...", self.display_name(peer_id)),
                Some(peer_id),
                false,
            );

            let (tx, rx) = oneshot::channel();
            let started = {
                let session = registry.recreate(peer_id).await;
                session.begin_connecting();
                session.install_waiter(tx);
                let timeout = self.spawn_connect_timeout(peer_id, session.generation());
                session.set_connect_timeout(timeout);
                self.start_offer(session).await
            };

            match started {
                Ok(()) => self.set_presence(peer_id, ContactPresence::Connecting),
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "failed to start connection");
                    self.notifier.on_system_message(
                        &format!("Could not connect to {}: {e}", self.display_name(peer_id)),
                        Some(peer_id),
                        true,
                    );
                    self.reset_locked(&mut registry, peer_id, e).await;
                }
            }
            rx
        };

        waiter
            .await
            .unwrap_or_else(|_| Err(ConnectError::Aborted("connect attempt dropped".into())))
    }

    /// Close the session with `peer_id`, if any, and mark the contact offline.
    pub async fn disconnect_from_peer(&self, peer_id: &str) {
        let mut registry = self.registry.lock().await;
        if registry.contains(peer_id) {
            self.notifier.on_system_message(
                &format!("Disconnected from {}", self.display_name(peer_id)),
                Some(peer_id),
                false,
            );
            self.reset_locked(
                &mut registry,
                peer_id,
                ConnectError::Aborted("disconnected by user".into()),
            )
            .await;
        } else {
            self.contacts.set_presence(peer_id, ContactPresence::Offline);
            self.notifier
                .on_contact_status(peer_id, ContactPresence::Offline);
        }
    }

    /// Release everything held for `peer_id`. Idempotent.
    pub async fn reset_peer_connection(&self, peer_id: &str, reason: &str) {
        let mut registry = self.registry.lock().await;
        self.reset_locked(&mut registry, peer_id, ConnectError::Aborted(reason.into()))
            .await;
    }

    pub async fn session_state(&self, peer_id: &str) -> Option<SessionState> {
        self.registry.lock().await.state_of(peer_id)
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.registry
            .lock()
            .await
            .get(peer_id)
            .is_some_and(PeerSession::is_usable)
    }

    async fn start_offer(&self, session: &mut PeerSession) -> Result<(), ConnectError> {
        let transport = self.create_transport(session).await?;
        let channel = transport.create_data_channel(CHAT_CHANNEL_LABEL).await?;
        session.attach_channel(channel);

        session.set_making_offer(true);
        let sdp = transport.create_offer().await?;
        self.signal(SignalMessage::Offer(SdpPayload {
            target_user_id: session.peer_id().to_string(),
            sdp,
        }))
        .await
    }

    async fn create_transport(
        &self,
        session: &mut PeerSession,
    ) -> Result<Arc<dyn PeerTransport>, ConnectError> {
        let sink = EventSink::new(
            session.peer_id(),
            session.generation(),
            self.event_tx.clone(),
        );
        let transport = self.transports.create(sink).await?;
        session.attach_transport(Arc::clone(&transport));
        Ok(transport)
    }

    fn spawn_connect_timeout(&self, peer_id: &str, generation: u64) -> JoinHandle<()> {
        let timeout_tx = self.timeout_tx.clone();
        let peer_id = peer_id.to_string();
        let timeout = self.options.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timeout_tx.send((peer_id, generation));
        })
    }

    async fn signal(&self, message: SignalMessage) -> Result<(), ConnectError> {
        self.signaling
            .send(message)
            .await
            .map_err(|e| ConnectError::Signaling(e.to_string()))
    }

    /// Tear down `peer_id` while the caller holds the registry.
    async fn reset_locked(
        &self,
        registry: &mut SessionRegistry,
        peer_id: &str,
        reason: ConnectError,
    ) {
        if registry.reset(peer_id, reason.clone()).await {
            info!(peer = %peer_id, reason = %reason, "peer connection reset");
        }
        self.router.discard_transfers(peer_id);
        self.set_presence(peer_id, ContactPresence::Offline);
    }

    fn set_presence(&self, peer_id: &str, presence: ContactPresence) {
        if self.contacts.set_presence(peer_id, presence) {
            self.notifier.on_contact_status(peer_id, presence);
        }
    }

    fn display_name(&self, peer_id: &str) -> String {
        self.contacts
            .get(peer_id)
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| peer_id.to_string())
    }

    async fn handle_connect_timeout(&self, peer_id: &str, generation: u64) {
        let mut registry = self.registry.lock().await;
        let pending = registry
            .get(peer_id)
            .is_some_and(|s| s.generation() == generation && s.has_waiter());
        if !pending {
            return;
        }

        warn!(peer = %peer_id, "connect attempt timed out");
        self.notifier.on_system_message(
            &format!("Connection to {} timed out", self.display_name(peer_id)),
            Some(peer_id),
            true,
        );
        self.reset_locked(
            &mut registry,
            peer_id,
            ConnectError::Timeout(peer_id.to_string()),
        )
        .await;
    }

    // ========================================================================
    // Signaling
    // ========================================================================

    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::StateChanged(state) => {
                debug!(?state, "signaling state changed");
                if state == ConnectionState::Connected {
                    info!(local_id = %self.options.local_id, "registered with signaling server");
                }
            }
            SignalingEvent::Disconnected { reason } => self.handle_signaling_lost(&reason).await,
            SignalingEvent::Message(envelope) => {
                let message = match envelope.message() {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(kind = %envelope.kind, error = %e, "dropping malformed signaling message");
                        return;
                    }
                };
                let from = envelope.from.as_deref().filter(|f| !f.is_empty());
                self.handle_signal(from, message).await;
            }
        }
    }

    async fn handle_signal(&self, from: Option<&str>, message: SignalMessage) {
        let needs_sender = matches!(
            message,
            SignalMessage::Offer(_)
                | SignalMessage::Answer(_)
                | SignalMessage::Candidate(_)
                | SignalMessage::Busy(_)
        );
        if needs_sender && from.is_none() {
            warn!(kind = %message.kind(), "signaling message without sender");
            return;
        }
        let sender = from.unwrap_or_default();

        match message {
            SignalMessage::Offer(payload) => self.handle_offer(sender, payload.sdp).await,
            SignalMessage::Answer(payload) => self.handle_answer(sender, payload.sdp).await,
            SignalMessage::Candidate(payload) => {
                self.handle_remote_candidate(sender, payload.candidate)
                    .await
            }
            SignalMessage::Error(payload) => {
                let target = payload.target().or(from).map(str::to_string);
                self.handle_relay_error(target, &payload.message).await;
            }
            SignalMessage::Busy(_) => {
                info!(peer = %sender, "peer is busy");
                self.notifier.on_system_message(
                    &format!("{} is busy", self.display_name(sender)),
                    Some(sender),
                    true,
                );
                self.reset_peer(sender, ConnectError::Busy(sender.to_string()))
                    .await;
            }
            SignalMessage::UserDisconnected(payload) => {
                self.handle_user_disconnected(&payload.user_id).await
            }
            SignalMessage::Register(_) => debug!("ignoring register echoed by the relay"),
        }
    }

    async fn reset_peer(&self, peer_id: &str, reason: ConnectError) {
        let mut registry = self.registry.lock().await;
        self.reset_locked(&mut registry, peer_id, reason).await;
    }

    async fn handle_offer(&self, from: &str, sdp: String) {
        self.notifier.on_system_message(
            &format!("Incoming connection from {}", self.display_name(from)),
            Some(from),
            false,
        );

        let mut registry = self.registry.lock().await;
        if let Some(session) = registry.get(from) {
            let unstable = session
                .transport()
                .is_some_and(|t| t.signaling_state() != SignalingState::Stable);
            if session.is_making_offer() || unstable {
                info!(peer = %from, "ignoring offer that collides with local negotiation");
                return;
            }
        }

        let answered = {
            let session = registry.recreate(from).await;
            session.begin_connecting();
            self.answer_offer(session, sdp).await
        };
        match answered {
            Ok(()) => {
                debug!(peer = %from, "answer sent");
                self.set_presence(from, ContactPresence::Connecting);
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "failed to answer offer");
                self.reset_locked(&mut registry, from, e).await;
            }
        }
    }

    async fn answer_offer(&self, session: &mut PeerSession, sdp: String) -> Result<(), ConnectError> {
        let transport = self.create_transport(session).await?;
        transport.set_remote_description(SdpKind::Offer, sdp).await?;
        self.drain_candidates(session, transport.as_ref()).await;

        let answer = transport.create_answer().await?;
        self.signal(SignalMessage::Answer(SdpPayload {
            target_user_id: session.peer_id().to_string(),
            sdp: answer,
        }))
        .await
    }

    async fn handle_answer(&self, from: &str, sdp: String) {
        let mut registry = self.registry.lock().await;
        let Some(session) = registry.get_mut(from) else {
            warn!(peer = %from, "answer for unknown session");
            return;
        };
        let Some(transport) = session.transport().cloned() else {
            warn!(peer = %from, "answer for session without transport");
            return;
        };

        let signaling_state = transport.signaling_state();
        if !session.is_making_offer() || signaling_state != SignalingState::HaveLocalOffer {
            warn!(peer = %from, state = %signaling_state, "ignoring unexpected answer");
            return;
        }

        match transport.set_remote_description(SdpKind::Answer, sdp).await {
            Ok(()) => {
                session.set_making_offer(false);
                self.drain_candidates(session, transport.as_ref()).await;
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "failed to apply answer");
                self.reset_locked(&mut registry, from, e.into()).await;
            }
        }
    }

    async fn handle_remote_candidate(&self, from: &str, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate.filter(|c| !c.is_end_of_candidates()) else {
            debug!(peer = %from, "remote candidate gathering finished");
            return;
        };

        let mut registry = self.registry.lock().await;
        let Some(session) = registry
            .get_mut(from)
            .filter(|s| s.state().is_active_or_pending())
        else {
            debug!(peer = %from, "dropping candidate for inactive session");
            return;
        };
        let Some(transport) = session.transport().cloned() else {
            debug!(peer = %from, "dropping candidate for session without transport");
            return;
        };

        if !transport.has_remote_description().await {
            session.queue_candidate(candidate);
            debug!(peer = %from, queued = session.pending_candidate_count(), "queued remote candidate");
            return;
        }
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            if transport.signaling_state() != SignalingState::Closed {
                warn!(peer = %from, error = %e, "failed to add remote candidate");
            }
        }
    }

    /// Apply queued candidates in arrival order, then empty the queue.
    async fn drain_candidates(&self, session: &mut PeerSession, transport: &dyn PeerTransport) {
        for candidate in session.take_pending_candidates() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(peer = %session.peer_id(), error = %e, "failed to add queued candidate");
            }
        }
    }

    async fn handle_relay_error(&self, target: Option<String>, message: &str) {
        error!(peer = ?target, message = %message, "signaling server reported an error");
        self.notifier.on_system_message(
            &format!("Signaling error: {message}"),
            target.as_deref(),
            true,
        );
        if let Some(target) = target {
            self.reset_peer(&target, ConnectError::Relay(message.to_string()))
                .await;
        }
    }

    async fn handle_user_disconnected(&self, peer_id: &str) {
        let mut registry = self.registry.lock().await;
        let live = registry
            .state_of(peer_id)
            .is_some_and(SessionState::is_active_or_pending);
        if !live {
            return;
        }
        info!(peer = %peer_id, "peer left the signaling server");
        self.notifier.on_system_message(
            &format!("{} went offline", self.display_name(peer_id)),
            Some(peer_id),
            false,
        );
        self.reset_locked(
            &mut registry,
            peer_id,
            ConnectError::Aborted("peer went offline".into()),
        )
        .await;
    }

    async fn handle_signaling_lost(&self, reason: &str) {
        warn!(reason = %reason, "signaling lost, resetting every peer");
        let peers = self
            .registry
            .lock()
            .await
            .reset_all(ConnectError::Signaling(reason.to_string()))
            .await;
        for peer in &peers {
            self.router.discard_transfers(peer);
        }
        for peer in self.contacts.set_all_offline() {
            self.notifier
                .on_contact_status(&peer, ContactPresence::Offline);
        }
        self.notifier.on_system_message(
            &format!("Lost connection to the signaling server: {reason}"),
            None,
            true,
        );
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    async fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        let SessionEvent {
            peer_id,
            generation,
            event,
        } = event;

        let mut registry = self.registry.lock().await;
        let is_active_chat = registry.is_active_chat(&peer_id);
        let Some(session) = registry.live_mut(&peer_id, generation) else {
            debug!(peer = %peer_id, generation, ?event, "dropping stale transport event");
            return;
        };

        let mut transition = None;
        let mut failure = None;
        let mut connect = false;

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let message = SignalMessage::Candidate(CandidatePayload {
                    target_user_id: peer_id.clone(),
                    candidate,
                });
                if let Err(e) = self.signal(message).await {
                    debug!(peer = %peer_id, error = %e, "failed to relay local candidate");
                }
            }
            TransportEvent::IceConnectionState(ice) => {
                debug!(peer = %peer_id, ?ice, "ICE connection state");
                transition = session.update_signals(|s| s.ice = ice);
            }
            TransportEvent::ConnectionState(connection) => {
                debug!(peer = %peer_id, ?connection, "peer connection state");
                transition = session.update_signals(|s| s.connection = connection);
            }
            TransportEvent::SignalingState(signaling) => {
                transition = session.update_signals(|s| s.signaling = signaling);
            }
            TransportEvent::IncomingChannel(channel) => {
                if channel.label() == CHAT_CHANNEL_LABEL {
                    debug!(peer = %peer_id, "remote opened the chat channel");
                    session.attach_channel(channel);
                } else {
                    warn!(peer = %peer_id, label = %channel.label(), "ignoring unexpected channel");
                }
            }
            TransportEvent::ChannelOpen => {
                transition = session.set_channel_state(ChannelState::Open);
                self.on_channel_open(session).await;
            }
            TransportEvent::ChannelClose => {
                info!(peer = %peer_id, "data channel closed");
                transition = session.set_channel_state(ChannelState::Closed);
            }
            TransportEvent::ChannelError(e) => {
                if e.is_benign_abort() {
                    info!(peer = %peer_id, message = %e.message, "remote aborted the channel");
                } else {
                    warn!(peer = %peer_id, name = %e.name, message = %e.message, "data channel error");
                    failure = Some(ConnectError::Channel(format!("{}: {}", e.name, e.message)));
                }
            }
            TransportEvent::ChannelMessage(message) => {
                let routed = {
                    let ctx = RouteContext {
                        peer_id: &peer_id,
                        shared_key: session.shared_key(),
                        is_active_chat,
                        session_connected: session.is_usable(),
                    };
                    match &message {
                        ChannelMessage::Text(raw) => self.router.route_text(&ctx, raw),
                        ChannelMessage::Binary(frame) => self.router.route_chunk(&ctx, frame),
                    }
                };
                match routed {
                    Ok(actions) => {
                        let followup = self.apply_actions(session, actions).await;
                        failure = followup.reset;
                        connect = followup.connect;
                    }
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "dropping inbound message");
                        self.notifier.on_system_message(
                            &format!("Could not process a message from {}: {e}", self.display_name(&peer_id)),
                            Some(&peer_id),
                            true,
                        );
                    }
                }
            }
        }

        if let Some(transition) = transition.filter(Transition::entered_terminal) {
            failure.get_or_insert_with(|| terminal_reason(session, transition));
        }
        let presence = session.presence();

        match failure {
            Some(reason) => {
                let is_error = !matches!(reason, ConnectError::Aborted(_));
                self.notifier.on_system_message(
                    &format!("Connection to {} ended: {reason}", self.display_name(&peer_id)),
                    Some(&peer_id),
                    is_error,
                );
                self.reset_locked(&mut registry, &peer_id, reason).await;
            }
            None => self.set_presence(&peer_id, presence),
        }
        drop(registry);

        if connect {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.connect_to_peer(&peer_id).await {
                    debug!(peer = %peer_id, error = %e, "background connect did not complete");
                }
            });
        }
    }

    /// Key and profile handshake, then settle the pending connect.
    async fn on_channel_open(&self, session: &mut PeerSession) {
        let Some(channel) = session.channel().cloned() else {
            warn!(peer = %session.peer_id(), "channel open without a channel");
            return;
        };
        info!(peer = %session.peer_id(), "data channel open");

        let mut handshake = vec![AppMessage::PublicKey(PublicKeyPayload {
            jwk: self.crypto.public_key_jwk(),
        })];
        if !self.options.profile.is_empty() {
            handshake.push(AppMessage::ProfileInfo(self.options.profile.clone()));
        }
        for message in &handshake {
            if let Err(e) = self.reply(session, Arc::clone(&channel), message, true).await {
                warn!(peer = %session.peer_id(), kind = %message.kind(), error = %e, "handshake send failed");
            }
        }

        session.settle(Ok(channel));
    }

    async fn apply_actions(&self, session: &mut PeerSession, actions: Vec<RouterAction>) -> Followup {
        let mut followup = Followup::default();
        for action in actions {
            match action {
                RouterAction::Send {
                    message,
                    force_plaintext,
                } => {
                    let Some(channel) = session.open_channel() else {
                        warn!(peer = %session.peer_id(), kind = %message.kind(), "reply dropped, channel not open");
                        continue;
                    };
                    let sent = self.reply(session, channel, &message, force_plaintext).await;
                    if let Err(e) = sent {
                        warn!(peer = %session.peer_id(), kind = %message.kind(), error = %e, "reply failed");
                    }
                }
                RouterAction::InstallKeys {
                    peer_public_key,
                    shared_key,
                } => {
                    debug!(peer = %session.peer_id(), "shared key installed");
                    session.set_keys(peer_public_key, shared_key);
                }
                RouterAction::Reset { reason } => {
                    followup.reset = Some(ConnectError::Aborted(reason));
                }
                RouterAction::Disconnect => {
                    followup.reset = Some(ConnectError::Aborted("friend request declined".into()));
                }
                RouterAction::Connect => followup.connect = true,
            }
        }
        followup
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send `message` to `peer_id` over its open channel.
    ///
    /// The message is encrypted when a shared key exists, unless
    /// `force_plaintext` is set or the message kind is exempt.
    pub async fn send_message(
        &self,
        peer_id: &str,
        message: AppMessage,
        force_plaintext: bool,
    ) -> Result<(), SendError> {
        let (channel, key) = self.channel_and_key(peer_id).await;
        let result = match channel {
            Some(channel) => {
                self.transmit(channel.as_ref(), key.as_ref(), &message, force_plaintext)
                    .await
            }
            None => Err(SendError::ChannelNotOpen(peer_id.to_string())),
        };

        if let Err(e) = &result {
            warn!(peer = %peer_id, kind = %message.kind(), error = %e, "failed to send message");
            self.notifier.on_system_message(
                &format!("Could not send {} to {}: {e}", message.kind(), self.display_name(peer_id)),
                Some(peer_id),
                true,
            );
        }
        result
    }

    /// Send chat text and record it in history.
    pub async fn send_chat_message(
        &self,
        peer_id: &str,
        text: &str,
    ) -> Result<StoredMessage, SendError> {
        self.send_message(peer_id, AppMessage::text(text), false)
            .await?;

        let mut stored = StoredMessage::text(peer_id, Direction::Outgoing, text);
        stored.id = Some(self.store.add_message(&stored)?);
        self.notifier.on_message(peer_id, &stored);
        Ok(stored)
    }

    pub async fn send_typing(&self, peer_id: &str, is_typing: bool) -> Result<(), SendError> {
        self.send_message(
            peer_id,
            AppMessage::Typing(TypingPayload { is_typing }),
            false,
        )
        .await
    }

    /// Announce and stream `data` to `peer_id`. Returns the transfer id.
    pub async fn send_file(
        &self,
        peer_id: &str,
        name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<String, SendError> {
        let transfer_id = new_transfer_id();
        let size = data.len() as u64;
        let meta = AppMessage::FileMeta(FileMeta {
            transfer_id: transfer_id.clone(),
            name: name.to_string(),
            size,
            mime_type: mime_type.to_string(),
            timestamp: Some(crate::now_millis()),
        });
        self.send_message(peer_id, meta, false).await?;

        let mut stored =
            StoredMessage::file(peer_id, Direction::Outgoing, &transfer_id, name, size);
        stored.id = Some(self.store.add_message(&stored)?);
        self.notifier.on_message(peer_id, &stored);

        info!(peer = %peer_id, transfer_id = %transfer_id, size, "sending file");
        match self.send_chunks(peer_id, &transfer_id, data).await {
            Ok(()) => {
                info!(peer = %peer_id, transfer_id = %transfer_id, "file sent");
                Ok(transfer_id)
            }
            Err(e) => {
                warn!(peer = %peer_id, transfer_id = %transfer_id, error = %e, "file transfer failed");
                self.notifier
                    .on_file_progress(peer_id, &transfer_id, PROGRESS_FAILED, None);
                self.notifier.on_system_message(
                    &format!("Sending {name} failed: {e}"),
                    Some(peer_id),
                    true,
                );
                Err(e)
            }
        }
    }

    async fn send_chunks(
        &self,
        peer_id: &str,
        transfer_id: &str,
        data: &[u8],
    ) -> Result<(), SendError> {
        let (channel, _) = self.channel_and_key(peer_id).await;
        let channel = channel.ok_or_else(|| SendError::ChannelNotOpen(peer_id.to_string()))?;

        if data.is_empty() {
            self.notifier.on_file_progress(peer_id, transfer_id, 1.0, None);
            return Ok(());
        }

        let mut offset = 0usize;
        for piece in data.chunks(self.options.chunk_size.max(1)) {
            let frame = encode_chunk(transfer_id, piece)?;
            wait_for_buffer(channel.as_ref()).await?;
            channel.send_binary(frame).await?;

            offset += piece.len();
            let progress = offset as f64 / data.len() as f64;
            self.notifier
                .on_file_progress(peer_id, transfer_id, progress, None);
        }
        Ok(())
    }

    async fn channel_and_key(
        &self,
        peer_id: &str,
    ) -> (Option<Arc<dyn DataChannel>>, Option<SharedKey>) {
        let registry = self.registry.lock().await;
        match registry.get(peer_id) {
            Some(session) => (session.open_channel(), session.shared_key().cloned()),
            None => (None, None),
        }
    }

    fn encode_frame(
        &self,
        key: Option<&SharedKey>,
        message: &AppMessage,
        force_plaintext: bool,
    ) -> Result<String, SendError> {
        Ok(match key {
            Some(key) if !force_plaintext && !message.kind().is_plaintext_exempt() => {
                let sealed = self.crypto.encrypt(key, &message.to_json_bytes()?)?;
                encode_encrypted(&sealed)?
            }
            _ => message.to_json()?,
        })
    }

    async fn transmit(
        &self,
        channel: &dyn DataChannel,
        key: Option<&SharedKey>,
        message: &AppMessage,
        force_plaintext: bool,
    ) -> Result<(), SendError> {
        let frame = self.encode_frame(key, message, force_plaintext)?;
        wait_for_buffer(channel).await?;
        channel.send_text(frame).await?;
        Ok(())
    }

    /// Send a reply from the event loop, which holds the registry lock.
    ///
    /// Goes out immediately while the channel has room. Otherwise the frame is
    /// handed to a task that waits for the buffer to drain, queued behind any
    /// earlier reply for the same session.
    async fn reply(
        &self,
        session: &mut PeerSession,
        channel: Arc<dyn DataChannel>,
        message: &AppMessage,
        force_plaintext: bool,
    ) -> Result<(), SendError> {
        let frame = self.encode_frame(session.shared_key(), message, force_plaintext)?;
        if !channel.is_open() {
            return Err(SendError::ChannelClosed);
        }
        if !session.has_queued_replies() && channel.buffered_amount().await <= BUFFER_THRESHOLD {
            channel.send_text(frame).await?;
            return Ok(());
        }

        let peer_id = session.peer_id().to_string();
        let kind = message.kind().to_string();
        debug!(peer = %peer_id, kind = %kind, "channel congested, queueing reply");
        let previous = session.take_reply_task();
        session.set_reply_task(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let sent = match wait_for_buffer(channel.as_ref()).await {
                Ok(()) => channel.send_text(frame).await.map_err(SendError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(peer = %peer_id, kind = %kind, error = %e, "queued reply failed");
            }
        }));
        Ok(())
    }

    // ========================================================================
    // Contacts and friend workflow
    // ========================================================================

    /// Connect to `peer_id` and ask to become contacts.
    pub async fn send_friend_request(&self, peer_id: &str) -> Result<(), SendError> {
        if peer_id == self.options.local_id {
            return Err(SendError::InvalidPeer("cannot add yourself as a contact".into()));
        }
        if self
            .contacts
            .get(peer_id)
            .is_some_and(|c| c.friend_status == FriendStatus::Confirmed)
        {
            return Err(SendError::InvalidPeer(format!("{peer_id} is already a contact")));
        }

        self.connect_to_peer(peer_id).await?;
        let now = crate::now_millis();
        let request = AppMessage::FriendRequest(FriendRequestPayload {
            sender_id: self.options.local_id.clone(),
            sender_name: self.options.profile.nickname.clone(),
            timestamp: Some(now),
        });
        self.send_message(peer_id, request, false).await?;

        let name = self.display_name(peer_id);
        self.contacts
            .add_outgoing_request(PendingRequest::new(peer_id, name.clone(), now));
        self.contacts
            .upsert(Contact::new(peer_id, name.clone(), FriendStatus::PendingOutgoing));
        self.save_contacts()?;
        self.notifier
            .on_system_message(&format!("Friend request sent to {name}"), Some(peer_id), false);
        Ok(())
    }

    /// Accept a pending incoming request from `peer_id`.
    pub async fn accept_friend_request(&self, peer_id: &str) -> Result<(), SendError> {
        let request = self
            .contacts
            .incoming_requests()
            .into_iter()
            .find(|r| r.id == peer_id)
            .ok_or_else(|| SendError::InvalidPeer(format!("no pending request from {peer_id}")))?;

        self.connect_to_peer(peer_id).await?;
        let accept = AppMessage::FriendAccept(FriendAcceptPayload {
            acceptor_id: self.options.local_id.clone(),
            acceptor_name: self.options.profile.nickname.clone(),
            timestamp: Some(crate::now_millis()),
        });
        self.send_message(peer_id, accept, false).await?;

        self.contacts.remove_incoming_request(peer_id);
        self.contacts
            .upsert(Contact::new(peer_id, request.name.clone(), FriendStatus::Confirmed));
        if self.is_connected(peer_id).await {
            self.set_presence(peer_id, ContactPresence::Online);
        }
        self.save_contacts()?;
        self.notifier.on_system_message(
            &format!("You are now contacts with {}", request.name),
            Some(peer_id),
            false,
        );
        Ok(())
    }

    /// Refuse a pending incoming request and drop the connection.
    pub async fn decline_friend_request(&self, peer_id: &str) -> Result<(), SendError> {
        if !self.contacts.has_incoming_request(peer_id) {
            return Err(SendError::InvalidPeer(format!("no pending request from {peer_id}")));
        }

        if self.is_connected(peer_id).await {
            let decline = AppMessage::FriendDecline(FriendDeclinePayload {
                decliner_id: self.options.local_id.clone(),
                timestamp: Some(crate::now_millis()),
            });
            if let Err(e) = self.send_message(peer_id, decline, false).await {
                debug!(peer = %peer_id, error = %e, "decline not delivered");
            }
        }

        self.contacts.remove_incoming_request(peer_id);
        self.contacts.remove(peer_id);
        self.save_contacts()?;
        self.disconnect_from_peer(peer_id).await;
        Ok(())
    }

    /// Withdraw an outgoing request and drop the connection.
    pub async fn cancel_friend_request(&self, peer_id: &str) -> Result<(), SendError> {
        if !self.contacts.has_outgoing_request(peer_id) {
            return Err(SendError::InvalidPeer(format!("no outgoing request to {peer_id}")));
        }

        if self.is_connected(peer_id).await {
            let cancel = AppMessage::FriendCancel(FriendCancelPayload {
                canceller_id: self.options.local_id.clone(),
                timestamp: Some(crate::now_millis()),
            });
            if let Err(e) = self.send_message(peer_id, cancel, false).await {
                debug!(peer = %peer_id, error = %e, "cancel not delivered");
            }
        }

        self.contacts.remove_outgoing_request(peer_id);
        self.contacts.remove(peer_id);
        self.save_contacts()?;
        self.disconnect_from_peer(peer_id).await;
        Ok(())
    }

    /// Forget `peer_id` and its history, and hang up.
    pub async fn remove_contact(&self, peer_id: &str) -> Result<(), SendError> {
        if self.contacts.remove(peer_id).is_none() {
            return Err(SendError::InvalidPeer(format!("{peer_id} is not a contact")));
        }
        self.contacts.remove_incoming_request(peer_id);
        self.contacts.remove_outgoing_request(peer_id);

        let deleted = self.store.delete_messages_for_peer(peer_id)?;
        debug!(peer = %peer_id, deleted, "history deleted");
        self.save_contacts()?;

        {
            let mut registry = self.registry.lock().await;
            if registry.is_active_chat(peer_id) {
                registry.set_active_chat(None);
            }
        }
        self.disconnect_from_peer(peer_id).await;
        Ok(())
    }

    fn save_contacts(&self) -> Result<(), SendError> {
        self.contacts
            .save()
            .map_err(|e| SendError::Contacts(format!("{e:#}")))?;
        self.notifier.on_contacts_changed();
        Ok(())
    }

    // ========================================================================
    // Chat view
    // ========================================================================

    /// Make `peer_id` the active chat and clear its unread count.
    ///
    /// Returns the previously active chat.
    pub async fn set_active_chat(&self, peer_id: Option<&str>) -> Option<String> {
        let previous = self
            .registry
            .lock()
            .await
            .set_active_chat(peer_id.map(str::to_string));
        if let Some(peer_id) = peer_id {
            if self.contacts.clear_unread(peer_id) {
                self.notifier.on_unread(peer_id, 0);
            }
        }
        previous
    }

    pub async fn active_chat(&self) -> Option<String> {
        self.registry.lock().await.active_chat().map(str::to_string)
    }

    pub fn history(&self, peer_id: &str) -> Result<Vec<StoredMessage>, StorageError> {
        self.store.messages_for_peer(peer_id)
    }
}

#[derive(Debug, Default)]
struct Followup {
    reset: Option<ConnectError>,
    connect: bool,
}

fn terminal_reason(session: &PeerSession, transition: Transition) -> ConnectError {
    match transition.to {
        SessionState::Failed if session.signals().ice == IceConnectionState::Failed => {
            ConnectError::IceFailed
        }
        SessionState::Failed => ConnectError::ConnectionFailed,
        _ if session.has_waiter() => ConnectError::ClosedBeforeOpen,
        other => ConnectError::Aborted(format!("connection {}", other.as_str())),
    }
}

/// Wait until the channel's send buffer drains below the threshold.
async fn wait_for_buffer(channel: &dyn DataChannel) -> Result<(), SendError> {
    if !channel.is_open() {
        return Err(SendError::ChannelClosed);
    }
    while channel.buffered_amount().await > BUFFER_THRESHOLD {
        tokio::time::sleep(BUFFER_POLL_INTERVAL).await;
        if !channel.is_open() {
            return Err(SendError::ChannelClosed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use protocol::messages::InboundFrame;
    use protocol::signaling::{BusyPayload, ErrorPayload, UserDisconnectedPayload};
    use protocol::{decode_frame, KeyPair};
    use tokio::sync::broadcast;

    use crate::crypto::LocalCryptoProvider;
    use crate::network::fake::{candidate, FakeChannel, FakeFactory, FakeSignaling, FakeTransport};
    use crate::network::ChannelError;
    use crate::notifier::{EventNotifier, UiEvent};
    use crate::session::state::PeerConnectionState;
    use crate::storage::SqliteMessageStore;

    struct Harness {
        orchestrator: Arc<ConnectionOrchestrator>,
        signaling: Arc<FakeSignaling>,
        factory: Arc<FakeFactory>,
        contacts: Arc<ContactBook>,
        events: broadcast::Receiver<UiEvent>,
    }

    async fn harness_with(options: OrchestratorOptions) -> Harness {
        let signaling = Arc::new(FakeSignaling::new());
        let factory = Arc::new(FakeFactory::default());
        let contacts = Arc::new(ContactBook::in_memory());
        let notifier = Arc::new(EventNotifier::default());
        let events = notifier.subscribe();

        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            options,
            Components {
                signaling: signaling.clone(),
                transports: factory.clone(),
                crypto: Arc::new(LocalCryptoProvider::ephemeral()),
                contacts: contacts.clone(),
                store: Arc::new(SqliteMessageStore::open_in_memory().unwrap()),
                notifier,
            },
        ));
        orchestrator.start().await.unwrap();

        Harness {
            orchestrator,
            signaling,
            factory,
            contacts,
            events,
        }
    }

    async fn harness() -> Harness {
        let mut options = OrchestratorOptions::new("alice");
        options.profile.nickname = Some("Alice".into());
        harness_with(options).await
    }

    fn add_contact(h: &Harness, id: &str) {
        h.contacts
            .upsert(Contact::new(id, id, FriendStatus::Confirmed));
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_for_state(h: &Harness, peer: &str, state: SessionState) {
        for _ in 0..400 {
            if h.orchestrator.session_state(peer).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{peer} never reached {state:?}");
    }

    fn spawn_connect(
        h: &Harness,
        peer: &'static str,
    ) -> JoinHandle<Result<Arc<dyn DataChannel>, ConnectError>> {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.connect_to_peer(peer).await })
    }

    /// Drive an outgoing connect to an open channel.
    async fn establish(h: &Harness, peer: &'static str) -> (Arc<FakeTransport>, Arc<FakeChannel>) {
        let before = h.factory.created();
        let connect = spawn_connect(h, peer);
        wait_until(|| h.factory.created() == before + 1).await;
        let transport = h.factory.last();
        wait_until(|| transport.channel().is_some()).await;
        let channel = transport.channel().unwrap();

        transport
            .sink
            .emit(TransportEvent::ConnectionState(PeerConnectionState::Connected));
        channel.set_open(true);
        transport.sink.emit(TransportEvent::ChannelOpen);

        connect.await.unwrap().unwrap();
        (transport, channel)
    }

    fn sent_types(channel: &FakeChannel) -> Vec<String> {
        channel
            .sent_texts()
            .iter()
            .map(|raw| {
                let value: serde_json::Value = serde_json::from_str(raw).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn deliver(transport: &FakeTransport, message: &AppMessage) {
        transport.sink.emit(TransportEvent::ChannelMessage(ChannelMessage::Text(
            message.to_json().unwrap(),
        )));
    }

    fn drain(events: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness().await;
        assert_eq!(h.orchestrator.state().await, OrchestratorState::Running);
        assert!(h.orchestrator.start().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_sends_offer_and_resolves_on_open() {
        let h = harness().await;
        add_contact(&h, "bob");

        let (_transport, channel) = establish(&h, "bob").await;

        let offers: Vec<_> = h
            .signaling
            .sent()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Offer(p) if p.target_user_id == "bob"))
            .collect();
        assert_eq!(offers.len(), 1);
        assert_eq!(
            h.orchestrator.session_state("bob").await,
            Some(SessionState::Connected)
        );
        assert_eq!(channel.label(), CHAT_CHANNEL_LABEL);
        assert_eq!(sent_types(&channel), vec!["publicKey", "profile_info"]);

        wait_until(|| h.contacts.get("bob").unwrap().presence == ContactPresence::Online).await;
    }

    #[tokio::test]
    async fn test_connect_when_usable_returns_immediately() {
        let h = harness().await;
        establish(&h, "bob").await;

        h.orchestrator.connect_to_peer("bob").await.unwrap();
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_empty_peer_id_rejected() {
        let h = harness().await;
        assert_eq!(
            h.orchestrator.connect_to_peer("").await.err(),
            Some(ConnectError::EmptyPeerId)
        );
    }

    #[tokio::test]
    async fn test_second_connect_while_connecting_is_rejected() {
        let h = harness().await;
        let _first = spawn_connect(&h, "bob");
        wait_until(|| h.factory.created() == 1).await;

        let second = h.orchestrator.connect_to_peer("bob").await;
        assert_eq!(
            second.err(),
            Some(ConnectError::AlreadyConnecting("bob".into()))
        );
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_transport_creation_failure_rejects() {
        let h = harness().await;
        h.factory.fail.store(true, Ordering::SeqCst);

        let result = h.orchestrator.connect_to_peer("bob").await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
        assert_eq!(
            h.orchestrator.session_state("bob").await,
            Some(SessionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_offer_send_failure_resets() {
        let h = harness().await;
        h.signaling.connected.store(false, Ordering::SeqCst);

        let result = h.orchestrator.connect_to_peer("bob").await;
        assert!(matches!(result, Err(ConnectError::Signaling(_))));
        assert!(h.factory.last().is_closed());
    }

    #[tokio::test]
    async fn test_connect_timeout_rejects_and_resets() {
        let mut options = OrchestratorOptions::new("alice");
        options.connect_timeout = Duration::from_millis(50);
        let h = harness_with(options).await;
        add_contact(&h, "bob");

        let result = h.orchestrator.connect_to_peer("bob").await;
        assert_eq!(result.err(), Some(ConnectError::Timeout("bob".into())));
        assert!(h.factory.last().is_closed());
        assert_eq!(
            h.contacts.get("bob").unwrap().presence,
            ContactPresence::Offline
        );
    }

    #[tokio::test]
    async fn test_ice_failure_settles_once() {
        let h = harness().await;
        let connect = spawn_connect(&h, "bob");
        wait_until(|| h.factory.created() == 1).await;
        let transport = h.factory.last();

        transport
            .sink
            .emit(TransportEvent::IceConnectionState(IceConnectionState::Failed));
        assert_eq!(connect.await.unwrap().err(), Some(ConnectError::IceFailed));
        assert!(transport.is_closed());

        // Late open from the dead transport changes nothing
        transport.sink.emit(TransportEvent::ChannelOpen);
        wait_for_state(&h, "bob", SessionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            h.orchestrator.session_state("bob").await,
            Some(SessionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_close_before_open_rejects() {
        let h = harness().await;
        let connect = spawn_connect(&h, "bob");
        wait_until(|| h.factory.created() == 1).await;

        h.factory
            .last()
            .sink
            .emit(TransportEvent::ConnectionState(PeerConnectionState::Closed));
        assert_eq!(
            connect.await.unwrap().err(),
            Some(ConnectError::ClosedBeforeOpen)
        );
    }

    #[tokio::test]
    async fn test_candidates_queued_until_answer() {
        let h = harness().await;
        let _connect = spawn_connect(&h, "bob");
        wait_until(|| h.factory.created() == 1).await;
        let transport = h.factory.last();
        wait_until(|| transport.signaling_state() == SignalingState::HaveLocalOffer).await;

        for name in ["c1", "c2"] {
            h.signaling
                .inject(
                    "bob",
                    SignalMessage::Candidate(CandidatePayload {
                        target_user_id: "alice".into(),
                        candidate: Some(candidate(name)),
                    }),
                )
                .await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.added_candidates().is_empty());

        h.signaling
            .inject(
                "bob",
                SignalMessage::Answer(SdpPayload {
                    target_user_id: "alice".into(),
                    sdp: "answer".into(),
                }),
            )
            .await;
        wait_until(|| transport.added_candidates() == vec!["c1", "c2"]).await;

        // Later candidates go straight in
        h.signaling
            .inject(
                "bob",
                SignalMessage::Candidate(CandidatePayload {
                    target_user_id: "alice".into(),
                    candidate: Some(candidate("c3")),
                }),
            )
            .await;
        wait_until(|| transport.added_candidates().len() == 3).await;
    }

    #[tokio::test]
    async fn test_incoming_offer_is_answered() {
        let h = harness().await;
        add_contact(&h, "carol");
        h.signaling
            .inject(
                "carol",
                SignalMessage::Offer(SdpPayload {
                    target_user_id: "alice".into(),
                    sdp: "offer".into(),
                }),
            )
            .await;

        wait_until(|| {
            h.signaling
                .sent()
                .iter()
                .any(|m| matches!(m, SignalMessage::Answer(p) if p.target_user_id == "carol"))
        })
        .await;
        let transport = h.factory.last();
        assert_eq!(
            transport.remote.lock().unwrap().as_ref().map(|(k, _)| *k),
            Some(SdpKind::Offer)
        );
        assert_eq!(
            h.orchestrator.session_state("carol").await,
            Some(SessionState::Connecting)
        );

        // The answerer adopts the remote channel
        let channel = Arc::new(FakeChannel::new(CHAT_CHANNEL_LABEL));
        channel.set_open(true);
        transport
            .sink
            .emit(TransportEvent::IncomingChannel(channel.clone()));
        transport
            .sink
            .emit(TransportEvent::ConnectionState(PeerConnectionState::Connected));
        transport.sink.emit(TransportEvent::ChannelOpen);
        wait_until(|| h.contacts.get("carol").unwrap().presence == ContactPresence::Online).await;
        assert_eq!(sent_types(&channel)[0], "publicKey");
    }

    #[tokio::test]
    async fn test_colliding_offer_is_ignored() {
        let h = harness().await;
        let _connect = spawn_connect(&h, "bob");
        wait_until(|| h.factory.created() == 1).await;
        wait_until(|| h.factory.last().signaling_state() == SignalingState::HaveLocalOffer).await;

        h.signaling
            .inject(
                "bob",
                SignalMessage::Offer(SdpPayload {
                    target_user_id: "alice".into(),
                    sdp: "offer".into(),
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(h.factory.created(), 1);
        assert!(!h
            .signaling
            .sent()
            .iter()
            .any(|m| matches!(m, SignalMessage::Answer(_))));
    }

    #[tokio::test]
    async fn test_unexpected_answer_is_ignored() {
        let h = harness().await;
        h.signaling
            .inject(
                "carol",
                SignalMessage::Offer(SdpPayload {
                    target_user_id: "alice".into(),
                    sdp: "offer".into(),
                }),
            )
            .await;
        wait_until(|| h.factory.created() == 1).await;
        wait_for_state(&h, "carol", SessionState::Connecting).await;

        h.signaling
            .inject(
                "carol",
                SignalMessage::Answer(SdpPayload {
                    target_user_id: "alice".into(),
                    sdp: "stray".into(),
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let transport = h.factory.last();
        assert_eq!(
            transport.remote.lock().unwrap().as_ref().map(|(_, sdp)| sdp.clone()),
            Some("offer".to_string())
        );
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_local_candidates_are_relayed() {
        let h = harness().await;
        let _connect = spawn_connect(&h, "bob");
        wait_until(|| h.factory.created() == 1).await;

        h.factory
            .last()
            .sink
            .emit(TransportEvent::LocalCandidate(Some(candidate("local"))));
        wait_until(|| {
            h.signaling.sent().iter().any(|m| {
                matches!(m, SignalMessage::Candidate(p)
                    if p.target_user_id == "bob"
                    && p.candidate.as_ref().map(|c| c.candidate.as_str()) == Some("local"))
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let h = harness().await;
        add_contact(&h, "bob");
        let (transport, _channel) = establish(&h, "bob").await;

        h.orchestrator.reset_peer_connection("bob", "first").await;
        h.orchestrator.reset_peer_connection("bob", "second").await;
        h.orchestrator.reset_peer_connection("nobody", "third").await;

        assert!(transport.is_closed());
        assert_eq!(
            h.orchestrator.session_state("bob").await,
            Some(SessionState::Disconnected)
        );
        assert_eq!(
            h.contacts.get("bob").unwrap().presence,
            ContactPresence::Offline
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_session_reasserts_offline() {
        let mut h = harness().await;
        add_contact(&h, "bob");
        drain(&mut h.events);

        h.orchestrator.disconnect_from_peer("bob").await;
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(e,
            UiEvent::ContactStatus { peer_id, presence: ContactPresence::Offline } if peer_id == "bob")));
    }

    #[tokio::test]
    async fn test_signaling_loss_resets_every_peer() {
        let h = harness().await;
        add_contact(&h, "bob");
        add_contact(&h, "carol");
        let (bob, _) = establish(&h, "bob").await;
        let (carol, _) = establish(&h, "carol").await;

        h.signaling.drop_connection("socket closed").await;
        wait_until(|| bob.is_closed() && carol.is_closed()).await;
        wait_until(|| h.contacts.list().iter().all(|c| c.presence == ContactPresence::Offline))
            .await;
    }

    #[tokio::test]
    async fn test_relay_error_resets_target() {
        let h = harness().await;
        let connect = spawn_connect(&h, "ghost");
        wait_until(|| h.factory.created() == 1).await;

        h.signaling
            .inject_envelope(
                SignalMessage::Error(ErrorPayload {
                    message: "User not found or offline".into(),
                    target_user_id: Some("ghost".into()),
                    target_user: None,
                })
                .into_envelope(None)
                .unwrap(),
            )
            .await;
        assert!(matches!(
            connect.await.unwrap(),
            Err(ConnectError::Relay(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_and_user_disconnected_reset() {
        let h = harness().await;
        let connect = spawn_connect(&h, "bob");
        wait_until(|| h.factory.created() == 1).await;
        h.signaling
            .inject("bob", SignalMessage::Busy(BusyPayload { target_user_id: None }))
            .await;
        assert_eq!(
            connect.await.unwrap().err(),
            Some(ConnectError::Busy("bob".into()))
        );

        let (transport, _) = establish(&h, "carol").await;
        h.signaling
            .inject(
                "server",
                SignalMessage::UserDisconnected(UserDisconnectedPayload {
                    user_id: "carol".into(),
                }),
            )
            .await;
        wait_until(|| transport.is_closed()).await;
    }

    #[tokio::test]
    async fn test_benign_abort_keeps_session() {
        let h = harness().await;
        let (transport, _) = establish(&h, "bob").await;

        transport.sink.emit(TransportEvent::ChannelError(ChannelError::new(
            "OperationError",
            "User-Initiated Abort, reason=Close called",
        )));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.orchestrator.is_connected("bob").await);

        transport.sink.emit(TransportEvent::ChannelError(ChannelError::new(
            "OperationError",
            "SCTP failure",
        )));
        wait_until(|| transport.is_closed()).await;
    }

    #[tokio::test]
    async fn test_channel_close_resets() {
        let h = harness().await;
        let (transport, _) = establish(&h, "bob").await;
        transport.sink.emit(TransportEvent::ChannelClose);
        wait_until(|| transport.is_closed()).await;
        assert!(!h.orchestrator.is_connected("bob").await);
    }

    #[tokio::test]
    async fn test_plaintext_until_key_exchange_then_encrypted() {
        let h = harness().await;
        add_contact(&h, "bob");
        let (transport, channel) = establish(&h, "bob").await;

        // No key yet
        h.orchestrator.send_chat_message("bob", "hi").await.unwrap();
        assert_eq!(sent_types(&channel).last().unwrap(), "text");

        let bob_keys = KeyPair::generate();
        deliver(
            &transport,
            &AppMessage::PublicKey(PublicKeyPayload {
                jwk: bob_keys.public_jwk().to_value(),
            }),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.orchestrator.send_chat_message("bob", "secret").await.unwrap();
        let last = channel.sent_texts().last().cloned().unwrap();
        assert!(matches!(decode_frame(&last).unwrap(), InboundFrame::Encrypted(_)));

        // Friend workflow messages stay readable
        h.orchestrator
            .send_message(
                "bob",
                AppMessage::FriendCancel(FriendCancelPayload {
                    canceller_id: "alice".into(),
                    timestamp: None,
                }),
                false,
            )
            .await
            .unwrap();
        assert_eq!(sent_types(&channel).last().unwrap(), "friend_cancel");

        h.orchestrator
            .send_message("bob", AppMessage::text("forced"), true)
            .await
            .unwrap();
        assert_eq!(sent_types(&channel).last().unwrap(), "text");

        let history = h.orchestrator.history("bob").unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_send_without_channel_fails() {
        let h = harness().await;
        let result = h.orchestrator.send_typing("bob", true).await;
        assert!(matches!(result, Err(SendError::ChannelNotOpen(_))));
    }

    #[tokio::test]
    async fn test_send_waits_for_buffer_and_fails_when_closed() {
        let h = harness().await;
        let (_, channel) = establish(&h, "bob").await;
        channel.buffered.store(2 * BUFFER_THRESHOLD, Ordering::SeqCst);

        let orchestrator = h.orchestrator.clone();
        let send = tokio::spawn(async move { orchestrator.send_typing("bob", true).await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!send.is_finished());

        channel.set_open(false);
        assert!(matches!(send.await.unwrap(), Err(SendError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_send_resumes_when_buffer_drains() {
        let h = harness().await;
        let (_, channel) = establish(&h, "bob").await;
        channel.buffered.store(2 * BUFFER_THRESHOLD, Ordering::SeqCst);

        let orchestrator = h.orchestrator.clone();
        let send = tokio::spawn(async move { orchestrator.send_typing("bob", false).await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        channel.buffered.store(0, Ordering::SeqCst);

        send.await.unwrap().unwrap();
        assert_eq!(sent_types(&channel).last().unwrap(), "typing");
    }

    #[tokio::test]
    async fn test_send_file_streams_chunks() {
        let mut options = OrchestratorOptions::new("alice");
        options.chunk_size = 16;
        let mut h = harness_with(options).await;
        add_contact(&h, "bob");
        let (_, channel) = establish(&h, "bob").await;
        drain(&mut h.events);

        let data: Vec<u8> = (0..37u8).collect();
        let transfer_id = h
            .orchestrator
            .send_file("bob", "notes.bin", "application/octet-stream", &data)
            .await
            .unwrap();

        assert_eq!(sent_types(&channel).last().unwrap(), "fileMeta");
        let frames = channel.sent_binaries();
        let sizes: Vec<usize> = frames
            .iter()
            .map(|f| protocol::decode_chunk(f).unwrap().data.len())
            .collect();
        assert_eq!(sizes, vec![16, 16, 5]);
        assert!(frames
            .iter()
            .all(|f| protocol::decode_chunk(f).unwrap().transfer_id == transfer_id));

        let progress: Vec<f64> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::FileProgress { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_inbound_text_from_stranger_gets_not_friend_error() {
        let h = harness().await;
        let (transport, channel) = establish(&h, "mallory").await;
        deliver(&transport, &AppMessage::text("hello?"));

        wait_until(|| sent_types(&channel).last().map(String::as_str) == Some("not_friend_error"))
            .await;
        assert!(h.orchestrator.history("mallory").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reply_under_backpressure_leaves_registry_free() {
        let h = harness().await;
        let (transport, channel) = establish(&h, "mallory").await;
        channel.buffered.store(2 * BUFFER_THRESHOLD, Ordering::SeqCst);

        deliver(&transport, &AppMessage::text("hi"));
        deliver(&transport, &AppMessage::text("anyone?"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            h.orchestrator.session_state("carol"),
        )
        .await;
        assert!(matches!(other, Ok(None)));
        let not_friend = |channel: &FakeChannel| {
            sent_types(channel)
                .iter()
                .filter(|t| *t == "not_friend_error")
                .count()
        };
        assert_eq!(not_friend(channel.as_ref()), 0);

        // Both replies go out, in order, once the buffer drains
        channel.buffered.store(0, Ordering::SeqCst);
        wait_until(|| not_friend(channel.as_ref()) == 2).await;
    }

    #[tokio::test]
    async fn test_disconnect_while_reply_is_congested() {
        let h = harness().await;
        let (transport, channel) = establish(&h, "mallory").await;
        channel.buffered.store(2 * BUFFER_THRESHOLD, Ordering::SeqCst);

        deliver(&transport, &AppMessage::text("hi"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        tokio::time::timeout(
            Duration::from_secs(1),
            h.orchestrator.disconnect_from_peer("mallory"),
        )
        .await
        .expect("disconnect blocked behind a congested reply");
        assert!(transport.is_closed());
        assert!(channel.closed.load(Ordering::SeqCst));
        assert!(!sent_types(&channel).contains(&"not_friend_error".to_string()));
    }

    #[tokio::test]
    async fn test_not_friend_error_resets_session() {
        let h = harness().await;
        add_contact(&h, "bob");
        let (transport, _) = establish(&h, "bob").await;
        deliver(
            &transport,
            &AppMessage::NotFriendError(protocol::messages::NotFriendErrorPayload {
                sender_id: "bob".into(),
            }),
        );
        wait_until(|| transport.is_closed()).await;
        assert_eq!(
            h.contacts.get("bob").unwrap().friend_status,
            FriendStatus::RemovedByPeer
        );
    }

    #[tokio::test]
    async fn test_friend_request_round() {
        let h = harness().await;
        let (_, channel) = establish(&h, "bob").await;

        h.orchestrator.send_friend_request("bob").await.unwrap();
        assert_eq!(sent_types(&channel).last().unwrap(), "friend_request");
        assert!(h.contacts.has_outgoing_request("bob"));
        assert_eq!(
            h.contacts.get("bob").unwrap().friend_status,
            FriendStatus::PendingOutgoing
        );

        h.orchestrator.cancel_friend_request("bob").await.unwrap();
        assert_eq!(sent_types(&channel).last().unwrap(), "friend_cancel");
        assert!(!h.contacts.contains("bob"));
        assert!(!h.orchestrator.is_connected("bob").await);
    }

    #[tokio::test]
    async fn test_accept_incoming_request() {
        let h = harness().await;
        let (transport, channel) = establish(&h, "bob").await;
        deliver(
            &transport,
            &AppMessage::FriendRequest(FriendRequestPayload {
                sender_id: "bob".into(),
                sender_name: Some("Bob".into()),
                timestamp: None,
            }),
        );
        wait_until(|| h.contacts.has_incoming_request("bob")).await;

        h.orchestrator.accept_friend_request("bob").await.unwrap();
        assert_eq!(sent_types(&channel).last().unwrap(), "friend_accept");
        let bob = h.contacts.get("bob").unwrap();
        assert_eq!(bob.friend_status, FriendStatus::Confirmed);
        assert_eq!(bob.presence, ContactPresence::Online);
        assert!(!h.contacts.has_incoming_request("bob"));
    }

    #[tokio::test]
    async fn test_friend_request_to_self_rejected() {
        let h = harness().await;
        assert!(matches!(
            h.orchestrator.send_friend_request("alice").await,
            Err(SendError::InvalidPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_contact_deletes_history_and_disconnects() {
        let h = harness().await;
        add_contact(&h, "bob");
        let (transport, _) = establish(&h, "bob").await;
        h.orchestrator.send_chat_message("bob", "bye").await.unwrap();
        h.orchestrator.set_active_chat(Some("bob")).await;

        h.orchestrator.remove_contact("bob").await.unwrap();
        assert!(!h.contacts.contains("bob"));
        assert!(h.orchestrator.history("bob").unwrap().is_empty());
        assert!(transport.is_closed());
        assert_eq!(h.orchestrator.active_chat().await, None);
    }

    #[tokio::test]
    async fn test_unreads_follow_active_chat() {
        let mut h = harness().await;
        add_contact(&h, "bob");
        let (transport, _) = establish(&h, "bob").await;

        deliver(&transport, &AppMessage::text("one"));
        deliver(&transport, &AppMessage::text("two"));
        wait_until(|| h.contacts.get("bob").unwrap().unread == 2).await;

        drain(&mut h.events);
        assert_eq!(h.orchestrator.set_active_chat(Some("bob")).await, None);
        assert_eq!(h.contacts.get("bob").unwrap().unread, 0);
        assert!(drain(&mut h.events).iter().any(|e| matches!(e,
            UiEvent::Unread { peer_id, count: 0 } if peer_id == "bob")));

        deliver(&transport, &AppMessage::text("three"));
        wait_until(|| h.orchestrator.history("bob").unwrap().len() == 3).await;
        assert_eq!(h.contacts.get("bob").unwrap().unread, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let h = harness().await;
        let (transport, _) = establish(&h, "bob").await;

        h.orchestrator.shutdown().await;
        assert!(transport.is_closed());
        assert!(!h.signaling.connected.load(Ordering::SeqCst));
        assert_eq!(h.orchestrator.state().await, OrchestratorState::Stopped);
    }
}
