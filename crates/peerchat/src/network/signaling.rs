//! Signaling client for WebRTC negotiation.
//!
//! This module provides a client for the rendezvous relay, which carries:
//! - Identity registration (`register` with the local peer id)
//! - SDP offer/answer exchange
//! - ICE candidate relay
//! - Relay-side notices (`error`, `busy`, `user_disconnected`)
//!
//! Envelopes are JSON `{type, from, payload}`; the relay stamps `from`.
//! Sending is only possible while the socket is open. Nothing is queued.
//! Each established connection produces exactly one
//! [`SignalingEvent::Disconnected`] when it ends, however it ends.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::error::ProtocolError;
use protocol::signaling::{RegisterPayload, SignalEnvelope, SignalMessage};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use super::BoxFuture;
use crate::config::DEFAULT_SIGNALING_URL;

/// Default reconnection settings.
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Errors raised by the signaling client.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("not connected to signaling server")]
    NotConnected,

    #[error("invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectFailed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Connection state for the signaling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to the signaling server.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and registered.
    Connected,
    /// Reconnecting after a disconnect.
    Reconnecting,
}

/// Events emitted by the signaling client.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// An envelope arrived from the relay.
    Message(SignalEnvelope),
    /// The relay connection ended. Emitted once per connection.
    Disconnected { reason: String },
}

/// Trait for signaling operations.
///
/// This trait abstracts the signaling client interface, allowing for
/// different implementations (e.g., WebSocket, in-memory for testing).
pub trait SignalingClient: Send + Sync {
    /// Open the relay connection and register `local_id`.
    ///
    /// A no-op while already connected or connecting.
    fn connect<'a>(&'a self, local_id: &'a str) -> BoxFuture<'a, Result<(), SignalingError>>;

    /// Send one message. Fails with [`SignalingError::NotConnected`] when the
    /// socket is not open.
    fn send(&self, message: SignalMessage) -> BoxFuture<'_, Result<(), SignalingError>>;

    /// Close gracefully.
    fn close(&self) -> BoxFuture<'_, Result<(), SignalingError>>;

    /// Returns the current connection state.
    fn state(&self) -> ConnectionState;

    /// Returns the event receiver. Only the first caller gets it.
    fn events(&self) -> Option<mpsc::Receiver<SignalingEvent>>;
}

/// Configuration for the WebSocket signaling client.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// The WebSocket URL of the relay.
    pub server_url: String,
    /// Whether to automatically reconnect on disconnect.
    pub auto_reconnect: bool,
    /// Delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SIGNALING_URL.to_string(),
            auto_reconnect: false,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        }
    }
}

impl SignalingConfig {
    /// Creates a new configuration with the specified server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Sets whether to automatically reconnect on disconnect.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the delay between reconnection attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Internal state for the WebSocket signaling client.
struct ClientState {
    /// Current connection state.
    connection_state: ConnectionState,
    /// Identity registered on every (re)connect.
    local_id: Option<String>,
    /// Sender feeding the socket writer task.
    message_tx: Option<mpsc::Sender<WsMessage>>,
    /// Whether a shutdown has been requested.
    shutdown_requested: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            local_id: None,
            message_tx: None,
            shutdown_requested: false,
        }
    }
}

struct ClientInner {
    config: SignalingConfig,
    state: RwLock<ClientState>,
    event_tx: mpsc::Sender<SignalingEvent>,
}

/// WebSocket-based signaling client implementation.
pub struct WebSocketSignalingClient {
    inner: Arc<ClientInner>,
    /// Receiver for events (returned by events()).
    event_rx: RwLock<Option<mpsc::Receiver<SignalingEvent>>>,
}

impl WebSocketSignalingClient {
    /// Creates a new WebSocket signaling client.
    pub fn new(config: SignalingConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            inner: Arc::new(ClientInner {
                config,
                state: RwLock::new(ClientState::default()),
                event_tx,
            }),
            event_rx: RwLock::new(Some(event_rx)),
        }
    }
}

impl ClientInner {
    async fn emit(&self, event: SignalingEvent) {
        if let Err(e) = self.event_tx.send(event).await {
            tracing::warn!(error = %e, "Failed to send signaling event - receiver may be dropped");
        }
    }

    /// Updates the connection state and emits an event on change.
    async fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if state.connection_state == new_state {
                return;
            }
            state.connection_state = new_state;
        }
        self.emit(SignalingEvent::StateChanged(new_state)).await;
    }

    /// Mark the connection as gone. Emits `Disconnected` only for a
    /// connection that was up or being established by `connect`.
    async fn notify_disconnected(&self, reason: &str) {
        let previous = {
            let mut state = self.state.write().await;
            let previous = state.connection_state;
            state.connection_state = ConnectionState::Disconnected;
            state.message_tx = None;
            previous
        };

        match previous {
            ConnectionState::Disconnected => {}
            ConnectionState::Reconnecting => {
                self.emit(SignalingEvent::StateChanged(ConnectionState::Disconnected))
                    .await;
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                tracing::warn!(reason = %reason, "signaling disconnected");
                self.emit(SignalingEvent::StateChanged(ConnectionState::Disconnected))
                    .await;
                self.emit(SignalingEvent::Disconnected {
                    reason: reason.to_string(),
                })
                .await;
            }
        }
    }

    /// Open the socket, start the writer and reader tasks and register.
    ///
    /// Returns the reader task, which resolves to the reason the
    /// connection ended.
    async fn open_connection(
        self: &Arc<Self>,
        local_id: &str,
    ) -> Result<JoinHandle<String>, SignalingError> {
        let url = Url::parse(&self.config.server_url)
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        tracing::info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectFailed(e.to_string()))?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let (message_tx, mut message_rx) = mpsc::channel::<WsMessage>(256);
        let heartbeat = self.config.heartbeat_interval;

        // Writer: outgoing envelopes and heartbeat pings
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    msg = message_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let closing = matches!(msg, WsMessage::Close(_));
                        if let Err(e) = ws_sink.send(msg).await {
                            tracing::error!("failed to send WebSocket message: {}", e);
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = ws_sink.send(WsMessage::Ping(Vec::new())).await {
                            tracing::error!("failed to send heartbeat ping: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        // Reader: parse envelopes and forward them as events
        let inner = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(result) = ws_stream.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => match SignalEnvelope::from_json(&text) {
                        Ok(envelope) => inner.emit(SignalingEvent::Message(envelope)).await,
                        Err(e) => {
                            tracing::warn!(
                                "failed to parse signaling message: {} (raw: {})",
                                e,
                                text
                            );
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        return frame
                            .map(|f| format!("server closed connection: {}", f.reason))
                            .unwrap_or_else(|| "server closed connection".to_string());
                    }
                    Err(e) => return format!("WebSocket error: {}", e),
                    _ => {
                        // Ignore ping/pong/binary frames
                    }
                }
            }
            "connection closed".to_string()
        });

        let register = SignalMessage::Register(RegisterPayload {
            user_id: local_id.to_string(),
        })
        .into_envelope(None)?
        .to_json()?;
        message_tx
            .send(WsMessage::Text(register))
            .await
            .map_err(|_| SignalingError::NotConnected)?;

        self.state.write().await.message_tx = Some(message_tx);
        self.set_state(ConnectionState::Connected).await;
        tracing::info!(peer_id = %local_id, "registered with signaling server");

        Ok(reader)
    }

    /// Wait for the connection to end and reconnect if configured.
    async fn supervise(self: Arc<Self>, mut reader: Option<JoinHandle<String>>) {
        loop {
            if let Some(handle) = reader.take() {
                let reason = handle
                    .await
                    .unwrap_or_else(|e| format!("reader task failed: {}", e));
                self.notify_disconnected(&reason).await;
            }

            let local_id = {
                let state = self.state.read().await;
                if !self.config.auto_reconnect || state.shutdown_requested {
                    break;
                }
                match state.local_id.clone() {
                    Some(id) => id,
                    None => break,
                }
            };

            tracing::info!("reconnecting in {:?}", self.config.reconnect_delay);
            tokio::time::sleep(self.config.reconnect_delay).await;
            if self.state.read().await.shutdown_requested {
                break;
            }

            self.set_state(ConnectionState::Reconnecting).await;
            match self.open_connection(&local_id).await {
                Ok(handle) => reader = Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "signaling reconnect failed");
                    self.notify_disconnected(&e.to_string()).await;
                }
            }
        }
    }
}

impl SignalingClient for WebSocketSignalingClient {
    fn connect<'a>(&'a self, local_id: &'a str) -> BoxFuture<'a, Result<(), SignalingError>> {
        Box::pin(async move {
            {
                let mut state = self.inner.state.write().await;
                if state.connection_state != ConnectionState::Disconnected {
                    return Ok(());
                }
                state.local_id = Some(local_id.to_string());
                state.shutdown_requested = false;
            }

            self.inner.set_state(ConnectionState::Connecting).await;
            match self.inner.open_connection(local_id).await {
                Ok(reader) => {
                    tokio::spawn(Arc::clone(&self.inner).supervise(Some(reader)));
                    Ok(())
                }
                Err(e) => {
                    self.inner.notify_disconnected(&e.to_string()).await;
                    if self.inner.config.auto_reconnect {
                        tokio::spawn(Arc::clone(&self.inner).supervise(None));
                    }
                    Err(e)
                }
            }
        })
    }

    fn send(&self, message: SignalMessage) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            let tx = {
                let state = self.inner.state.read().await;
                if state.connection_state != ConnectionState::Connected {
                    return Err(SignalingError::NotConnected);
                }
                state.message_tx.clone().ok_or(SignalingError::NotConnected)?
            };

            let text = message.into_envelope(None)?.to_json()?;
            tx.send(WsMessage::Text(text))
                .await
                .map_err(|_| SignalingError::NotConnected)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            let tx = {
                let mut state = self.inner.state.write().await;
                state.shutdown_requested = true;
                state.message_tx.take()
            };
            if let Some(tx) = tx {
                let _ = tx.send(WsMessage::Close(None)).await;
            }
            self.inner.notify_disconnected("closed by client").await;
            Ok(())
        })
    }

    fn state(&self) -> ConnectionState {
        // Since we can't await in a sync function, we use try_read
        match self.inner.state.try_read() {
            Ok(state) => state.connection_state,
            Err(_) => ConnectionState::Disconnected,
        }
    }

    fn events(&self) -> Option<mpsc::Receiver<SignalingEvent>> {
        // Returns None if already taken or if lock is contended
        match self.event_rx.try_write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }
}
