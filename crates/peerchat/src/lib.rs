//! # PeerChat Library
//!
//! This crate provides the connection core of PeerChat: peer-to-peer chat
//! over WebRTC data channels, bootstrapped through a WebSocket relay.
//!
//! ## Overview
//!
//! - **Signaling**: one relay socket per process, used only for the
//!   offer/answer/candidate exchange
//! - **Sessions**: at most one connection per remote peer, with a derived
//!   state machine, a candidate queue and exactly-once connect settlement
//! - **Messaging**: end-to-end encrypted text, typing indicators and file
//!   transfer over an ordered data channel
//! - **Contacts**: a friend-request workflow gating who may talk to us
//! - **Relay**: a bundled rendezvous server compatible with the client
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Connection Orchestrator                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Session    │  │   Contact    │  │   Message History    │  │
//! │  │   Registry   │  │     Book     │  │      (SQLite)        │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                   Message Router                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │ Signaling Client  │  │       WebRTC Transports           │  │
//! │  └───────────────────┘  └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use peerchat::{
//!     Components, Config, ConnectionOrchestrator, ContactBook, EventNotifier,
//!     LocalCryptoProvider, OrchestratorOptions, SignalingConfig, SqliteMessageStore,
//!     WebRtcConfig, WebRtcTransportFactory, WebSocketSignalingClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let local_id = config.resolve_peer_id()?;
//!
//!     let components = Components {
//!         signaling: Arc::new(WebSocketSignalingClient::new(SignalingConfig::new(
//!             &config.network.signaling_url,
//!         ))),
//!         transports: Arc::new(WebRtcTransportFactory::new(WebRtcConfig::default())?),
//!         crypto: Arc::new(LocalCryptoProvider::ephemeral()),
//!         contacts: Arc::new(ContactBook::in_memory()),
//!         store: Arc::new(SqliteMessageStore::open_in_memory()?),
//!         notifier: Arc::new(EventNotifier::default()),
//!     };
//!     let options = OrchestratorOptions::from_config(&config, local_id);
//!     let orchestrator = Arc::new(ConnectionOrchestrator::new(options, components));
//!     orchestrator.start().await?;
//!
//!     orchestrator.connect_to_peer("bob").await?;
//!     orchestrator.send_chat_message("bob", "hello").await?;
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`network`]: Transport traits, WebRTC transports and the signaling client
//! - [`session`]: Per-peer session state machine and registry
//! - [`router`]: Inbound data-channel message dispatch
//! - [`orchestrator`]: Public connection API and event loop
//! - [`contacts`]: Contact book and pending friend requests
//! - [`storage`]: Message history and identity key persistence
//! - [`files`]: Incoming file transfer assembly
//! - [`relay`]: Bundled signaling relay

pub mod config;
pub mod contacts;
pub mod crypto;
pub mod files;
pub mod network;
pub mod notifier;
pub mod orchestrator;
pub mod relay;
pub mod router;
pub mod session;
pub mod storage;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export contact types for convenience
pub use contacts::{Contact, ContactBook, FriendStatus, PendingRequest};

pub use crypto::{CryptoProvider, LocalCryptoProvider};

// Re-export network types for convenience
pub use network::{
    DataChannel, IceServer, PeerTransport, SignalingClient, SignalingConfig, SignalingError,
    TransportError, TransportFactory, WebRtcConfig, WebRtcTransportFactory,
    WebSocketSignalingClient,
};

pub use notifier::{EventNotifier, TracingNotifier, UiEvent, UiNotifier};

// Re-export orchestrator types for convenience
pub use orchestrator::{
    Components, ConnectionOrchestrator, OrchestratorOptions, OrchestratorState, SendError,
};

pub use relay::{RelayError, RelayHandle, RelayServer};

pub use router::{MessageRouter, RouterError, RouterResult};

// Re-export session types for convenience
pub use session::{ConnectError, ContactPresence, SessionState};

pub use storage::{KeyStore, MessageStore, SqliteMessageStore, StorageError, StoredMessage};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
