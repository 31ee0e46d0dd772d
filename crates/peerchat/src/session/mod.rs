//! Peer session management.
//!
//! This module provides the per-peer connection state machine and the
//! registry that owns one session per remote peer.

pub mod peer;
pub mod registry;
pub mod state;

pub use peer::{ConnectError, ConnectOutcome, PeerSession, Transition};
pub use registry::SessionRegistry;
pub use state::{derive_session_state, ChannelState, ContactPresence, SessionState, SubSignals};
