//! Peer id to session map plus the active chat pointer.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::peer::{ConnectError, PeerSession};
use super::state::SessionState;

/// Owns every [`PeerSession`].
///
/// A torn-down session stays in the map in `Disconnected` state until the
/// next attempt replaces it, so callers can still ask what happened to a peer.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, PeerSession>,
    active_chat: Option<String>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer_id)
    }

    /// The session for `peer_id` if it still owns a transport created by
    /// `generation`. Events failing this check are stale.
    pub fn live_mut(&mut self, peer_id: &str, generation: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer_id)
            .filter(|s| s.generation() == generation && s.transport().is_some())
    }

    pub fn state_of(&self, peer_id: &str) -> Option<SessionState> {
        self.sessions.get(peer_id).map(PeerSession::state)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Peer ids with a session, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tear down any existing session for `peer_id` and start a fresh one.
    pub async fn recreate(&mut self, peer_id: &str) -> &mut PeerSession {
        self.next_generation += 1;
        let session = PeerSession::new(peer_id, self.next_generation);
        tracing::debug!(peer = %peer_id, generation = self.next_generation, "new session");

        match self.sessions.entry(peer_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .teardown(ConnectError::Aborted("superseded by a new attempt".into()))
                    .await;
                entry.insert(session);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(session),
        }
    }

    /// Tear down the session for `peer_id`. Returns `false` if there was none.
    pub async fn reset(&mut self, peer_id: &str, reason: ConnectError) -> bool {
        match self.sessions.get_mut(peer_id) {
            Some(session) => {
                session.teardown(reason).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every session. Returns the peer ids that had one.
    pub async fn reset_all(&mut self, reason: ConnectError) -> Vec<String> {
        let ids = self.peer_ids();
        for id in &ids {
            if let Some(session) = self.sessions.get_mut(id) {
                session.teardown(reason.clone()).await;
            }
        }
        ids
    }

    /// Drop the entry entirely, tearing it down first.
    pub async fn remove(&mut self, peer_id: &str, reason: ConnectError) -> bool {
        match self.sessions.remove(peer_id) {
            Some(mut session) => {
                session.teardown(reason).await;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Active chat
    // ------------------------------------------------------------------------

    pub fn active_chat(&self) -> Option<&str> {
        self.active_chat.as_deref()
    }

    pub fn is_active_chat(&self, peer_id: &str) -> bool {
        self.active_chat.as_deref() == Some(peer_id)
    }

    /// Replace the active chat and return the previous one.
    pub fn set_active_chat(&mut self, peer_id: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.active_chat, peer_id)
    }
}
