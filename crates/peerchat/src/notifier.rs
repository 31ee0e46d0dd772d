//! User-facing notifications.
//!
//! The core reports everything the user should see through [`UiNotifier`].
//! Calls never block and never fail; a notifier that cannot deliver an event
//! drops it.

use std::path::{Path, PathBuf};

use tokio::sync::broadcast;

use crate::session::state::ContactPresence;
use crate::storage::StoredMessage;

/// Progress value reported when a transfer fails.
pub const PROGRESS_FAILED: f64 = -1.0;

/// Sink for user-visible events.
pub trait UiNotifier: Send + Sync {
    /// A status line, optionally about one peer.
    fn on_system_message(&self, text: &str, peer_id: Option<&str>, is_error: bool);

    fn on_contact_status(&self, peer_id: &str, presence: ContactPresence);

    /// A chat message for the active conversation.
    fn on_message(&self, peer_id: &str, message: &StoredMessage);

    fn on_typing(&self, peer_id: &str, is_typing: bool);

    /// `progress` is in `0.0..=1.0`, or [`PROGRESS_FAILED`]. `download` is set
    /// once a received file has been written.
    fn on_file_progress(
        &self,
        peer_id: &str,
        transfer_id: &str,
        progress: f64,
        download: Option<&Path>,
    );

    fn on_unread(&self, peer_id: &str, count: u32);

    /// The peer confirmed it received a file we sent.
    fn on_file_acknowledged(&self, peer_id: &str, transfer_id: &str);

    /// Contact list or friend requests changed.
    fn on_contacts_changed(&self);
}

/// Owned form of every notifier callback.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    System {
        text: String,
        peer_id: Option<String>,
        is_error: bool,
    },
    ContactStatus {
        peer_id: String,
        presence: ContactPresence,
    },
    Message {
        peer_id: String,
        message: StoredMessage,
    },
    Typing {
        peer_id: String,
        is_typing: bool,
    },
    FileProgress {
        peer_id: String,
        transfer_id: String,
        progress: f64,
        download: Option<PathBuf>,
    },
    Unread {
        peer_id: String,
        count: u32,
    },
    FileAcknowledged {
        peer_id: String,
        transfer_id: String,
    },
    ContactsChanged,
}

/// Publishes every callback as a [`UiEvent`] on a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<UiEvent>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: UiEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl UiNotifier for EventNotifier {
    fn on_system_message(&self, text: &str, peer_id: Option<&str>, is_error: bool) {
        self.publish(UiEvent::System {
            text: text.to_string(),
            peer_id: peer_id.map(str::to_string),
            is_error,
        });
    }

    fn on_contact_status(&self, peer_id: &str, presence: ContactPresence) {
        self.publish(UiEvent::ContactStatus {
            peer_id: peer_id.to_string(),
            presence,
        });
    }

    fn on_message(&self, peer_id: &str, message: &StoredMessage) {
        self.publish(UiEvent::Message {
            peer_id: peer_id.to_string(),
            message: message.clone(),
        });
    }

    fn on_typing(&self, peer_id: &str, is_typing: bool) {
        self.publish(UiEvent::Typing {
            peer_id: peer_id.to_string(),
            is_typing,
        });
    }

    fn on_file_progress(
        &self,
        peer_id: &str,
        transfer_id: &str,
        progress: f64,
        download: Option<&Path>,
    ) {
        self.publish(UiEvent::FileProgress {
            peer_id: peer_id.to_string(),
            transfer_id: transfer_id.to_string(),
            progress,
            download: download.map(Path::to_path_buf),
        });
    }

    fn on_unread(&self, peer_id: &str, count: u32) {
        self.publish(UiEvent::Unread {
            peer_id: peer_id.to_string(),
            count,
        });
    }

    fn on_file_acknowledged(&self, peer_id: &str, transfer_id: &str) {
        self.publish(UiEvent::FileAcknowledged {
            peer_id: peer_id.to_string(),
            transfer_id: transfer_id.to_string(),
        });
    }

    fn on_contacts_changed(&self) {
        self.publish(UiEvent::ContactsChanged);
    }
}

/// Logs every callback and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl UiNotifier for TracingNotifier {
    fn on_system_message(&self, text: &str, peer_id: Option<&str>, is_error: bool) {
        if is_error {
            tracing::warn!(peer = ?peer_id, "{}", text);
        } else {
            tracing::info!(peer = ?peer_id, "{}", text);
        }
    }

    fn on_contact_status(&self, peer_id: &str, presence: ContactPresence) {
        tracing::info!(peer = %peer_id, %presence, "contact status");
    }

    fn on_message(&self, peer_id: &str, message: &StoredMessage) {
        tracing::info!(peer = %peer_id, direction = message.direction.as_str(), "message");
    }

    fn on_typing(&self, peer_id: &str, is_typing: bool) {
        tracing::debug!(peer = %peer_id, is_typing, "typing");
    }

    fn on_file_progress(
        &self,
        peer_id: &str,
        transfer_id: &str,
        progress: f64,
        download: Option<&Path>,
    ) {
        tracing::debug!(peer = %peer_id, transfer = %transfer_id, progress, download = ?download, "file progress");
    }

    fn on_unread(&self, peer_id: &str, count: u32) {
        tracing::debug!(peer = %peer_id, count, "unread");
    }

    fn on_file_acknowledged(&self, peer_id: &str, transfer_id: &str) {
        tracing::info!(peer = %peer_id, transfer = %transfer_id, "file acknowledged");
    }

    fn on_contacts_changed(&self) {
        tracing::debug!("contacts changed");
    }
}
