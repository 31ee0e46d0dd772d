//! Message router for data-channel traffic.
//!
//! The [`MessageRouter`] receives every frame that arrives on an open data
//! channel, decrypts it when needed, and dispatches it by message type. It
//! updates contacts, history, incoming transfers and the notifier directly.
//! Anything that needs the session itself (replying, installing keys,
//! resetting, connecting) is returned as a [`RouterAction`] for the
//! orchestrator to carry out.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::messages::{
    FileAckPayload, FileMeta, FriendAcceptPayload, FriendCancelPayload, FriendDeclinePayload,
    FriendRequestPayload, NotFriendErrorPayload, ProfileInfoPayload, PublicKeyPayload,
};
use protocol::{
    decode_chunk, decode_decrypted, decode_frame, AppMessage, InboundFrame, ProtocolError,
    SharedKey,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::contacts::{Contact, ContactBook, FriendStatus, PendingRequest};
use crate::crypto::CryptoProvider;
use crate::files::{
    save_download, BeginOutcome, ChunkOutcome, CompletedTransfer, IncomingTransfers,
    TransferError,
};
use crate::notifier::{UiNotifier, PROGRESS_FAILED};
use crate::session::state::ContactPresence;
use crate::storage::{Direction, MessageStore, StorageError, StoredMessage};

/// Result type for router operations.
pub type RouterResult = Result<Vec<RouterAction>, RouterError>;

/// Errors that drop a single inbound message.
///
/// None of these reset the session.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Encrypted frame and no shared key for the sender.
    #[error("encrypted message received before key exchange")]
    MissingKey,

    #[error("failed to decrypt message: {0}")]
    Decrypt(ProtocolError),

    /// The peer's public key could not be imported.
    #[error("key exchange failed: {0}")]
    KeyExchange(ProtocolError),

    /// A known message type with an unusable payload.
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("file transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Work the router hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterAction {
    /// Send a message back to the same peer.
    Send {
        message: AppMessage,
        force_plaintext: bool,
    },
    /// Store the key pair derived from the peer's public key on the session.
    InstallKeys {
        peer_public_key: Value,
        shared_key: SharedKey,
    },
    /// Tear the session down.
    Reset { reason: String },
    /// Open a connection to the peer in the background.
    Connect,
    /// Drop the connection to the peer.
    Disconnect,
}

impl RouterAction {
    fn send(message: AppMessage) -> Self {
        RouterAction::Send {
            message,
            force_plaintext: false,
        }
    }
}

/// What the router needs to know about the session a frame arrived on.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub peer_id: &'a str,
    pub shared_key: Option<&'a SharedKey>,
    /// The peer's conversation is the active chat.
    pub is_active_chat: bool,
    /// The session is connected with an open channel.
    pub session_connected: bool,
}

/// Dispatches inbound data-channel frames.
pub struct MessageRouter {
    local_id: String,
    contacts: Arc<ContactBook>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn UiNotifier>,
    crypto: Arc<dyn CryptoProvider>,
    transfers: Mutex<IncomingTransfers>,
    download_dir: Option<PathBuf>,
}

impl MessageRouter {
    /// Create a new message router with the given collaborators.
    pub fn new(
        local_id: impl Into<String>,
        contacts: Arc<ContactBook>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn UiNotifier>,
        crypto: Arc<dyn CryptoProvider>,
        max_file_size: u64,
        download_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            contacts,
            store,
            notifier,
            crypto,
            transfers: Mutex::new(IncomingTransfers::new(max_file_size)),
            download_dir,
        }
    }

    fn transfers(&self) -> MutexGuard<'_, IncomingTransfers> {
        self.transfers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of incoming transfers in progress.
    pub fn active_transfers(&self) -> usize {
        self.transfers().len()
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Route one text frame.
    pub fn route_text(&self, ctx: &RouteContext<'_>, raw: &str) -> RouterResult {
        let message = match decode_frame(raw)? {
            InboundFrame::Encrypted(payload) => {
                let key = ctx.shared_key.ok_or(RouterError::MissingKey)?;
                let plaintext = self
                    .crypto
                    .decrypt(key, &payload)
                    .map_err(RouterError::Decrypt)?;
                match decode_decrypted(&plaintext)? {
                    InboundFrame::Message(message) => message,
                    InboundFrame::Unknown(kind) => return Ok(self.drop_unknown(ctx, &kind)),
                    // Rejected by decode_decrypted
                    InboundFrame::Encrypted(_) => return Ok(Vec::new()),
                }
            }
            InboundFrame::Message(message) => message,
            InboundFrame::Unknown(kind) => return Ok(self.drop_unknown(ctx, &kind)),
        };

        debug!(peer = %ctx.peer_id, kind = %message.kind(), "routing message");
        self.dispatch(ctx, message)
    }

    /// Route one binary frame, a file chunk.
    pub fn route_chunk(&self, ctx: &RouteContext<'_>, frame: &[u8]) -> RouterResult {
        if !ctx.session_connected {
            let transfer_id = decode_chunk(frame)?.transfer_id.to_string();
            let removed = self.transfers().remove(ctx.peer_id, &transfer_id);
            if removed.is_some() {
                warn!(
                    peer = %ctx.peer_id,
                    transfer = %transfer_id,
                    "chunk arrived on a session that is not connected, dropping transfer"
                );
                self.report_transfer_failed(ctx.peer_id, &transfer_id);
            }
            return Ok(Vec::new());
        }

        let outcome = self.transfers().accept_chunk(ctx.peer_id, frame);
        match outcome {
            Ok(ChunkOutcome::Ignored) => Ok(Vec::new()),
            Ok(ChunkOutcome::Progress {
                transfer_id,
                progress,
            }) => {
                self.notifier
                    .on_file_progress(ctx.peer_id, &transfer_id, progress, None);
                Ok(Vec::new())
            }
            Ok(ChunkOutcome::Complete(file)) => self.finish_transfer(file),
            Err(e) => {
                if let TransferError::Overshoot { transfer_id, .. } = &e {
                    self.report_transfer_failed(ctx.peer_id, transfer_id);
                }
                Err(e.into())
            }
        }
    }

    /// Drop every incoming transfer from `peer_id`, reporting each as failed.
    pub fn discard_transfers(&self, peer_id: &str) -> Vec<String> {
        let ids = self.transfers().remove_peer(peer_id);
        for id in &ids {
            info!(peer = %peer_id, transfer = %id, "discarding incomplete transfer");
            self.report_transfer_failed(peer_id, id);
        }
        ids
    }

    fn drop_unknown(&self, ctx: &RouteContext<'_>, kind: &str) -> Vec<RouterAction> {
        info!(peer = %ctx.peer_id, kind = %kind, "dropping message of unknown type");
        Vec::new()
    }

    fn dispatch(&self, ctx: &RouteContext<'_>, message: AppMessage) -> RouterResult {
        match message {
            AppMessage::Text(payload) => self.handle_text(ctx, payload.text),
            AppMessage::FileMeta(meta) => self.handle_file_meta(ctx, meta),
            AppMessage::Typing(payload) => {
                if ctx.is_active_chat {
                    self.notifier.on_typing(ctx.peer_id, payload.is_typing);
                }
                Ok(Vec::new())
            }
            AppMessage::PublicKey(payload) => self.handle_public_key(ctx, payload),
            AppMessage::FriendRequest(payload) => Ok(self.handle_friend_request(ctx, payload)),
            AppMessage::FriendAccept(payload) => Ok(self.handle_friend_accept(ctx, payload)),
            AppMessage::FriendDecline(payload) => Ok(self.handle_friend_decline(ctx, payload)),
            AppMessage::FriendCancel(payload) => Ok(self.handle_friend_cancel(ctx, payload)),
            AppMessage::FileAck(payload) => Ok(self.handle_file_ack(ctx, payload)),
            AppMessage::NotFriendError(payload) => Ok(self.handle_not_friend_error(ctx, payload)),
            AppMessage::ProfileInfo(payload) => Ok(self.handle_profile_info(ctx, payload)),
        }
    }

    // ========================================================================
    // Chat
    // ========================================================================

    fn not_friend_reply(&self) -> RouterAction {
        RouterAction::Send {
            message: AppMessage::NotFriendError(NotFriendErrorPayload {
                sender_id: self.local_id.clone(),
            }),
            force_plaintext: true,
        }
    }

    fn handle_text(&self, ctx: &RouteContext<'_>, text: String) -> RouterResult {
        if !self.contacts.contains(ctx.peer_id) {
            warn!(peer = %ctx.peer_id, "text from a non-contact, replying with not_friend_error");
            return Ok(vec![self.not_friend_reply()]);
        }

        let mut message = StoredMessage::text(ctx.peer_id, Direction::Incoming, text);
        message.id = Some(self.store.add_message(&message)?);
        self.show_or_mark_unread(ctx, &message);
        Ok(Vec::new())
    }

    fn show_or_mark_unread(&self, ctx: &RouteContext<'_>, message: &StoredMessage) {
        if ctx.is_active_chat {
            self.notifier.on_message(ctx.peer_id, message);
        } else if let Some(count) = self.contacts.increment_unread(ctx.peer_id) {
            self.notifier.on_unread(ctx.peer_id, count);
        }
    }

    // ========================================================================
    // Keys
    // ========================================================================

    fn handle_public_key(&self, ctx: &RouteContext<'_>, payload: PublicKeyPayload) -> RouterResult {
        let shared_key = self
            .crypto
            .derive_shared_key(&payload.jwk)
            .map_err(RouterError::KeyExchange)?;
        info!(peer = %ctx.peer_id, "derived shared key");
        Ok(vec![RouterAction::InstallKeys {
            peer_public_key: payload.jwk,
            shared_key,
        }])
    }

    // ========================================================================
    // Files
    // ========================================================================

    fn handle_file_meta(&self, ctx: &RouteContext<'_>, meta: FileMeta) -> RouterResult {
        if !self.contacts.contains(ctx.peer_id) {
            warn!(peer = %ctx.peer_id, "file from a non-contact, replying with not_friend_error");
            return Ok(vec![self.not_friend_reply()]);
        }

        let outcome = self.transfers().begin(ctx.peer_id, &meta);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if !meta.transfer_id.is_empty() {
                    self.report_transfer_failed(ctx.peer_id, &meta.transfer_id);
                }
                return Err(e.into());
            }
        };

        if matches!(outcome, BeginOutcome::Duplicate) {
            return Ok(Vec::new());
        }

        let mut placeholder = StoredMessage::file(
            ctx.peer_id,
            Direction::Incoming,
            &meta.transfer_id,
            &meta.name,
            meta.size,
        );
        placeholder.id = Some(self.store.add_message(&placeholder)?);
        self.show_or_mark_unread(ctx, &placeholder);

        match outcome {
            BeginOutcome::Complete(file) => self.finish_transfer(file),
            _ => {
                self.notifier
                    .on_file_progress(ctx.peer_id, &meta.transfer_id, 0.0, None);
                Ok(Vec::new())
            }
        }
    }

    fn finish_transfer(&self, file: CompletedTransfer) -> RouterResult {
        let download = match &self.download_dir {
            Some(dir) => match save_download(dir, &file) {
                Ok(path) => Some(path),
                Err(e) => {
                    self.report_transfer_failed(&file.peer_id, &file.transfer_id);
                    return Err(e.into());
                }
            },
            None => None,
        };

        info!(
            peer = %file.peer_id,
            transfer = %file.transfer_id,
            bytes = file.data.len(),
            path = ?download,
            "file received"
        );
        self.notifier
            .on_file_progress(&file.peer_id, &file.transfer_id, 1.0, download.as_deref());
        self.notifier.on_system_message(
            &format!("Received {} ({} bytes)", file.name, file.data.len()),
            Some(&file.peer_id),
            false,
        );

        Ok(vec![RouterAction::send(AppMessage::FileAck(FileAckPayload {
            transfer_id: file.transfer_id,
        }))])
    }

    fn report_transfer_failed(&self, peer_id: &str, transfer_id: &str) {
        self.notifier
            .on_file_progress(peer_id, transfer_id, PROGRESS_FAILED, None);
    }

    fn handle_file_ack(&self, ctx: &RouteContext<'_>, payload: FileAckPayload) -> Vec<RouterAction> {
        if payload.transfer_id.is_empty() {
            warn!(peer = %ctx.peer_id, "file_ack without transferId");
        } else {
            debug!(peer = %ctx.peer_id, transfer = %payload.transfer_id, "file acknowledged");
            self.notifier
                .on_file_acknowledged(ctx.peer_id, &payload.transfer_id);
        }
        Vec::new()
    }

    // ========================================================================
    // Friend workflow
    // ========================================================================

    fn save_contacts(&self) {
        if let Err(e) = self.contacts.save() {
            warn!(error = %e, "failed to save contact book");
        }
        self.notifier.on_contacts_changed();
    }

    fn handle_friend_request(
        &self,
        ctx: &RouteContext<'_>,
        payload: FriendRequestPayload,
    ) -> Vec<RouterAction> {
        if payload.sender_id != ctx.peer_id {
            warn!(
                peer = %ctx.peer_id,
                claimed = %payload.sender_id,
                "friend_request sender does not match, ignoring"
            );
            return Vec::new();
        }
        if self.contacts.has_outgoing_request(ctx.peer_id) {
            info!(peer = %ctx.peer_id, "friend request crossed with our own");
        }

        let name = payload
            .sender_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| ctx.peer_id.to_string());
        let timestamp = payload.timestamp.unwrap_or_else(crate::now_millis);

        self.contacts
            .add_incoming_request(PendingRequest::new(ctx.peer_id, &name, timestamp));
        self.contacts.upsert(Contact::new(
            ctx.peer_id,
            &name,
            FriendStatus::PendingIncoming,
        ));
        self.save_contacts();
        self.notifier.on_system_message(
            &format!("{name} wants to add you as a friend"),
            None,
            false,
        );
        Vec::new()
    }

    fn handle_friend_accept(
        &self,
        ctx: &RouteContext<'_>,
        payload: FriendAcceptPayload,
    ) -> Vec<RouterAction> {
        if payload.acceptor_id != ctx.peer_id {
            warn!(peer = %ctx.peer_id, "friend_accept acceptor does not match, ignoring");
            return Vec::new();
        }
        if !self.contacts.has_outgoing_request(ctx.peer_id) {
            warn!(peer = %ctx.peer_id, "unexpected friend_accept, ignoring");
            return Vec::new();
        }

        self.contacts.remove_outgoing_request(ctx.peer_id);
        let name = payload
            .acceptor_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| ctx.peer_id.to_string());
        self.contacts
            .upsert(Contact::new(ctx.peer_id, &name, FriendStatus::Confirmed));
        self.save_contacts();

        self.notifier.on_system_message(
            &format!("{name} accepted your friend request"),
            None,
            false,
        );
        self.notifier
            .on_contact_status(ctx.peer_id, ContactPresence::Connecting);
        vec![RouterAction::Connect]
    }

    fn handle_friend_decline(
        &self,
        ctx: &RouteContext<'_>,
        payload: FriendDeclinePayload,
    ) -> Vec<RouterAction> {
        if payload.decliner_id != ctx.peer_id {
            warn!(peer = %ctx.peer_id, "friend_decline decliner does not match, ignoring");
            return Vec::new();
        }
        if !self.contacts.has_outgoing_request(ctx.peer_id) {
            warn!(peer = %ctx.peer_id, "unexpected friend_decline, ignoring");
            return Vec::new();
        }

        self.contacts.remove_outgoing_request(ctx.peer_id);
        let name = self
            .contacts
            .remove(ctx.peer_id)
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| ctx.peer_id.to_string());
        self.save_contacts();

        self.notifier.on_system_message(
            &format!("{name} declined your friend request"),
            None,
            false,
        );
        vec![RouterAction::Disconnect]
    }

    fn handle_friend_cancel(
        &self,
        ctx: &RouteContext<'_>,
        payload: FriendCancelPayload,
    ) -> Vec<RouterAction> {
        if payload.canceller_id != ctx.peer_id {
            warn!(peer = %ctx.peer_id, "friend_cancel canceller does not match, ignoring");
            return Vec::new();
        }
        if !self.contacts.has_incoming_request(ctx.peer_id) {
            warn!(peer = %ctx.peer_id, "friend_cancel without a pending request, ignoring");
            return Vec::new();
        }

        self.contacts.remove_incoming_request(ctx.peer_id);
        let name = self
            .contacts
            .remove(ctx.peer_id)
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| ctx.peer_id.to_string());
        self.save_contacts();

        self.notifier.on_system_message(
            &format!("{name} withdrew their friend request"),
            None,
            false,
        );
        Vec::new()
    }

    fn handle_not_friend_error(
        &self,
        ctx: &RouteContext<'_>,
        _payload: NotFriendErrorPayload,
    ) -> Vec<RouterAction> {
        let Some(contact) = self.contacts.get(ctx.peer_id) else {
            warn!(peer = %ctx.peer_id, "not_friend_error from a non-contact, ignoring");
            return Vec::new();
        };
        if contact.friend_status == FriendStatus::RemovedByPeer {
            debug!(peer = %ctx.peer_id, "already marked as removed by peer");
            return Vec::new();
        }

        self.contacts
            .set_friend_status(ctx.peer_id, FriendStatus::RemovedByPeer);
        self.save_contacts();
        self.notifier.on_system_message(
            &format!(
                "{} removed you from their contacts. You can send a new friend request.",
                contact.display_name()
            ),
            None,
            false,
        );
        vec![RouterAction::Reset {
            reason: "peer removed us from their contacts".to_string(),
        }]
    }

    // ========================================================================
    // Profile
    // ========================================================================

    fn handle_profile_info(
        &self,
        ctx: &RouteContext<'_>,
        payload: ProfileInfoPayload,
    ) -> Vec<RouterAction> {
        if payload.is_empty() {
            warn!(peer = %ctx.peer_id, "profile_info without nickname or avatar");
            return Vec::new();
        }

        let changed = self.contacts.update_profile(
            ctx.peer_id,
            payload.nickname.as_deref(),
            payload.avatar.as_deref(),
        );
        if changed {
            debug!(peer = %ctx.peer_id, "updated contact profile");
            self.save_contacts();
        }
        Vec::new()
    }
}
