//! Persistent contact book.
//!
//! Contacts outlive peer sessions: a contact keeps its friendship status,
//! display metadata and unread counter while sessions come and go. The book
//! persists to JSON at `<data_dir>/contacts.json`; presence and unread counts
//! are runtime-only and start from zero on every load.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::state::ContactPresence;

/// File name of the contact book inside the data directory.
pub const CONTACTS_FILE: &str = "contacts.json";

/// Friendship workflow status of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    /// They asked us; we have not answered.
    PendingIncoming,
    /// We asked them; they have not answered.
    PendingOutgoing,
    Confirmed,
    /// They removed us. Kept so the user sees why messages bounce.
    RemovedByPeer,
}

/// A contact entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Peer id of the contact.
    pub id: String,
    /// Name the contact was added under.
    pub name: String,
    pub friend_status: FriendStatus,
    /// Nickname advertised by the peer in `profile_info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Milliseconds since the epoch when the contact was created.
    #[serde(default)]
    pub added_at: u64,
    #[serde(skip)]
    pub presence: ContactPresence,
    #[serde(skip)]
    pub unread: u32,
}

impl Contact {
    pub fn new(id: impl Into<String>, name: impl Into<String>, friend_status: FriendStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            friend_status,
            nickname: None,
            avatar: None,
            added_at: crate::now_millis(),
            presence: ContactPresence::Offline,
            unread: 0,
        }
    }

    /// Nickname if the peer sent one, otherwise the stored name.
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.name)
    }

    pub fn is_online(&self) -> bool {
        self.presence == ContactPresence::Online
    }
}

/// An unanswered friend request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Peer id on the other end of the request.
    pub id: String,
    pub name: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

impl PendingRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            timestamp,
        }
    }
}

/// Wrapper for serializing the contact book.
#[derive(Debug, Serialize, Deserialize)]
struct ContactBookData {
    /// Version of the file format.
    version: u32,
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    incoming_requests: Vec<PendingRequest>,
    #[serde(default)]
    outgoing_requests: Vec<PendingRequest>,
}

#[derive(Debug, Default)]
struct BookState {
    contacts: HashMap<String, Contact>,
    incoming: HashMap<String, PendingRequest>,
    outgoing: HashMap<String, PendingRequest>,
}

/// Thread-safe contact book.
///
/// Mutations do not save automatically; call [`ContactBook::save`] after
/// changing persistent fields.
#[derive(Debug)]
pub struct ContactBook {
    /// Backing file. `None` keeps the book in memory only.
    path: Option<PathBuf>,
    state: RwLock<BookState>,
}

impl ContactBook {
    /// Creates a book that persists to the given path. Does not load it.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            state: RwLock::new(BookState::default()),
        }
    }

    /// Creates a book at `<data_dir>/contacts.json`.
    pub fn in_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::new(data_dir.as_ref().join(CONTACTS_FILE))
    }

    /// Creates a book that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(BookState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // A poisoned lock only means a panic elsewhere; the maps are still consistent.
    fn read(&self) -> RwLockReadGuard<'_, BookState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BookState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Loads the book from disk, replacing the in-memory contents.
    ///
    /// A missing file leaves the book empty.
    pub fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            tracing::debug!("Contact book not found at {:?}, starting empty", path);
            return Ok(());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read contact book: {}", path.display()))?;
        let data: ContactBookData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse contact book: {}", path.display()))?;

        let mut state = self.write();
        state.contacts = data
            .contacts
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        state.incoming = data
            .incoming_requests
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        state.outgoing = data
            .outgoing_requests
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        tracing::info!("Loaded {} contacts from {:?}", state.contacts.len(), path);
        Ok(())
    }

    /// Saves the book.
    ///
    /// Uses atomic write (write to temp file, then rename) to prevent corruption.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create contact book directory: {}", parent.display())
            })?;
        }

        let contents = {
            let state = self.read();
            let mut contacts: Vec<Contact> = state.contacts.values().cloned().collect();
            contacts.sort_by(|a, b| a.id.cmp(&b.id));
            let data = ContactBookData {
                version: 1,
                contacts,
                incoming_requests: state.incoming.values().cloned().collect(),
                outgoing_requests: state.outgoing.values().cloned().collect(),
            };
            serde_json::to_string_pretty(&data).context("Failed to serialize contact book")?
        };

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp contact book: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to rename temp contact book {} to {}",
                temp_path.display(),
                path.display()
            )
        })?;

        tracing::debug!("Saved contact book to {:?}", path);
        Ok(())
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    pub fn get(&self, id: &str) -> Option<Contact> {
        self.read().contacts.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contacts.contains_key(id)
    }

    /// All contacts, ordered by id.
    pub fn list(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.read().contacts.values().cloned().collect();
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        contacts
    }

    pub fn len(&self) -> usize {
        self.read().contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a contact, or updates status and name of an existing one while
    /// keeping its profile and runtime fields.
    pub fn upsert(&self, contact: Contact) {
        let mut state = self.write();
        match state.contacts.get_mut(&contact.id) {
            Some(existing) => {
                existing.name = contact.name;
                existing.friend_status = contact.friend_status;
            }
            None => {
                tracing::info!(
                    contact = %contact.id,
                    status = ?contact.friend_status,
                    "adding contact"
                );
                state.contacts.insert(contact.id.clone(), contact);
            }
        }
    }

    /// Returns `false` if the contact does not exist.
    pub fn set_friend_status(&self, id: &str, status: FriendStatus) -> bool {
        let mut state = self.write();
        match state.contacts.get_mut(id) {
            Some(contact) => {
                tracing::info!(
                    contact = %id,
                    from = ?contact.friend_status,
                    to = ?status,
                    "changing friend status"
                );
                contact.friend_status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Contact> {
        let removed = self.write().contacts.remove(id);
        if removed.is_some() {
            tracing::info!(contact = %id, "removed contact");
        }
        removed
    }

    /// Returns `true` if the presence changed.
    pub fn set_presence(&self, id: &str, presence: ContactPresence) -> bool {
        let mut state = self.write();
        match state.contacts.get_mut(id) {
            Some(contact) if contact.presence != presence => {
                contact.presence = presence;
                true
            }
            _ => false,
        }
    }

    /// Marks every contact offline and returns the ids that changed.
    pub fn set_all_offline(&self) -> Vec<String> {
        let mut state = self.write();
        let mut changed: Vec<String> = state
            .contacts
            .values_mut()
            .filter(|c| c.presence != ContactPresence::Offline)
            .map(|c| {
                c.presence = ContactPresence::Offline;
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Bumps the unread counter and returns the new value.
    pub fn increment_unread(&self, id: &str) -> Option<u32> {
        let mut state = self.write();
        state.contacts.get_mut(id).map(|c| {
            c.unread = c.unread.saturating_add(1);
            c.unread
        })
    }

    /// Returns `true` if there was anything to clear.
    pub fn clear_unread(&self, id: &str) -> bool {
        let mut state = self.write();
        match state.contacts.get_mut(id) {
            Some(contact) if contact.unread > 0 => {
                contact.unread = 0;
                true
            }
            _ => false,
        }
    }

    /// Applies profile fields that are present. Returns `true` if anything
    /// changed.
    pub fn update_profile(&self, id: &str, nickname: Option<&str>, avatar: Option<&str>) -> bool {
        let mut state = self.write();
        let Some(contact) = state.contacts.get_mut(id) else {
            return false;
        };

        let mut changed = false;
        if let Some(nickname) = nickname {
            if contact.nickname.as_deref() != Some(nickname) {
                contact.nickname = Some(nickname.to_string());
                changed = true;
            }
        }
        if let Some(avatar) = avatar {
            if contact.avatar.as_deref() != Some(avatar) {
                contact.avatar = Some(avatar.to_string());
                changed = true;
            }
        }
        changed
    }

    // =========================================================================
    // Pending friend requests
    // =========================================================================

    pub fn add_incoming_request(&self, request: PendingRequest) {
        tracing::info!(peer = %request.id, "recording incoming friend request");
        self.write().incoming.insert(request.id.clone(), request);
    }

    pub fn add_outgoing_request(&self, request: PendingRequest) {
        tracing::info!(peer = %request.id, "recording outgoing friend request");
        self.write().outgoing.insert(request.id.clone(), request);
    }

    pub fn remove_incoming_request(&self, id: &str) -> bool {
        self.write().incoming.remove(id).is_some()
    }

    pub fn remove_outgoing_request(&self, id: &str) -> bool {
        self.write().outgoing.remove(id).is_some()
    }

    pub fn has_incoming_request(&self, id: &str) -> bool {
        self.read().incoming.contains_key(id)
    }

    pub fn has_outgoing_request(&self, id: &str) -> bool {
        self.read().outgoing.contains_key(id)
    }

    /// Incoming requests, oldest first.
    pub fn incoming_requests(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<_> = self.read().incoming.values().cloned().collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }

    /// Outgoing requests, oldest first.
    pub fn outgoing_requests(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<_> = self.read().outgoing.values().cloned().collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }
}
