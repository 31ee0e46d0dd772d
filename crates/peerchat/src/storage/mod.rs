//! Storage collaborators.
//!
//! This module provides on-disk persistence for:
//! - Message history (SQLite, `<data_dir>/history.db`)
//! - The local identity key pair (`<data_dir>/identity.key`)
//!
//! The orchestrator only sees the [`MessageStore`] trait, so tests can swap in
//! an in-memory database.

mod history;
mod keys;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use history::{SqliteMessageStore, HISTORY_DB_FILE};
pub use keys::{KeyStore, IDENTITY_KEY_FILE};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored message body is not valid JSON.
    #[error("corrupt message body: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored key material could not be decoded.
    #[error("invalid key file: {0}")]
    InvalidKey(String),

    /// Path error.
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "incoming" => Some(Direction::Incoming),
            "outgoing" => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

/// What a history entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    Text { text: String },
    /// Placeholder for a file transfer.
    File {
        transfer_id: String,
        name: String,
        size: u64,
    },
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Row id, assigned on insert.
    #[serde(default)]
    pub id: Option<i64>,
    pub peer_id: String,
    pub direction: Direction,
    pub body: MessageBody,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

impl StoredMessage {
    pub fn text(peer_id: impl Into<String>, direction: Direction, text: impl Into<String>) -> Self {
        Self {
            id: None,
            peer_id: peer_id.into(),
            direction,
            body: MessageBody::Text { text: text.into() },
            timestamp: crate::now_millis(),
        }
    }

    pub fn file(
        peer_id: impl Into<String>,
        direction: Direction,
        transfer_id: impl Into<String>,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: None,
            peer_id: peer_id.into(),
            direction,
            body: MessageBody::File {
                transfer_id: transfer_id.into(),
                name: name.into(),
                size,
            },
            timestamp: crate::now_millis(),
        }
    }
}

/// Message history consumed by the orchestrator.
pub trait MessageStore: Send + Sync {
    /// Append a message and return its row id.
    fn add_message(&self, message: &StoredMessage) -> StorageResult<i64>;

    /// Messages exchanged with `peer_id`, oldest first.
    fn messages_for_peer(&self, peer_id: &str) -> StorageResult<Vec<StoredMessage>>;

    /// Delete the history of `peer_id`. Returns the number of rows removed.
    fn delete_messages_for_peer(&self, peer_id: &str) -> StorageResult<usize>;
}
