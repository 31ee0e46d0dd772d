//! Incoming transfer bookkeeping and download writing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use protocol::messages::FileMeta;
use protocol::{decode_chunk, ProtocolError, TRANSFER_ID_SEARCH_WINDOW};
use thiserror::Error;

/// Errors that can occur during file transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A required `fileMeta` field was empty.
    #[error("file metadata is missing {0}")]
    MissingField(&'static str),

    /// The transfer id cannot be framed.
    #[error("invalid transfer id: {0}")]
    InvalidTransferId(String),

    /// File too large.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// More bytes arrived than were announced.
    #[error("transfer {transfer_id} overshot: expected {expected} bytes, received {received}")]
    Overshoot {
        transfer_id: String,
        expected: u64,
        received: u64,
    },

    #[error("no open data channel to {0}")]
    ChannelUnavailable(String),

    /// The frame could not be parsed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// State for one file being received.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub peer_id: String,
    pub transfer_id: String,
    pub name: String,
    /// Announced size in bytes.
    pub size: u64,
    pub mime_type: String,
    /// Bytes received so far.
    pub received: u64,
    chunks: Vec<Bytes>,
}

impl IncomingTransfer {
    /// Fraction received, `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            1.0
        } else {
            self.received as f64 / self.size as f64
        }
    }

    fn into_completed(self) -> CompletedTransfer {
        let mut data = Vec::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        CompletedTransfer {
            peer_id: self.peer_id,
            transfer_id: self.transfer_id,
            name: self.name,
            mime_type: self.mime_type,
            data,
        }
    }
}

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub peer_id: String,
    pub transfer_id: String,
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Result of registering a `fileMeta`.
#[derive(Debug)]
pub enum BeginOutcome {
    Started,
    /// The id is already in progress; the announcement is ignored.
    Duplicate,
    /// An empty file needs no chunks.
    Complete(CompletedTransfer),
}

/// Result of accepting one chunk frame.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// No transfer with this id from this peer; the frame is dropped.
    Ignored,
    Progress { transfer_id: String, progress: f64 },
    Complete(CompletedTransfer),
}

/// Map key: the sending peer and its transfer id.
type TransferKey = (String, String);

fn key(peer_id: &str, transfer_id: &str) -> TransferKey {
    (peer_id.to_string(), transfer_id.to_string())
}

/// All incoming transfers, keyed by sender and transfer id.
#[derive(Debug)]
pub struct IncomingTransfers {
    transfers: HashMap<TransferKey, IncomingTransfer>,
    max_file_size: u64,
}

impl IncomingTransfers {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            transfers: HashMap::new(),
            max_file_size,
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn get(&self, peer_id: &str, transfer_id: &str) -> Option<&IncomingTransfer> {
        self.transfers.get(&key(peer_id, transfer_id))
    }

    /// Register a transfer announced by `peer_id`.
    pub fn begin(&mut self, peer_id: &str, meta: &FileMeta) -> Result<BeginOutcome, TransferError> {
        if meta.transfer_id.is_empty() {
            return Err(TransferError::MissingField("transferId"));
        }
        if meta.name.is_empty() {
            return Err(TransferError::MissingField("name"));
        }
        if meta.transfer_id.len() >= TRANSFER_ID_SEARCH_WINDOW
            || meta.transfer_id.contains(protocol::CHUNK_SEPARATOR as char)
        {
            return Err(TransferError::InvalidTransferId(meta.transfer_id.clone()));
        }
        if meta.size > self.max_file_size {
            return Err(TransferError::FileTooLarge {
                size: meta.size,
                limit: self.max_file_size,
            });
        }
        if self.transfers.contains_key(&key(peer_id, &meta.transfer_id)) {
            tracing::debug!(
                peer = %peer_id,
                transfer = %meta.transfer_id,
                "ignoring duplicate file announcement"
            );
            return Ok(BeginOutcome::Duplicate);
        }

        let transfer = IncomingTransfer {
            peer_id: peer_id.to_string(),
            transfer_id: meta.transfer_id.clone(),
            name: meta.name.clone(),
            size: meta.size,
            mime_type: meta.mime_type.clone(),
            received: 0,
            chunks: Vec::new(),
        };

        if meta.size == 0 {
            return Ok(BeginOutcome::Complete(transfer.into_completed()));
        }

        tracing::info!(
            peer = %peer_id,
            transfer = %meta.transfer_id,
            name = %meta.name,
            size = meta.size,
            "incoming file transfer"
        );
        self.transfers.insert(key(peer_id, &meta.transfer_id), transfer);
        Ok(BeginOutcome::Started)
    }

    /// Add one chunk frame received from `peer_id`.
    ///
    /// An overshooting chunk removes the transfer and returns an error.
    pub fn accept_chunk(&mut self, peer_id: &str, frame: &[u8]) -> Result<ChunkOutcome, TransferError> {
        let chunk = decode_chunk(frame)?;

        let transfer_key = key(peer_id, chunk.transfer_id);
        let Some(transfer) = self.transfers.get_mut(&transfer_key) else {
            tracing::debug!(
                peer = %peer_id,
                transfer = %chunk.transfer_id,
                "chunk for unknown transfer"
            );
            return Ok(ChunkOutcome::Ignored);
        };

        transfer.received += chunk.data.len() as u64;
        transfer.chunks.push(Bytes::copy_from_slice(chunk.data));

        if transfer.received > transfer.size {
            let expected = transfer.size;
            let received = transfer.received;
            let transfer_id = chunk.transfer_id.to_string();
            self.transfers.remove(&transfer_key);
            return Err(TransferError::Overshoot {
                transfer_id,
                expected,
                received,
            });
        }

        if transfer.received == transfer.size {
            return Ok(match self.transfers.remove(&transfer_key) {
                Some(done) => ChunkOutcome::Complete(done.into_completed()),
                None => ChunkOutcome::Ignored,
            });
        }

        Ok(ChunkOutcome::Progress {
            transfer_id: transfer.transfer_id.clone(),
            progress: transfer.progress(),
        })
    }

    /// Drop one transfer.
    pub fn remove(&mut self, peer_id: &str, transfer_id: &str) -> Option<IncomingTransfer> {
        self.transfers.remove(&key(peer_id, transfer_id))
    }

    /// Drop every transfer from `peer_id` and return their ids.
    pub fn remove_peer(&mut self, peer_id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        self.transfers.retain(|(owner, id), _| {
            if owner == peer_id {
                ids.push(id.clone());
                false
            } else {
                true
            }
        });
        ids
    }
}

/// A fresh transfer id. Short enough for the chunk search window.
pub fn new_transfer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Write a completed file into `dir` and return its path.
///
/// Only the final component of the sender's name is used. An existing file
/// is never overwritten; a numeric suffix is added instead.
pub fn save_download(dir: &Path, file: &CompletedTransfer) -> Result<PathBuf, TransferError> {
    fs::create_dir_all(dir)?;

    let name = Path::new(&file.name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("download");

    let mut destination = dir.join(name);
    let mut counter = 1;
    while destination.exists() {
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        destination = match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) => dir.join(format!("{stem} ({counter}).{ext}")),
            None => dir.join(format!("{stem} ({counter})")),
        };
        counter += 1;
    }

    // Atomic write: temp file, then rename
    let temp_path = dir.join(format!(".{}.part", file.transfer_id));
    fs::write(&temp_path, &file.data)?;
    if let Err(e) = fs::rename(&temp_path, &destination) {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            tracing::warn!(path = ?temp_path, error = %cleanup, "Failed to cleanup partial download");
        }
        return Err(e.into());
    }

    tracing::info!(path = %destination.display(), bytes = file.data.len(), "saved download");
    Ok(destination)
}
