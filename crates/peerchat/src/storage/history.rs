//! SQLite message history.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use super::{Direction, MessageBody, MessageStore, StorageError, StorageResult, StoredMessage};

/// File name of the history database inside the data directory.
pub const HISTORY_DB_FILE: &str = "history.db";

/// Current schema version.
#[cfg(test)]
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Message history backed by SQLite.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Open or create a database at the given path.
    ///
    /// If the database doesn't exist, it will be created and migrations will be run.
    /// If it exists, any pending migrations will be applied.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Opens `<data_dir>/history.db`.
    pub fn in_data_dir<P: AsRef<Path>>(data_dir: P) -> StorageResult<Self> {
        Self::open(data_dir.as_ref().join(HISTORY_DB_FILE))
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> StorageResult<Self> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> StorageResult<i32> {
        schema_version(&self.conn())
    }
}

fn schema_version(conn: &Connection) -> StorageResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations.
fn run_migrations(conn: &mut Connection) -> StorageResult<()> {
    let current_version = schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration to version 1: Initial schema.
fn migrate_v1(conn: &mut Connection) -> StorageResult<()> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            peer_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            body TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_peer_id
        ON messages(peer_id, timestamp)
        "#,
        [],
    )?;

    tx.execute("PRAGMA user_version = 1", [])?;
    tx.commit()?;
    Ok(())
}

impl MessageStore for SqliteMessageStore {
    fn add_message(&self, message: &StoredMessage) -> StorageResult<i64> {
        let body = serde_json::to_string(&message.body)?;
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO messages (peer_id, direction, body, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                message.peer_id,
                message.direction.as_str(),
                body,
                message.timestamp as i64
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn messages_for_peer(&self, peer_id: &str) -> StorageResult<Vec<StoredMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, peer_id, direction, body, timestamp
            FROM messages
            WHERE peer_id = ?1
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(params![peer_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, peer_id, direction, body, timestamp) in rows {
            let Some(direction) = Direction::from_db(&direction) else {
                tracing::warn!(id, direction = %direction, "skipping history row with unknown direction");
                continue;
            };
            let body: MessageBody = serde_json::from_str(&body)?;
            messages.push(StoredMessage {
                id: Some(id),
                peer_id,
                direction,
                body,
                timestamp: timestamp.max(0) as u64,
            });
        }
        Ok(messages)
    }

    fn delete_messages_for_peer(&self, peer_id: &str) -> StorageResult<usize> {
        let removed = self
            .conn()
            .execute("DELETE FROM messages WHERE peer_id = ?1", params![peer_id])?;
        tracing::debug!(peer = %peer_id, removed, "deleted message history");
        Ok(removed)
    }
}
