// SQLite-backed room snapshots: one row of JSON text per room.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::{RoomStore, StoreError};
use crate::room::model::RoomId;

/// Keeps each room's snapshot in a `rooms` table keyed by room id.
pub struct SqliteRoomStore {
    conn: Mutex<Connection>,
}

impl SqliteRoomStore {
    /// Open (or create) a database at `path` and ensure the schema exists.
    /// Pass `":memory:"` for an ephemeral database (useful for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rooms (
                room_id    TEXT PRIMARY KEY,
                snapshot   TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

fn sqlite_error(room: &RoomId, source: rusqlite::Error) -> StoreError {
    StoreError::Sqlite {
        room: room.to_string(),
        source,
    }
}

impl RoomStore for SqliteRoomStore {
    fn read(&self, room: &RoomId) -> Result<Option<String>, StoreError> {
        self.conn()
            .query_row(
                "SELECT snapshot FROM rooms WHERE room_id = ?1",
                params![room.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sqlite_error(room, e))
    }

    /// Replace the room's row. INSERT OR REPLACE keeps this a single
    /// statement, so the row is either fully old or fully new.
    fn write(&self, room: &RoomId, snapshot: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO rooms (room_id, snapshot) VALUES (?1, ?2)",
                params![room.as_str(), snapshot],
            )
            .map_err(|e| sqlite_error(room, e))?;
        Ok(())
    }
}
