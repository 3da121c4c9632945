// Durable room snapshots and the per-room serialized update primitive.
//
// Backends only move snapshot text in and out of storage. `RoomRepository`
// owns encoding, retries, and the per-room lock that makes every
// read-modify-write against a room's snapshot atomic for in-process callers.

pub mod file;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{StorageBackend, StorageConfig};
use crate::room::model::{RoomId, RoomState};

pub use file::FileRoomStore;
pub use sqlite::SqliteRoomStore;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on room `{room}`: {source}")]
    Io {
        room: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error on room `{room}`: {source}")]
    Sqlite {
        room: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("corrupt snapshot for room `{room}`: {source}")]
    Corrupt {
        room: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot for room `{room}`: {source}")]
    Encode {
        room: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage worker failed: {message}")]
    Worker { message: String },
}

impl StoreError {
    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io { .. } | StoreError::Sqlite { .. })
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// A place to keep one snapshot record per room.
///
/// Writes are full overwrites. A room with no record reads as `None`.
pub trait RoomStore: Send + Sync {
    fn read(&self, room: &RoomId) -> Result<Option<String>, StoreError>;
    fn write(&self, room: &RoomId, snapshot: &str) -> Result<(), StoreError>;
}

/// Build the backend selected in config.
pub fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn RoomStore>> {
    let path = config.resolved_path()?;
    let store: Arc<dyn RoomStore> = match config.backend {
        StorageBackend::File => Arc::new(FileRoomStore::new(path)?),
        StorageBackend::Sqlite => Arc::new(SqliteRoomStore::open(&path.to_string_lossy())?),
    };
    Ok(store)
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Bounded retry for transient storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            attempts: config.write_retries.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

type RoomLock = Arc<tokio::sync::Mutex<()>>;
type LockTable = Mutex<HashMap<RoomId, RoomLock>>;

/// Held for the duration of one room operation.
///
/// Dropping it releases the room and removes the room's lock table entry
/// once nobody else holds or waits on it, so the table only ever contains
/// rooms with work in flight.
struct RoomGuard<'a> {
    locks: &'a LockTable,
    room: RoomId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        // Release first so the guard's handle no longer counts.
        self.guard.take();
        // Every handle is cloned under the table mutex, so a count of one
        // here means no task holds or awaits this lock.
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(&self.room)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&self.room);
            }
        }
    }
}

/// Serialized access to room snapshots.
///
/// Both transports go through the same repository, so last-write-wins
/// ordering per room holds no matter where a command came from.
pub struct RoomRepository {
    store: Arc<dyn RoomStore>,
    locks: LockTable,
    retry: RetryPolicy,
}

impl RoomRepository {
    pub fn new(store: Arc<dyn RoomStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Wait for exclusive access to `room`.
    ///
    /// Panics if the lock table mutex is poisoned, which only happens if a
    /// thread panicked while touching an entry.
    async fn acquire(&self, room: &RoomId) -> RoomGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().expect("room lock table poisoned");
            Arc::clone(locks.entry(room.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        RoomGuard {
            locks: &self.locks,
            room: room.clone(),
            guard: Some(guard),
        }
    }

    /// Read the latest persisted state. Missing rooms read as empty.
    pub async fn read(&self, room: &RoomId) -> Result<RoomState, StoreError> {
        let _room = self.acquire(room).await;
        self.load(room).await
    }

    /// Run `observe` against the latest state while the room stays locked.
    ///
    /// Nothing can change the room until `observe` returns, so whatever it
    /// derives from the state (and sends) is ordered with respect to every
    /// update.
    pub async fn inspect<T, F>(&self, room: &RoomId, observe: F) -> Result<T, StoreError>
    where
        F: FnOnce(&RoomState) -> T,
    {
        let _room = self.acquire(room).await;
        let state = self.load(room).await?;
        Ok(observe(&state))
    }

    /// Load `room`, let `apply` mutate a copy, and persist the copy if it
    /// changed. The room stays locked for the whole cycle.
    ///
    /// If `apply` fails nothing is written. If the write fails the previous
    /// snapshot stays authoritative and the error is returned.
    pub async fn update<T, E, F>(&self, room: &RoomId, apply: F) -> Result<T, E>
    where
        F: FnOnce(&mut RoomState) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _room = self.acquire(room).await;

        let current = self.load(room).await?;
        let mut next = current.clone();
        let out = apply(&mut next)?;

        if next != current {
            self.save(room, &next).await?;
        } else {
            debug!(room = %room, "update left room unchanged, skipping write");
        }
        Ok(out)
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().expect("room lock table poisoned").len()
    }

    async fn load(&self, room: &RoomId) -> Result<RoomState, StoreError> {
        let id = room.clone();
        let text = self.with_retry(room, move |store| store.read(&id)).await?;
        match text {
            Some(text) => RoomState::from_snapshot(&text).map_err(|source| StoreError::Corrupt {
                room: room.to_string(),
                source,
            }),
            None => Ok(RoomState::default()),
        }
    }

    async fn save(&self, room: &RoomId, state: &RoomState) -> Result<(), StoreError> {
        let snapshot = state.to_snapshot().map_err(|source| StoreError::Encode {
            room: room.to_string(),
            source,
        })?;
        let id = room.clone();
        self.with_retry(room, move |store| store.write(&id, &snapshot))
            .await
    }

    /// Run a blocking store call off the async workers, retrying transient
    /// failures according to the policy.
    async fn with_retry<T, F>(&self, room: &RoomId, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&dyn RoomStore) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 1;
        loop {
            let store = Arc::clone(&self.store);
            let op = Arc::clone(&op);
            let result = tokio::task::spawn_blocking(move || op(store.as_ref()))
                .await
                .map_err(|e| StoreError::Worker {
                    message: e.to_string(),
                })?;

            match result {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!(room = %room, attempt, "room store call failed, retrying: {e}");
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
