// One pretty-printed JSON file per room.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use super::{RoomStore, StoreError};
use crate::room::model::RoomId;

/// Stores each room as `room_<id>.json` under a data directory.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// reader never sees a half-written record.
pub struct FileRoomStore {
    dir: PathBuf,
}

impl FileRoomStore {
    /// Use `dir` as the data directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create room data directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `room`. Room ids are already restricted to
    /// `[A-Za-z0-9_-]`, so they are safe to embed in a file name.
    pub fn path_for(&self, room: &RoomId) -> PathBuf {
        self.dir.join(format!("room_{}.json", room.as_str()))
    }

    fn io_error(room: &RoomId, source: std::io::Error) -> StoreError {
        StoreError::Io {
            room: room.to_string(),
            source,
        }
    }
}

impl RoomStore for FileRoomStore {
    fn read(&self, room: &RoomId) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(room)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(room, e)),
        }
    }

    fn write(&self, room: &RoomId, snapshot: &str) -> Result<(), StoreError> {
        let target = self.path_for(room);
        let tmp = target.with_extension("json.tmp");

        fs::write(&tmp, snapshot).map_err(|e| Self::io_error(room, e))?;
        fs::rename(&tmp, &target).map_err(|e| Self::io_error(room, e))?;

        debug!(room = %room, path = %target.display(), "room snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_room_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRoomStore::new(tmp.path()).unwrap();
        assert!(store.read(&RoomId::sanitize("empty")).unwrap().is_none());
    }

    #[test]
    fn write_then_read_returns_same_text() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRoomStore::new(tmp.path()).unwrap();
        let room = RoomId::sanitize("abc123");

        store.write(&room, "{\"users\": [], \"revealed\": true}").unwrap();
        assert_eq!(
            store.read(&room).unwrap().as_deref(),
            Some("{\"users\": [], \"revealed\": true}")
        );
    }

    #[test]
    fn write_overwrites_whole_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRoomStore::new(tmp.path()).unwrap();
        let room = RoomId::sanitize("r");

        store.write(&room, "first record, rather long").unwrap();
        store.write(&room, "second").unwrap();
        assert_eq!(store.read(&room).unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRoomStore::new(tmp.path()).unwrap();
        let room = RoomId::sanitize("r");

        store.write(&room, "{}").unwrap();
        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["room_r.json".to_string()]);
    }

    #[test]
    fn rooms_are_isolated_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRoomStore::new(tmp.path()).unwrap();
        let a = RoomId::sanitize("a");
        let b = RoomId::sanitize("b");

        store.write(&a, "A").unwrap();
        store.write(&b, "B").unwrap();
        fs::remove_file(store.path_for(&a)).unwrap();

        assert!(store.read(&a).unwrap().is_none());
        assert_eq!(store.read(&b).unwrap().as_deref(), Some("B"));
    }

    #[test]
    fn new_creates_nested_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("data").join("rooms");
        let store = FileRoomStore::new(&nested).unwrap();
        assert!(store.dir().is_dir());
    }
}
