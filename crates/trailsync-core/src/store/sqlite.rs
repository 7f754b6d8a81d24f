//! SQLite-backed [`LocalStore`].
//!
//! Runtime pragmas match a single-writer, occasionally-read workload:
//! - `journal_mode = WAL` so `trailsync status` can read while an engine writes
//! - `busy_timeout = 5s` to ride out short contention
//! - `synchronous = NORMAL`; a lost last write is recovered from the server

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::lock::{DEFAULT_LOCK_TIMEOUT, StoreLock};
use super::{LocalStore, StateKey, StoreError, schema};
use crate::clock::TimestampMs;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// File name of the local state database inside the data directory.
pub const DB_FILE_NAME: &str = "trailsync.sqlite3";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    _lock: Option<StoreLock>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` as the exclusive writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer lock is held elsewhere, or if opening,
    /// configuring or migrating the database fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let lock = StoreLock::acquire(&StoreLock::path_for(path), DEFAULT_LOCK_TIMEOUT)?;
        let conn = open_connection(path)?;
        debug!(path = %path.display(), "opened local state store");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            _lock: Some(lock),
        })
    }

    /// Open without taking the writer lock, for inspection tools.
    ///
    /// # Errors
    ///
    /// Returns an error if opening, configuring or migrating the database fails.
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: open_connection(path)?,
            path: Some(path.to_path_buf()),
            _lock: None,
        })
    }

    /// # Errors
    ///
    /// Returns an error if migrating the in-memory database fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: None,
            _lock: None,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Last write time of a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn updated_at(&self, key: &StateKey) -> Result<Option<TimestampMs>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT updated_at_ms FROM local_state
                 WHERE mission_id = ?1 AND user_id = ?2 AND slot = ?3",
                params![key.mission_id, key.user_id, key.slot.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(path)?;
    configure_connection(&conn)?;
    schema::migrate(&mut conn)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

impl LocalStore for SqliteStore {
    fn load(&self, key: &StateKey) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT body_json FROM local_state
                 WHERE mission_id = ?1 AND user_id = ?2 AND slot = ?3",
                params![key.mission_id, key.user_id, key.slot.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn save(&mut self, key: &StateKey, body: &str, now: TimestampMs) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO local_state (mission_id, user_id, slot, body_json, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (mission_id, user_id, slot)
             DO UPDATE SET body_json = excluded.body_json, updated_at_ms = excluded.updated_at_ms",
            params![key.mission_id, key.user_id, key.slot.as_str(), body, now],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &StateKey) -> Result<bool, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM local_state WHERE mission_id = ?1 AND user_id = ?2 AND slot = ?3",
            params![key.mission_id, key.user_id, key.slot.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn keys(&self) -> Result<Vec<StateKey>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT mission_id, user_id, slot FROM local_state
             ORDER BY mission_id, user_id, slot",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            let (mission_id, user_id, slot) = row?;
            // The schema CHECK constraint restricts slot names.
            if let Ok(slot) = slot.parse() {
                keys.push(StateKey::new(mission_id, user_id, slot));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LockError, Slot};

    fn temp_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DB_FILE_NAME);
        (dir, path)
    }

    #[test]
    fn open_sets_wal_and_busy_timeout() {
        let (_dir, path) = temp_db();
        let store = SqliteStore::open(&path).expect("open");

        let journal_mode: String = store
            .conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = store
            .conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(u128::from(busy_timeout_ms), DEFAULT_BUSY_TIMEOUT.as_millis());
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn save_overwrites_and_tracks_update_time() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        let key = StateKey::new("m1", "ana", Slot::Queue);
        store.save(&key, "[]", 10).expect("save");
        store.save(&key, "[1]", 20).expect("save");
        assert_eq!(store.load(&key).expect("load").as_deref(), Some("[1]"));
        assert_eq!(store.updated_at(&key).expect("updated"), Some(20));
        assert!(store.remove(&key).expect("remove"));
        assert_eq!(store.load(&key).expect("load"), None);
    }

    #[test]
    fn second_writer_is_locked_out() {
        let (_dir, path) = temp_db();
        let _first = SqliteStore::open(&path).expect("open");
        let err = SqliteStore::open(&path).expect_err("locked");
        assert!(matches!(err, StoreError::Lock(LockError::Timeout { .. })));
        SqliteStore::open_read_only(&path).expect("readers are not locked out");
    }
}
