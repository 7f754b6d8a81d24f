//! Device-local persistence for engine state.
//!
//! Everything stored here is a cache of server state plus the offline
//! queue, keyed by `(mission, user, slot)`. Bodies are JSON text. A slot
//! that fails to decode is logged and treated as empty: the server is the
//! source of truth and the next snapshot refills it.

pub mod lock;
pub mod schema;
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::clock::TimestampMs;
use crate::error::ErrorCode;

pub use lock::{LockError, StoreLock};
pub use sqlite::SqliteStore;

/// Named region of persisted state for one mission/user pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Queue,
    SelfTrace,
    PeerTraces,
    Viewport,
}

impl Slot {
    pub const ALL: [Self; 4] = [Self::Queue, Self::SelfTrace, Self::PeerTraces, Self::Viewport];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::SelfTrace => "self_trace",
            Self::PeerTraces => "peer_traces",
            Self::Viewport => "viewport",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|slot| slot.as_str() == s)
            .ok_or_else(|| format!("unknown slot '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub mission_id: String,
    pub user_id: String,
    pub slot: Slot,
}

impl StateKey {
    #[must_use]
    pub fn new(mission_id: impl Into<String>, user_id: impl Into<String>, slot: Slot) -> Self {
        Self {
            mission_id: mission_id.into(),
            user_id: user_id.into(),
            slot,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.mission_id, self.user_id, self.slot)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("encode: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Sqlite(_) | Self::Serialize(_) => ErrorCode::StoreWriteFailed,
            Self::Io(_) => ErrorCode::StoreOpenFailed,
            Self::Lock(err) => err.code(),
        }
    }
}

/// Key/value persistence used by the engine.
pub trait LocalStore {
    /// Raw body for `key`, if present.
    fn load(&self, key: &StateKey) -> Result<Option<String>, StoreError>;

    /// Replace the body for `key`.
    fn save(&mut self, key: &StateKey, body: &str, now: TimestampMs) -> Result<(), StoreError>;

    /// Returns whether anything was removed.
    fn remove(&mut self, key: &StateKey) -> Result<bool, StoreError>;

    /// Every stored key, sorted.
    fn keys(&self) -> Result<Vec<StateKey>, StoreError>;
}

/// In-process store for tests and simulation.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: BTreeMap<StateKey, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a slot directly, bypassing serialization.
    pub fn put_raw(&mut self, key: StateKey, body: impl Into<String>) {
        self.slots.insert(key, body.into());
    }
}

impl LocalStore for MemoryStore {
    fn load(&self, key: &StateKey) -> Result<Option<String>, StoreError> {
        Ok(self.slots.get(key).cloned())
    }

    fn save(&mut self, key: &StateKey, body: &str, _now: TimestampMs) -> Result<(), StoreError> {
        self.slots.insert(key.clone(), body.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &StateKey) -> Result<bool, StoreError> {
        Ok(self.slots.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<StateKey>, StoreError> {
        Ok(self.slots.keys().cloned().collect())
    }
}

/// Load and decode a slot. Read failures and corrupt bodies are logged and
/// reported as absent.
pub fn load_json<T: DeserializeOwned>(store: &dyn LocalStore, key: &StateKey) -> Option<T> {
    let body = match store.load(key) {
        Ok(Some(body)) => body,
        Ok(None) => return None,
        Err(error) => {
            warn!(%key, %error, code = %error.code(), "local state read failed, treating as empty");
            return None;
        }
    };
    match serde_json::from_str(&body) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(
                %key,
                %error,
                code = %ErrorCode::CorruptLocalState,
                "local state slot unreadable, treating as empty"
            );
            None
        }
    }
}

/// Encode and store a slot.
///
/// # Errors
///
/// Returns an error if encoding or the underlying store write fails.
pub fn save_json<T: Serialize + ?Sized>(
    store: &mut dyn LocalStore,
    key: &StateKey,
    value: &T,
    now: TimestampMs,
) -> Result<(), StoreError> {
    let body = serde_json::to_string(value)?;
    store.save(key, &body, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(slot: Slot) -> StateKey {
        StateKey::new("m1", "ana", slot)
    }

    #[test]
    fn slot_names_round_trip() {
        for slot in Slot::ALL {
            assert_eq!(slot.as_str().parse::<Slot>(), Ok(slot));
        }
        assert!("trace".parse::<Slot>().is_err());
    }

    #[test]
    fn memory_store_save_load_remove() {
        let mut store = MemoryStore::new();
        save_json(&mut store, &key(Slot::Viewport), &vec![1, 2, 3], 0).expect("save");
        let loaded: Option<Vec<i32>> = load_json(&store, &key(Slot::Viewport));
        assert_eq!(loaded, Some(vec![1, 2, 3]));
        assert!(store.remove(&key(Slot::Viewport)).expect("remove"));
        assert!(!store.remove(&key(Slot::Viewport)).expect("remove"));
    }

    #[test]
    fn corrupt_slot_reads_as_empty() {
        let mut store = MemoryStore::new();
        store.put_raw(key(Slot::Queue), "{not json");
        let loaded: Option<Vec<String>> = load_json(&store, &key(Slot::Queue));
        assert!(loaded.is_none());
    }

    #[test]
    fn keys_are_scoped_per_mission_and_user() {
        let mut store = MemoryStore::new();
        store.put_raw(StateKey::new("m2", "bo", Slot::Queue), "[]");
        store.put_raw(key(Slot::SelfTrace), "[]");
        let keys = store.keys().expect("keys");
        assert_eq!(keys[0].to_string(), "m1/ana/self_trace");
        assert_eq!(keys[1].to_string(), "m2/bo/queue");
    }
}
