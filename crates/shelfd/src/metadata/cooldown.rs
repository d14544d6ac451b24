//! Per-title metadata cooldowns, persisted as one JSON map.
//!
//! A cooldown is recorded after every API attempt, success or not, so a
//! flapping title cannot hammer the API. Writes are monotonic: a recorded
//! `not_before` never moves backwards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;

use shelf_core::config::atomic_write_bytes;

/// Persisted `title key -> not_before` map.
#[derive(Debug)]
pub struct CooldownStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl CooldownStore {
    /// Load the store, tolerating a missing or corrupt file.
    pub fn open(path: PathBuf) -> Self {
        let state = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// True when the title must not hit the API yet.
    pub fn is_cooling(&self, title_key: &str, now: DateTime<Utc>) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(title_key)
            .is_some_and(|not_before| *not_before > now)
    }

    /// Record a cooldown and persist. Existing later deadlines win.
    pub fn record(&self, title_key: &str, not_before: DateTime<Utc>) {
        let snapshot = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = state.entry(title_key.to_string()).or_insert(not_before);
            if *entry < not_before {
                *entry = not_before;
            }
            state.clone()
        };
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(err) = atomic_write_bytes(&self.path, &bytes) {
                    warn!(path = %self.path.display(), error = %err, "cooldown persist failed");
                }
            }
            Err(err) => warn!(error = %err, "cooldown serialize failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn fresh_store_is_not_cooling() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CooldownStore::open(dir.path().join("cooldowns.json"));
        assert!(!store.is_cooling("key", now()));
    }

    #[test]
    fn recorded_cooldown_gates_until_deadline() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CooldownStore::open(dir.path().join("cooldowns.json"));
        store.record("key", now() + TimeDelta::hours(1));
        assert!(store.is_cooling("key", now()));
        assert!(!store.is_cooling("key", now() + TimeDelta::hours(2)));
        assert!(!store.is_cooling("other", now()));
    }

    #[test]
    fn cooldowns_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cooldowns.json");
        CooldownStore::open(path.clone()).record("key", now() + TimeDelta::hours(1));
        let reopened = CooldownStore::open(path);
        assert!(reopened.is_cooling("key", now()));
    }

    #[test]
    fn writes_are_monotonic() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CooldownStore::open(dir.path().join("cooldowns.json"));
        store.record("key", now() + TimeDelta::hours(2));
        store.record("key", now() + TimeDelta::hours(1));
        assert!(store.is_cooling("key", now() + TimeDelta::minutes(90)));
    }

    #[test]
    fn corrupt_file_is_tolerated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cooldowns.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = CooldownStore::open(path);
        assert!(!store.is_cooling("key", now()));
    }
}
