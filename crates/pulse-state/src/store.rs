use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use pulse_core::{Clock, PulseError, TriggerHistoryEntry};

use crate::STATE_VERSION;

/// Key/value persistence backed by a single `state.json` document.
///
/// Writes are atomic: the new document is written to a sibling tempfile in
/// the same directory, fsynced, then renamed over the target. Readers always
/// see either the old or the new complete file — killing the process
/// mid-save leaves the previous snapshot intact.
pub struct StateStore {
    state_path: PathBuf,
    data: Mutex<Map<String, Value>>,
    last_save: Mutex<f64>,
    save_interval_secs: f64,
    history_max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    /// Open the store rooted at `dir`, creating the directory if needed and
    /// loading any existing snapshot. An unreadable or corrupt state file is
    /// an error — the daemon refuses to start rather than silently dropping
    /// persisted drives.
    pub fn open(
        dir: &Path,
        save_interval_secs: u64,
        history_max_entries: usize,
        clock: Arc<dyn Clock>,
    ) -> pulse_core::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let state_path = dir.join("state.json");

        let data = if state_path.exists() {
            let raw = std::fs::read_to_string(&state_path).map_err(|e| {
                PulseError::State(format!("cannot read {}: {}", state_path.display(), e))
            })?;
            let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
                PulseError::State(format!(
                    "corrupt state file {}: {}",
                    state_path.display(),
                    e
                ))
            })?;
            match parsed {
                Value::Object(map) => {
                    info!(path = %state_path.display(), keys = map.len(), "loaded persisted state");
                    map
                }
                _ => {
                    return Err(PulseError::State(format!(
                        "state file {} is not a JSON object",
                        state_path.display()
                    )));
                }
            }
        } else {
            debug!(path = %state_path.display(), "no persisted state, starting fresh");
            Map::new()
        };

        let now = clock.now();
        Ok(Self {
            state_path,
            data: Mutex::new(data),
            last_save: Mutex::new(now),
            save_interval_secs: save_interval_secs as f64,
            history_max_entries,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock();
        data.get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.data.lock().insert(key.to_string(), v);
            }
            Err(e) => warn!(key, error = %e, "failed to serialize state value"),
        }
    }

    /// Persist the current snapshot. Atomic: tempfile + fsync + rename.
    pub fn save(&self) -> pulse_core::Result<()> {
        let doc = {
            let mut data = self.data.lock();
            data.insert("version".into(), Value::from(STATE_VERSION));
            data.insert("saved_at".into(), Value::from(self.clock.now()));
            Value::Object(data.clone())
        };

        let dir = self
            .state_path
            .parent()
            .ok_or_else(|| PulseError::State("state path has no parent directory".into()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, &doc)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.state_path)
            .map_err(|e| PulseError::State(format!("atomic rename failed: {}", e.error)))?;

        *self.last_save.lock() = self.clock.now();
        debug!(path = %self.state_path.display(), "state saved");
        Ok(())
    }

    /// Save only when the save interval has elapsed. Returns whether a save
    /// happened.
    pub fn maybe_save(&self) -> pulse_core::Result<bool> {
        let due = {
            let last = self.last_save.lock();
            self.clock.now() - *last >= self.save_interval_secs
        };
        if due {
            self.save()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ── Trigger history ────────────────────────────────────────

    /// Append a trigger record and update `last_trigger`. History is capped;
    /// the oldest entries fall off.
    pub fn log_trigger(&self, entry: TriggerHistoryEntry) {
        let mut history: Vec<TriggerHistoryEntry> =
            self.get("trigger_history").unwrap_or_default();
        history.push(entry.clone());
        if history.len() > self.history_max_entries {
            let excess = history.len() - self.history_max_entries;
            history.drain(..excess);
        }
        self.set("trigger_history", &history);
        self.set("last_trigger", &entry);
    }

    pub fn trigger_history(&self) -> Vec<TriggerHistoryEntry> {
        self.get("trigger_history").unwrap_or_default()
    }

    pub fn last_trigger(&self) -> Option<TriggerHistoryEntry> {
        self.get("last_trigger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::ManualClock;

    fn store_in(dir: &Path, clock: Arc<dyn Clock>) -> StateStore {
        StateStore::open(dir, 60, 5, clock).unwrap()
    }

    #[test]
    fn fresh_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Arc::new(ManualClock::new(0.0)));
        assert!(store.get::<Value>("drives").is_none());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1000.0));
        let store = store_in(dir.path(), clock.clone());
        store.set("answer", serde_json::json!({"value": 42}));
        store.save().unwrap();

        let store2 = store_in(dir.path(), clock);
        let got: Value = store2.get("answer").unwrap();
        assert_eq!(got["value"], 42);
    }

    #[test]
    fn save_writes_version_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Arc::new(ManualClock::new(1234.0)));
        store.save().unwrap();
        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["version"], STATE_VERSION);
        assert_eq!(doc["saved_at"], 1234.0);
    }

    #[test]
    fn corrupt_state_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), "{not json!!").unwrap();
        let result = StateStore::open(dir.path(), 60, 5, Arc::new(ManualClock::new(0.0)));
        assert!(result.is_err());
    }

    #[test]
    fn maybe_save_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0.0));
        let store = store_in(dir.path(), clock.clone());
        assert!(!store.maybe_save().unwrap());
        clock.advance(61.0);
        assert!(store.maybe_save().unwrap());
        assert!(!store.maybe_save().unwrap());
    }

    #[test]
    fn trigger_history_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Arc::new(ManualClock::new(0.0)));
        for i in 0..8 {
            store.log_trigger(TriggerHistoryEntry {
                timestamp: i as f64,
                reason: format!("t{i}"),
                top_drive: None,
                total_pressure: 0.0,
                webhook_status: "202".into(),
                dispatched_turn_id: None,
            });
        }
        let history = store.trigger_history();
        assert_eq!(history.len(), 5);
        assert_eq!(history.first().unwrap().reason, "t3");
        assert_eq!(store.last_trigger().unwrap().reason, "t7");
    }

    #[test]
    fn interrupted_save_leaves_previous_snapshot() {
        // Simulate a crash mid-write: a stray tempfile next to a valid
        // state.json must not affect what a fresh open() sees.
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0.0));
        let store = store_in(dir.path(), clock.clone());
        store.set("k", "v1");
        store.save().unwrap();
        std::fs::write(dir.path().join(".tmpXYZ"), "{\"k\": \"half-writ").unwrap();

        let store2 = store_in(dir.path(), clock);
        assert_eq!(store2.get::<String>("k").unwrap(), "v1");
    }
}
