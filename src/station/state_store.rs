//! Persisted DJ state.
//!
//! One JSON blob behind a versioned envelope, written atomically (temp
//! file + rename). Unknown fields are preserved across a load/save round
//! trip so newer writers can read state written by older ones and vice
//! versa.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{AppError, Result};

pub const STATE_VERSION: u64 = 1;

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Load the raw state object, or `None` on a cold start. The envelope
    /// is returned whole so callers can pick their fields and unknown
    /// ones survive.
    pub fn load(&self) -> Option<Value> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to read state: {e}");
                return None;
            }
        };

        match serde_json::from_slice::<Value>(&data) {
            Ok(value) if value.is_object() => {
                let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
                tracing::info!(version, path = %self.path.display(), "DJ state loaded");
                Some(value)
            }
            Ok(_) => {
                tracing::warn!("state file is not a JSON object, ignoring");
                None
            }
            Err(e) => {
                tracing::warn!("state file is corrupt, ignoring: {e}");
                None
            }
        }
    }

    /// Persist atomically: write a temp file next to the target, then
    /// rename over it.
    pub fn save(&self, mut state: Value) -> Result<()> {
        let obj = state
            .as_object_mut()
            .ok_or_else(|| AppError::Validation("state must be a JSON object".into()))?;
        obj.insert("version".into(), Value::from(STATE_VERSION));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&state).map_err(anyhow::Error::from)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "DJ state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("state.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("state.json"));
        store.save(json!({"last_legal_id": 12.5})).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded["last_legal_id"], 12.5);
        assert_eq!(loaded["version"], STATE_VERSION);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("state.json"));
        store
            .save(json!({"future_field": {"nested": [1, 2, 3]}}))
            .unwrap();

        let mut loaded = store.load().unwrap();
        loaded["last_legal_id"] = json!(1.0);
        store.save(loaded).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded["future_field"]["nested"], json!([1, 2, 3]));
        assert_eq!(reloaded["last_legal_id"], 1.0);
    }

    #[test]
    fn corrupt_state_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(StateStore::new(&path).load().is_none());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("state.json"));
        store.save(json!({})).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
