//! Retry Store (C5): persisted per-stage retry counters (§4.5).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryStoreError {
    #[error("failed to lock retry store at {0}")]
    Lock(PathBuf),
    #[error("io error accessing retry store: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse retry store: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt_count: u32,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RetryRecord {
    fn default() -> Self {
        Self {
            attempt_count: 0,
            last_error_kind: None,
            last_error_message: None,
            updated_at: Utc::now(),
        }
    }
}

fn key(feature: &str, stage: &str) -> String {
    format!("{feature}::{stage}")
}

/// File-backed retry store. Every operation takes an exclusive
/// advisory lock on the underlying file for the duration of the
/// read-modify-write, so concurrent `autospec` processes sharing the
/// same store (e.g. DAG-scheduled features) serialize their updates.
#[derive(Debug, Clone)]
pub struct RetryStore {
    path: PathBuf,
}

impl RetryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn with_locked_file<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, RetryRecord>) -> T,
    ) -> Result<T, RetryStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()
            .map_err(|_| RetryStoreError::Lock(self.path.clone()))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut records: HashMap<String, RetryRecord> = if contents.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&contents)?
        };

        let result = f(&mut records);

        let serialized = serde_json::to_string_pretty(&records)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        fs2::FileExt::unlock(&file)?;
        Ok(result)
    }

    pub fn load(&self, feature: &str, stage: &str) -> Result<RetryRecord, RetryStoreError> {
        self.with_locked_file(|records| {
            records.get(&key(feature, stage)).cloned().unwrap_or_default()
        })
    }

    pub fn increment(
        &self,
        feature: &str,
        stage: &str,
        error_kind: &str,
        message: &str,
    ) -> Result<RetryRecord, RetryStoreError> {
        self.with_locked_file(|records| {
            let record = records.entry(key(feature, stage)).or_default();
            record.attempt_count += 1;
            record.last_error_kind = Some(error_kind.to_string());
            record.last_error_message = Some(message.to_string());
            record.updated_at = Utc::now();
            record.clone()
        })
    }

    pub fn reset(&self, feature: &str, stage: &str) -> Result<(), RetryStoreError> {
        self.with_locked_file(|records| {
            records.remove(&key(feature, stage));
        })
    }

    pub fn list_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<(String, RetryRecord)>, RetryStoreError> {
        self.with_locked_file(|records| {
            records
                .iter()
                .filter(|(_, r)| r.updated_at < older_than)
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect()
        })
    }
}

/// Default retry-store location under the user's state directory.
pub fn default_retry_store_path(state_dir: &Path) -> PathBuf {
    state_dir.join("retry.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_of_unknown_key_returns_zero_value() {
        let dir = tempdir().unwrap();
        let store = RetryStore::new(dir.path().join("retry.json"));
        let record = store.load("007-x", "plan").unwrap();
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn increment_is_monotonic_until_reset() {
        let dir = tempdir().unwrap();
        let store = RetryStore::new(dir.path().join("retry.json"));
        store.increment("007-x", "plan", "AgentFailed", "boom").unwrap();
        let record = store.increment("007-x", "plan", "AgentFailed", "boom again").unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.last_error_message.as_deref(), Some("boom again"));

        store.reset("007-x", "plan").unwrap();
        let record = store.load("007-x", "plan").unwrap();
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn distinct_stages_are_tracked_independently() {
        let dir = tempdir().unwrap();
        let store = RetryStore::new(dir.path().join("retry.json"));
        store.increment("007-x", "plan", "AgentFailed", "e").unwrap();
        let tasks_record = store.load("007-x", "tasks").unwrap();
        assert_eq!(tasks_record.attempt_count, 0);
    }
}
