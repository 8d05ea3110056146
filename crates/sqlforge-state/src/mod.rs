//! State Store (C5, spec §4.5): durable per-environment record of model
//! fingerprints and last execution outcomes. A consumer-of-truth only — it
//! never originates a model (spec §4.5).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlforge_common::errors::{EngineError, EngineResult};
use sqlforge_common::ModelStatus;

/// Per-model, per-environment record (spec §3 StateEntry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub model_name: String,
    pub fingerprint: String,
    pub status: ModelStatus,
    /// The fingerprint as of the last *successful* run, distinct from
    /// `fingerprint` when the most recent attempt failed (spec §3).
    pub last_successful_fingerprint: Option<String>,
    pub last_run_ts: DateTime<Utc>,
    /// High-watermark for incremental kinds: a timestamp or surrogate key,
    /// stored as its canonical string form (spec §3, §4.8).
    pub high_watermark: Option<String>,
}

/// The self-describing on-disk shape for one environment's snapshot (spec
/// §6 State layout). `#[serde(default)]` on every field keeps old
/// snapshots loadable as new optional fields are added; unknown keys are
/// ignored by serde's default behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    entries: BTreeMap<String, StateEntry>,
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    snapshot: Snapshot,
}

const CURRENT_SCHEMA_VERSION: u32 = 1;

impl StateStore {
    /// Open (but do not yet read) a store backed by `path` — one snapshot
    /// file per environment (spec §6).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: Snapshot {
                schema_version: CURRENT_SCHEMA_VERSION,
                entries: BTreeMap::new(),
            },
        }
    }

    /// Load the snapshot from disk. Spec §4.5: "On first run in an
    /// environment, the store is empty" — a missing file is not an error.
    pub fn load(&mut self) -> EngineResult<()> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                self.snapshot = serde_json::from_str(&text).map_err(|e| {
                    EngineError::ConfigurationError(format!(
                        "corrupt state snapshot at {}: {e}",
                        self.path.display()
                    ))
                })?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::ConfigurationError(format!(
                "could not read state snapshot at {}: {e}",
                self.path.display()
            ))),
        }
    }

    pub fn get(&self, model_name: &str) -> Option<&StateEntry> {
        self.snapshot.entries.get(model_name)
    }

    pub fn all(&self) -> impl Iterator<Item = &StateEntry> {
        self.snapshot.entries.values()
    }

    /// Upsert an entry in memory; does not touch disk until [`flush`](Self::flush).
    pub fn put(&mut self, entry: StateEntry) {
        self.snapshot.entries.insert(entry.model_name.clone(), entry);
    }

    pub fn remove(&mut self, model_name: &str) {
        self.snapshot.entries.remove(model_name);
    }

    /// Atomically replace the on-disk snapshot: write to a temp file in the
    /// same directory, then rename over the target (spec §4.5: "a crash
    /// mid-flush leaves the previous snapshot intact").
    pub fn flush(&self) -> EngineResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| {
            EngineError::ConfigurationError(format!(
                "could not create state directory {}: {e}",
                parent.display()
            ))
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            EngineError::ConfigurationError(format!("could not create temp state file: {e}"))
        })?;
        serde_json::to_writer_pretty(&mut tmp, &self.snapshot).map_err(|e| {
            EngineError::ConfigurationError(format!("could not serialise state snapshot: {e}"))
        })?;
        tmp.persist(&self.path).map_err(|e| {
            EngineError::ConfigurationError(format!(
                "could not atomically replace state snapshot at {}: {e}",
                self.path.display()
            ))
        })?;
        tracing::debug!(path = %self.path.display(), entries = self.snapshot.entries.len(), "flushed state snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, fingerprint: &str, status: ModelStatus) -> StateEntry {
        StateEntry {
            model_name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            status,
            last_successful_fingerprint: Some(fingerprint.to_string()),
            last_run_ts: Utc::now(),
            high_watermark: None,
        }
    }

    #[test]
    fn missing_file_loads_as_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path().join("state.json"));
        store.load().unwrap();
        assert!(store.get("a").is_none());
    }

    #[test]
    fn put_then_flush_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = StateStore::new(&path);
        store.put(entry("silver.a", "fp1", ModelStatus::Success));
        store.flush().unwrap();

        let mut reloaded = StateStore::new(&path);
        reloaded.load().unwrap();
        let got = reloaded.get("silver.a").unwrap();
        assert_eq!(got.fingerprint, "fp1");
        assert_eq!(got.status, ModelStatus::Success);
    }

    #[test]
    fn flush_survives_interleaved_writes_without_corrupting_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = StateStore::new(&path);
        store.put(entry("silver.a", "fp1", ModelStatus::Success));
        store.flush().unwrap();

        let mut second = StateStore::new(&path);
        second.load().unwrap();
        second.put(entry("silver.b", "fp2", ModelStatus::Failed));
        second.flush().unwrap();

        let mut reloaded = StateStore::new(&path);
        reloaded.load().unwrap();
        assert!(reloaded.get("silver.a").is_some());
        assert!(reloaded.get("silver.b").is_some());
    }

    #[test]
    fn unknown_fields_in_an_older_or_newer_snapshot_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"schema_version":1,"entries":{"silver.a":{"model_name":"silver.a","fingerprint":"fp1","status":"SUCCESS","last_successful_fingerprint":"fp1","last_run_ts":"2024-01-01T00:00:00Z","high_watermark":null,"from_the_future":true}}}"#,
        )
        .unwrap();
        let mut store = StateStore::new(&path);
        store.load().unwrap();
        assert_eq!(store.get("silver.a").unwrap().fingerprint, "fp1");
    }
}
