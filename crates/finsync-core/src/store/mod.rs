//! Local store facade: typed access to the on-device dataset files.
//!
//! Each dataset lives in its own JSON file under a data directory, alongside a
//! `last_update` marker recording the wall-clock time of the most recent local
//! mutation. The marker is the left-hand side of the sync engine's conflict
//! comparison.

mod synced;

pub use synced::SyncedStore;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::models::{DatasetKey, Snapshot};

/// Marker file name in the data directory.
const MARKER_FILE: &str = "last_update";

/// Key/value abstraction over on-device storage, one slot per dataset.
pub trait LocalStore: Send + Sync {
    fn dataset(&self, key: DatasetKey) -> Result<Option<Value>>;

    /// Replace the dataset wholesale. Payloads are opaque; no merging.
    fn put_dataset(&self, key: DatasetKey, value: Value) -> Result<()>;

    /// Wall-clock time of the most recent local mutation, if any write has
    /// ever happened on this device.
    fn marker(&self) -> Result<Option<DateTime<Utc>>>;

    fn set_marker(&self, at: DateTime<Utc>) -> Result<()>;

    /// Read every dataset currently present into a snapshot.
    fn snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for key in DatasetKey::ALL {
            if let Some(value) = self.dataset(key)? {
                snapshot.insert(key, value);
            }
        }
        Ok(snapshot)
    }
}

/// File-backed local store: one pretty-printed JSON file per dataset.
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    fn dataset_path(&self, key: DatasetKey) -> PathBuf {
        self.data_dir.join(format!("{}.json", key.as_str()))
    }

    fn marker_path(&self) -> PathBuf {
        self.data_dir.join(MARKER_FILE)
    }
}

impl LocalStore for JsonFileStore {
    fn dataset(&self, key: DatasetKey) -> Result<Option<Value>> {
        let path = self.dataset_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read dataset file: {}", key))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse dataset file: {}", key))?;
        Ok(Some(value))
    }

    fn put_dataset(&self, key: DatasetKey, value: Value) -> Result<()> {
        let contents = serde_json::to_string_pretty(&value)?;
        std::fs::write(self.dataset_path(key), contents)
            .with_context(|| format!("Failed to write dataset file: {}", key))?;
        Ok(())
    }

    fn marker(&self) -> Result<Option<DateTime<Utc>>> {
        let path = self.marker_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(&path).context("Failed to read local update marker")?;
        match DateTime::parse_from_rfc3339(contents.trim()) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                // An unparseable marker reads as "never set".
                warn!(error = %e, "Ignoring unparseable local update marker");
                Ok(None)
            }
        }
    }

    fn set_marker(&self, at: DateTime<Utc>) -> Result<()> {
        std::fs::write(self.marker_path(), at.to_rfc3339())
            .context("Failed to write local update marker")?;
        Ok(())
    }
}
