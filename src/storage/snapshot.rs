//! JSON snapshot store
//!
//! # Example
//!
//! ```no_run
//! use ticketwatch::storage::{EngineSnapshot, SnapshotStore};
//!
//! # fn example() -> Result<(), ticketwatch::utils::error::StorageError> {
//! let store = SnapshotStore::new("data/ticketwatch-snapshot.json");
//! store.save(&EngineSnapshot::new(Vec::new(), Vec::new()))?;
//!
//! if let Some(snapshot) = store.load()? {
//!     println!("{} identities saved at {}", snapshot.identities.len(), snapshot.saved_at);
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::identity::Identity;
use crate::utils::error::StorageError;
use crate::watchlist::WatchItem;

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted engine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub watch_items: Vec<WatchItem>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl EngineSnapshot {
    /// Snapshot taken now
    pub fn new(identities: Vec<Identity>, watch_items: Vec<WatchItem>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            identities,
            watch_items,
        }
    }
}

/// Reads and writes the snapshot file
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Write the snapshot atomically
    pub fn save(&self, snapshot: &EngineSnapshot) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| Self::io_error(dir, e))?;
        }

        // Write to temp file first, then rename
        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let file = File::create(&temp_path).map_err(|e| Self::io_error(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot)?;
        writer
            .flush()
            .map_err(|e| Self::io_error(&temp_path, e))?;
        drop(writer);

        fs::rename(&temp_path, &self.path).map_err(|e| Self::io_error(&self.path, e))?;

        tracing::debug!(
            path = %self.path.display(),
            identities = snapshot.identities.len(),
            watch_items = snapshot.watch_items.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Read the snapshot; `None` when no snapshot was written yet
    pub fn load(&self) -> Result<Option<EngineSnapshot>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = File::open(&self.path).map_err(|e| Self::io_error(&self.path, e))?;
        let snapshot: EngineSnapshot = serde_json::from_reader(BufReader::new(file))?;

        tracing::info!(
            path = %self.path.display(),
            saved_at = %snapshot.saved_at,
            "Snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    /// Remove the snapshot file
    pub fn clear(&self) -> Result<bool, StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&self.path, e)),
        }
    }
}
