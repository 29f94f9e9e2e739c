//! JSON file-backed persistence for WatchDog hub state.
//!
//! Provides [`SnapshotStore`], a per-table store that keeps data in memory
//! and snapshots to a JSON file on every write. The bundled repositories in
//! `wd-store` use one snapshot file per table.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A JSON file-backed store for a single table of hub data.
///
/// Snapshots to `{state_dir}/store/{table}.json`. Corrupt or missing files
/// load as empty so a damaged snapshot never prevents startup.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Create a store for the given table under `state_dir`.
    pub fn new(state_dir: &Path, table: &str) -> Self {
        let path = state_dir.join("store").join(format!("{table}.json"));
        Self { path }
    }

    /// Load a keyed table from disk. Returns an empty map if the file does
    /// not exist or cannot be parsed.
    pub fn load_map<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt snapshot, starting empty");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no snapshot, starting empty");
                HashMap::new()
            }
        }
    }

    /// Load an append-only table from disk, empty on missing/corrupt.
    pub fn load_list<T: for<'de> Deserialize<'de>>(&self) -> Vec<T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt snapshot, starting empty");
                Vec::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no snapshot, starting empty");
                Vec::new()
            }
        }
    }

    /// Save a keyed table to disk, creating directories as needed.
    pub fn save_map<T: Serialize>(&self, data: &HashMap<String, T>) -> std::io::Result<()> {
        self.write(serde_json::to_string_pretty(data).map_err(std::io::Error::other)?)
    }

    /// Save an append-only table to disk, creating directories as needed.
    pub fn save_list<T: Serialize>(&self, data: &[T]) -> std::io::Result<()> {
        self.write(serde_json::to_string_pretty(data).map_err(std::io::Error::other)?)
    }

    fn write(&self, content: String) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)
    }
}
