//! Persistence for sync state.
//!
//! Stores the last-synced snapshot to disk so remote deletions can be told
//! apart from local-only files after a restart. State is stored in
//! `.olsync/state.json` within the sync root. This is not a transaction log;
//! the index is rebuilt from the remote on every connect.

use anyhow::Result;
use chrono::{DateTime, Utc};
use olsync_core::BaseContent;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Directory holding daemon state inside the sync root.
pub const STATE_DIR: &str = ".olsync";

/// Persisted sync state.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistedState {
    /// Project this state belongs to
    pub project_id: String,
    /// Completion time of the last successful pull
    pub last_synced: Option<DateTime<Utc>>,
    /// Content digests of every path known to be in sync
    #[serde(default)]
    pub base_content: BaseContent,
}

/// Storage for the persisted state.
pub struct StateStorage {
    /// Path to the storage file.
    path: PathBuf,
    /// What the file holds, as far as this process wrote it.
    last_saved: Mutex<Option<PersistedState>>,
}

impl StateStorage {
    /// Create storage at the specified sync root.
    ///
    /// Uses `.olsync/state.json` within the directory.
    pub fn new(sync_root: &Path) -> Self {
        Self {
            path: sync_root.join(STATE_DIR).join("state.json"),
            last_saved: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state from disk, or `None` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)?;
        let state: PersistedState = serde_json::from_str(&contents)?;
        Ok(Some(state))
    }

    /// Load state saved for `project_id`.
    ///
    /// State from another project, or a file that fails to parse, is
    /// discarded with a warning.
    pub fn load_for(&self, project_id: &str) -> Option<PersistedState> {
        match self.load() {
            Ok(Some(state)) if state.project_id == project_id => Some(state),
            Ok(Some(state)) => {
                warn!(
                    "Ignoring saved state for project {} (syncing {})",
                    state.project_id, project_id
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to load sync state from {:?}: {}", self.path, e);
                None
            }
        }
    }

    /// Save state to disk.
    ///
    /// Writes a temporary file first and renames it into place.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved sync state ({} tracked paths)", state.base_content.len());
        *self.last_saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }

    /// Save `state` unless it equals what was last written.
    ///
    /// Returns whether the file was written.
    pub fn save_if_changed(&self, state: &PersistedState) -> Result<bool> {
        let unchanged = self
            .last_saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            == Some(state);
        if unchanged {
            return Ok(false);
        }
        self.save(state)?;
        Ok(true)
    }
}
