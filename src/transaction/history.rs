// src/transaction/history.rs

//! Bounded undo history of past provisioning states
//!
//! Layout under the history directory:
//!
//! ```text
//! history/
//!   index.toml              ordered entries, oldest first
//!   <uuid>/provisioning.toml
//!   <uuid>/replay.json      user changes replayed by the apply that left this state
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProvisioningConfig;
use crate::error::{Error, Result};
use crate::filesystem::{ReplayReport, remove_entry};

use super::{PROVISIONING_FILE, write_atomic};

const INDEX_FILE: &str = "index.toml";
const REPLAY_FILE: &str = "replay.json";

/// Default number of past states kept
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// One recorded past state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryIndex {
    #[serde(default, rename = "entry")]
    entries: Vec<HistoryEntry>,
}

/// Undo history stored in one directory
#[derive(Debug)]
pub struct StateHistory {
    dir: PathBuf,
    limit: usize,
}

impl StateHistory {
    pub fn open(dir: &Path, limit: usize) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            limit,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Entries, oldest first
    pub fn entries(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.load_index()?.entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load_index()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Record a past state; evicts the oldest entries above the limit
    pub fn push(
        &self,
        config: &ProvisioningConfig,
        replay: &ReplayReport,
        description: &str,
    ) -> Result<HistoryEntry> {
        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            description: description.to_string(),
        };
        let entry_dir = self.dir.join(&entry.id);
        fs::create_dir_all(&entry_dir).map_err(|e| Error::io(&entry_dir, e))?;
        config.save(&entry_dir.join(PROVISIONING_FILE))?;
        write_atomic(
            &entry_dir.join(REPLAY_FILE),
            serde_json::to_string_pretty(replay)?.as_bytes(),
        )?;

        let mut index = self.load_index()?;
        index.entries.push(entry.clone());
        self.evict(&mut index);
        self.save_index(&index)?;
        debug!("Recorded state {} ({} in history)", entry.id, index.entries.len());
        Ok(entry)
    }

    /// Change the limit; excess entries are evicted right away
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        self.limit = limit;
        let mut index = self.load_index()?;
        if index.entries.len() > limit {
            self.evict(&mut index);
            self.save_index(&index)?;
        }
        Ok(())
    }

    /// Newest entry whose state can be loaded
    ///
    /// Unusable entries are logged, dropped from the index and skipped.
    pub fn latest(&self) -> Result<Option<(HistoryEntry, ProvisioningConfig)>> {
        let mut index = self.load_index()?;
        let mut dropped = false;
        let mut found = None;
        while let Some(entry) = index.entries.last().cloned() {
            match self.load_state(&entry) {
                Ok(config) => {
                    found = Some((entry, config));
                    break;
                }
                Err(e) => {
                    warn!("{}", e);
                    index.entries.pop();
                    self.remove_dir(&entry.id);
                    dropped = true;
                }
            }
        }
        if dropped {
            self.save_index(&index)?;
        }
        Ok(found)
    }

    /// Replay decisions recorded with an entry
    pub fn replay_report(&self, id: &str) -> Result<ReplayReport> {
        let path = self.dir.join(id).join(REPLAY_FILE);
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut index = self.load_index()?;
        let before = index.entries.len();
        index.entries.retain(|e| e.id != id);
        if index.entries.len() == before {
            return Err(Error::NotFound(format!("history entry {}", id)));
        }
        self.save_index(&index)?;
        self.remove_dir(id);
        Ok(())
    }

    fn load_state(&self, entry: &HistoryEntry) -> Result<ProvisioningConfig> {
        let path = self.dir.join(&entry.id).join(PROVISIONING_FILE);
        ProvisioningConfig::load(&path).map_err(|e| Error::HistoryCorrupted {
            id: entry.id.clone(),
            reason: e.to_string(),
        })
    }

    fn evict(&self, index: &mut HistoryIndex) {
        while index.entries.len() > self.limit {
            let oldest = index.entries.remove(0);
            debug!("Evicting state {}", oldest.id);
            self.remove_dir(&oldest.id);
        }
    }

    fn remove_dir(&self, id: &str) {
        if let Err(e) = remove_entry(&self.dir.join(id)) {
            warn!("Failed to remove history entry {}: {}", id, e);
        }
    }

    fn load_index(&self) -> Result<HistoryIndex> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(HistoryIndex::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Ok(toml::from_str(&content)?)
    }

    fn save_index(&self, index: &HistoryIndex) -> Result<()> {
        write_atomic(
            &self.dir.join(INDEX_FILE),
            toml::to_string_pretty(index)?.as_bytes(),
        )
    }
}
