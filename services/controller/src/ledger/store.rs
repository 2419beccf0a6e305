//! Durable ledger records.
//!
//! Each unexecuted ledger owns one JSON file in the data directory, named
//! `termination-ledger@<ledger-id>.json` so startup recovery can find every
//! record with a directory scan. Writes go to a temp file that is synced and
//! renamed over the record, so a crash leaves either the old or the new
//! content, never a torn file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cloudfleet_id::LedgerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::plan::Disposal;

/// Record file format version.
const RECORD_VERSION: u32 = 1;

pub const RECORD_PREFIX: &str = "termination-ledger@";
pub const RECORD_EXTENSION: &str = "json";

/// Errors from ledger record operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger record I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger record {path} is not valid JSON: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger record {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

impl LedgerError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Node ids one cloud still has to suspend or destroy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudTermination {
    #[serde(default)]
    pub suspend: BTreeSet<String>,
    #[serde(default)]
    pub destroy: BTreeSet<String>,
}

/// Pending suspend/destroy work, keyed by cloud name.
///
/// A node id is in at most one of its cloud's two sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingTermination {
    clouds: BTreeMap<String, CloudTermination>,
}

impl PendingTermination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an intent. A node already present under the other disposal is
    /// moved. Returns false if the intent was already recorded.
    pub fn insert(&mut self, cloud: &str, node_id: &str, disposal: Disposal) -> bool {
        let entry = self.clouds.entry(cloud.to_string()).or_default();
        let (target, other) = match disposal {
            Disposal::Suspend => (&mut entry.suspend, &mut entry.destroy),
            Disposal::Destroy => (&mut entry.destroy, &mut entry.suspend),
        };
        let moved = other.remove(node_id);
        target.insert(node_id.to_string()) || moved
    }

    pub fn disposal_of(&self, cloud: &str, node_id: &str) -> Option<Disposal> {
        let entry = self.clouds.get(cloud)?;
        if entry.suspend.contains(node_id) {
            Some(Disposal::Suspend)
        } else if entry.destroy.contains(node_id) {
            Some(Disposal::Destroy)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.clouds
            .values()
            .map(|c| c.suspend.len() + c.destroy.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All intents as `(cloud, node_id, disposal)`, suspends first.
    pub fn intents(&self) -> Vec<(String, String, Disposal)> {
        let mut out = Vec::with_capacity(self.len());
        for (cloud, entry) in &self.clouds {
            out.extend(
                entry
                    .suspend
                    .iter()
                    .map(|id| (cloud.clone(), id.clone(), Disposal::Suspend)),
            );
        }
        for (cloud, entry) in &self.clouds {
            out.extend(
                entry
                    .destroy
                    .iter()
                    .map(|id| (cloud.clone(), id.clone(), Disposal::Destroy)),
            );
        }
        out
    }

    pub fn cloud(&self, cloud: &str) -> Option<&CloudTermination> {
        self.clouds.get(cloud)
    }
}

/// On-disk form of one ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedLedger {
    pub version: u32,
    pub ledger_id: LedgerId,
    pub clouds: PendingTermination,
}

/// Directory holding ledger records.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    root: PathBuf,
}

impl LedgerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, id: &LedgerId) -> PathBuf {
        self.root
            .join(format!("{RECORD_PREFIX}{id}.{RECORD_EXTENSION}"))
    }

    /// Does `path` name a ledger record?
    pub fn is_record(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name.starts_with(RECORD_PREFIX)
            && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
    }

    /// Durably write `pending` to `path`, replacing any previous content.
    pub fn save(
        &self,
        path: &Path,
        id: &LedgerId,
        pending: &PendingTermination,
    ) -> Result<(), LedgerError> {
        fs::create_dir_all(&self.root).map_err(|e| LedgerError::io(&self.root, e))?;

        let record = PersistedLedger {
            version: RECORD_VERSION,
            ledger_id: *id,
            clouds: pending.clone(),
        };
        let content = serde_json::to_vec_pretty(&record).map_err(|e| LedgerError::Serde {
            path: path.to_path_buf(),
            source: e,
        })?;

        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).map_err(|e| LedgerError::io(&tmp_path, e))?;
        file.write_all(&content)
            .and_then(|()| file.sync_all())
            .map_err(|e| LedgerError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(|e| LedgerError::io(path, e))?;

        debug!(
            path = %path.display(),
            ledger_id = %id,
            intents = pending.len(),
            "Persisted termination ledger"
        );
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<PersistedLedger, LedgerError> {
        let content = fs::read(path).map_err(|e| LedgerError::io(path, e))?;
        let record: PersistedLedger =
            serde_json::from_slice(&content).map_err(|e| LedgerError::Serde {
                path: path.to_path_buf(),
                source: e,
            })?;

        if record.version != RECORD_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: record.version,
            });
        }
        Ok(record)
    }

    /// Delete a record. A record that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), LedgerError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LedgerError::io(path, e)),
        }
    }

    /// Every ledger record in the directory, oldest ledger id first.
    pub fn list_records(&self) -> Result<Vec<PathBuf>, LedgerError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LedgerError::io(&self.root, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::io(&self.root, e))?;
            let path = entry.path();
            if Self::is_record(&path) {
                records.push(path);
            }
        }
        records.sort();
        Ok(records)
    }
}
