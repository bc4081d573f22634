use std::{collections::BTreeMap, io, path::PathBuf};

use remsync_device::RemoteObject;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialize metadata store: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write metadata store: {0}")]
    Io(#[from] io::Error),
}

/// Last-known state of one previously-synced remote file. Records are
/// created after a successful download and never deleted; entries for
/// files removed from the device go stale harmlessly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub mod_time: i64,
    pub size: u64,
    pub hash: String,
    pub last_sync: String,
}

/// Durable path → [`SyncRecord`] mapping backing incremental sync. The
/// whole mapping is serialized in one atomic snapshot at the end of a run,
/// so a crash mid-run loses that run's progress but never prior history.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    records: BTreeMap<String, SyncRecord>,
}

impl MetadataStore {
    /// Loads the snapshot at `path`. A missing or malformed file resets to
    /// an empty mapping; that is a warning, never a fatal error.
    pub fn load(path: PathBuf) -> Self {
        let records = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(err) => {
                    eprintln!(
                        "[remsync] warning: metadata store {} is malformed ({err}); starting empty",
                        path.display()
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                eprintln!(
                    "[remsync] warning: cannot read metadata store {} ({err}); starting empty",
                    path.display()
                );
                BTreeMap::new()
            }
        };
        Self { path, records }
    }

    pub fn get(&self, remote_path: &str) -> Option<&SyncRecord> {
        self.records.get(remote_path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Upserts the record for a freshly downloaded object. Idempotent.
    pub fn record(&mut self, object: &RemoteObject, hash: String) {
        let last_sync = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        self.records.insert(
            object.path.clone(),
            SyncRecord {
                mod_time: object.mod_time,
                size: object.size,
                hash,
                last_sync,
            },
        );
    }

    /// Writes the whole mapping as one snapshot: serialize to a sibling
    /// temp file, then rename into place. An interrupt mid-write can never
    /// leave a torn snapshot visible at the store path.
    pub fn persist(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&self.records)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
