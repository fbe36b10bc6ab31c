//! Durable `(current_term, voted_for)` per quorum.
//!
//! A replicator writes through this before it acts on a new term or casts a
//! vote; a failed write is fatal to the instance. `voted_for == 0` means no vote.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{ReplicatorError, Result};
use crate::log::files::validate_quorum_id;
use crate::settings::{REPLICATOR_PERSISTER_DIRECTORY_NAME, REPLICATOR_PERSISTER_FILE_NAME};

pub trait ReplicatorInfoPersistence: Send + Sync + 'static {
    fn read_current_term(&self, quorum_id: &str) -> Result<u64>;

    fn read_voted_for(&self, quorum_id: &str) -> Result<u64>;

    fn write_current_term_and_voted_for(&self, quorum_id: &str, current_term: u64, voted_for: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ReplicationData {
    current_term: u64,
    voted_for: u64,
}

/// Stores each quorum's record as JSON in its own file, replaced atomically.
pub struct FilePersister {
    base_dir: PathBuf,
}

impl FilePersister {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn quorum_dir(&self, quorum_id: &str) -> Result<PathBuf> {
        validate_quorum_id(quorum_id)?;
        Ok(self.base_dir.join(REPLICATOR_PERSISTER_DIRECTORY_NAME).join(quorum_id))
    }

    fn read(&self, quorum_id: &str) -> Result<ReplicationData> {
        let path = self.quorum_dir(quorum_id)?.join(REPLICATOR_PERSISTER_FILE_NAME);
        if !path.exists() {
            return Ok(ReplicationData::default());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        // directory fsync makes the rename itself durable; not every platform allows it
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

impl ReplicatorInfoPersistence for FilePersister {
    fn read_current_term(&self, quorum_id: &str) -> Result<u64> {
        Ok(self.read(quorum_id)?.current_term)
    }

    fn read_voted_for(&self, quorum_id: &str) -> Result<u64> {
        Ok(self.read(quorum_id)?.voted_for)
    }

    fn write_current_term_and_voted_for(&self, quorum_id: &str, current_term: u64, voted_for: u64) -> Result<()> {
        let dir = self.quorum_dir(quorum_id)?;
        fs::create_dir_all(&dir)?;
        let data = ReplicationData {
            current_term,
            voted_for,
        };
        write_atomically(&dir.join(REPLICATOR_PERSISTER_FILE_NAME), &serde_json::to_vec(&data)?)
    }
}

/// Keeps records in memory. Writes can be made to fail, to exercise fatal paths.
#[derive(Default)]
pub struct MemoryPersister {
    records: Mutex<HashMap<String, ReplicationData>>,
    fail_writes: Mutex<bool>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }

    fn read(&self, quorum_id: &str) -> Result<ReplicationData> {
        let records = self
            .records
            .lock()
            .map_err(|_| ReplicatorError::Fatal("persister lock poisoned".into()))?;
        Ok(records.get(quorum_id).copied().unwrap_or_default())
    }
}

impl ReplicatorInfoPersistence for MemoryPersister {
    fn read_current_term(&self, quorum_id: &str) -> Result<u64> {
        Ok(self.read(quorum_id)?.current_term)
    }

    fn read_voted_for(&self, quorum_id: &str) -> Result<u64> {
        Ok(self.read(quorum_id)?.voted_for)
    }

    fn write_current_term_and_voted_for(&self, quorum_id: &str, current_term: u64, voted_for: u64) -> Result<()> {
        if self.fail_writes.lock().map(|flag| *flag).unwrap_or(true) {
            return Err(ReplicatorError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "persister configured to fail",
            )));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| ReplicatorError::Fatal("persister lock poisoned".into()))?;
        records.insert(
            quorum_id.to_string(),
            ReplicationData {
                current_term,
                voted_for,
            },
        );
        Ok(())
    }
}
