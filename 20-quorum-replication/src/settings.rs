//! Tunables for the log and the replicators.
//!
//! Defaults carry the production constants. Tests shrink the timers so that
//! elections finish in tens of milliseconds; the node binary can load
//! overrides from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const WAL_ROOT_DIRECTORY_NAME: &str = "wal";
pub const WAL_LOG_FILE_SUBDIRECTORY_NAME: &str = "logs";
pub const WAL_NAVIGATOR_DEFAULT_MAX_ENTRY_SEEK: u64 = 256;
pub const REPLICATOR_PERSISTER_DIRECTORY_NAME: &str = "repl";
pub const REPLICATOR_PERSISTER_FILE_NAME: &str = "replication-data";
pub const REPLICATOR_MAXIMUM_SIMULTANEOUS_LOG_REQUESTS: usize = 10_000;

/// Settings for a single replicator instance.
///
/// # Timing
///
/// - `election_timeout`: base time without hearing from a leader before a
///   follower campaigns; each wait is randomized between 1× and 2× this value
/// - `election_check_interval`: how often the instance checks that timer
/// - `leader_log_interval`: group-commit cadence at which the leader sends
///   AppendEntries (heartbeats when there is nothing new)
/// - `rpc_timeout`: how long an outgoing request waits for its reply
///
/// # Batching
///
/// An AppendEntries request carries at most `max_entries_per_append` entries
/// and at most `max_append_bytes` of encoded entries, except that a single
/// entry is always sent on its own. `log_data` refuses data that could never
/// fit in one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorSettings {
    #[serde(with = "millis")]
    pub election_timeout: Duration,
    #[serde(with = "millis")]
    pub election_check_interval: Duration,
    #[serde(with = "millis")]
    pub leader_log_interval: Duration,
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    pub max_entries_per_append: u64,
    pub max_append_bytes: u64,
    pub inbox_capacity: usize,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1000),
            election_check_interval: Duration::from_millis(100),
            leader_log_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(1000),
            max_entries_per_append: 1024,
            max_append_bytes: 16 * 1024 * 1024,
            inbox_capacity: REPLICATOR_MAXIMUM_SIMULTANEOUS_LOG_REQUESTS,
        }
    }
}

impl ReplicatorSettings {
    /// Short timers used by tests and local demos.
    pub fn fast() -> Self {
        Self {
            election_timeout: Duration::from_millis(150),
            election_check_interval: Duration::from_millis(10),
            leader_log_interval: Duration::from_millis(10),
            rpc_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Maximum number of entries the navigator scans past an index point.
    pub max_entry_seek: u64,
    /// Seconds to wait for a quorum's log worker to finish on close.
    pub close_timeout_secs: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            max_entry_seek: WAL_NAVIGATOR_DEFAULT_MAX_ENTRY_SEEK,
            close_timeout_secs: 15,
        }
    }
}

/// Everything a node needs; the JSON layout of an optional settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub replicator: ReplicatorSettings,
    pub log: LogSettings,
    #[serde(with = "millis")]
    pub wal_sync_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            replicator: ReplicatorSettings::default(),
            log: LogSettings::default(),
            wal_sync_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeSettings {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: NodeSettings =
            serde_json::from_str(r#"{"replicator": {"election_timeout": 300}}"#).unwrap();
        assert_eq!(settings.replicator.election_timeout, Duration::from_millis(300));
        assert_eq!(settings.replicator.leader_log_interval, Duration::from_millis(100));
        assert_eq!(settings.log.max_entry_seek, WAL_NAVIGATOR_DEFAULT_MAX_ENTRY_SEEK);
    }
}
