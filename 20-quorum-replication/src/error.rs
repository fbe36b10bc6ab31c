//! Error kinds surfaced by the log, the replicator instances, and the service.
//!
//! The variants follow how each failure is handled: `InvalidState` goes back to
//! the caller immediately, `LogConsistency` fails exactly the pending future it
//! concerns, `Timeout` replaces an indefinite wait, `Transport` is recovered by
//! retrying, and `Fatal` takes the replicator instance down.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// The operation needs a role (usually leader) that the replicator does not hold.
    #[error("invalid replicator state: {0}")]
    InvalidState(String),

    /// Out-of-order append, skipped commit notice, or receipt/notice term mismatch.
    #[error("log consistency violation: {0}")]
    LogConsistency(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Peer unreachable or connection dropped.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Unrecoverable; the owning instance disposes itself.
    #[error("fatal replicator failure: {0}")]
    Fatal(String),

    #[error("log entry {0} not found")]
    EntryNotFound(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ReplicatorError {
    /// Copies the error so it can be handed to several waiters.
    ///
    /// `io::Error` is not `Clone`, so I/O failures keep their kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidState(msg) => Self::InvalidState(msg.clone()),
            Self::LogConsistency(msg) => Self::LogConsistency(msg.clone()),
            Self::Timeout(msg) => Self::Timeout(msg.clone()),
            Self::Transport(msg) => Self::Transport(msg.clone()),
            Self::Fatal(msg) => Self::Fatal(msg.clone()),
            Self::EntryNotFound(seq_num) => Self::EntryNotFound(*seq_num),
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::Codec(msg) => Self::Codec(msg.clone()),
            Self::Io(err) => Self::Io(io::Error::new(err.kind(), err.to_string())),
        }
    }
}

impl From<bincode::Error> for ReplicatorError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;
