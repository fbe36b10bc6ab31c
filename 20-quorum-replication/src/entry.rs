//! Values that flow through the replicated log and out of it.

use serde::{Deserialize, Serialize};

use crate::quorum::QuorumConfiguration;

/// What a log entry carries: client data, or a change of quorum membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    Data(Vec<Vec<u8>>),
    Configuration(QuorumConfiguration),
}

/// One entry of a quorum's log.
///
/// `index` is the entry's sequence number: it starts at 1 and has no gaps.
/// Field order matters to the codec, which reads `term` and `index` without
/// decoding the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn data(term: u64, index: u64, data: Vec<Vec<u8>>) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Data(data),
        }
    }

    pub fn configuration(term: u64, index: u64, configuration: QuorumConfiguration) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Configuration(configuration),
        }
    }

    pub fn quorum_configuration(&self) -> Option<&QuorumConfiguration> {
        match &self.payload {
            EntryPayload::Configuration(config) => Some(config),
            EntryPayload::Data(_) => None,
        }
    }
}

/// Local acknowledgment that an entry was appended at `seq_num` during `term`.
///
/// A receipt says nothing about commitment; that arrives as an [`IndexCommitNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatorReceipt {
    pub term: u64,
    pub seq_num: u64,
}

/// Asserts that entries `first_index..=last_index`, all written in `term`,
/// are committed on the quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCommitNotice {
    pub node_id: u64,
    pub quorum_id: String,
    pub first_index: u64,
    pub last_index: u64,
    pub term: u64,
}

impl IndexCommitNotice {
    pub fn covers(&self, seq_num: u64) -> bool {
        self.first_index <= seq_num && seq_num <= self.last_index
    }
}

/// Client data read back out of a quorum's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorEntry {
    pub seq_num: u64,
    pub data: Vec<Vec<u8>>,
}

/// Builds runs of entries for tests: `entries().term(1).indexes(&[1, 2]).term(2).indexes(&[3])`.
#[derive(Debug, Default)]
pub struct EntrySequenceBuilder {
    term: u64,
    entries: Vec<LogEntry>,
}

pub fn entries() -> EntrySequenceBuilder {
    EntrySequenceBuilder::default()
}

impl EntrySequenceBuilder {
    pub fn term(mut self, term: u64) -> Self {
        self.term = term;
        self
    }

    pub fn indexes(mut self, indexes: &[u64]) -> Self {
        for &index in indexes {
            self.entries.push(LogEntry::data(
                self.term,
                index,
                vec![format!("data-{index}").into_bytes()],
            ));
        }
        self
    }

    pub fn configuration_and_index(mut self, config: QuorumConfiguration, index: u64) -> Self {
        self.entries.push(LogEntry::configuration(self.term, index, config));
        self
    }

    pub fn build(self) -> Vec<LogEntry> {
        self.entries
    }
}
