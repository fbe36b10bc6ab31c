//! Answers "what term / which configuration was in force at seq N" without
//! reading the log.
//!
//! Only changes are stored: the seq at which each new term begins and the seq
//! of every configuration entry. Both maps are floor-queried.

use std::collections::BTreeMap;

use crate::entry::LogEntry;
use crate::quorum::QuorumConfiguration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumConfigurationWithSeqNum {
    pub configuration: QuorumConfiguration,
    pub seq_num: u64,
}

impl QuorumConfigurationWithSeqNum {
    pub fn empty() -> Self {
        Self {
            configuration: QuorumConfiguration::EMPTY,
            seq_num: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogEntryOracle {
    term_changes: BTreeMap<u64, u64>,
    configurations: BTreeMap<u64, QuorumConfiguration>,
}

impl LogEntryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_logging(&mut self, entry: &LogEntry) {
        if self.term_at_seq_num(entry.index) != entry.term {
            self.term_changes.insert(entry.index, entry.term);
        }
        if let Some(config) = entry.quorum_configuration() {
            self.configurations.insert(entry.index, config.clone());
        }
    }

    /// Seeds facts that precede every entry still present, taken from a log
    /// file header.
    pub fn notify_base(
        &mut self,
        base_seq_num: u64,
        base_term: u64,
        base_configuration: &QuorumConfigurationWithSeqNum,
    ) {
        if base_seq_num > 0 && self.term_at_seq_num(base_seq_num) != base_term {
            self.term_changes.insert(base_seq_num, base_term);
        }
        if base_configuration.seq_num > 0 {
            self.configurations
                .entry(base_configuration.seq_num)
                .or_insert_with(|| base_configuration.configuration.clone());
        }
    }

    /// Forgets everything at or after `seq_num`.
    pub fn notify_truncation(&mut self, seq_num: u64) {
        self.term_changes.split_off(&seq_num);
        self.configurations.split_off(&seq_num);
    }

    /// Term of the entry at `seq_num`, assuming it exists; 0 before the first entry.
    pub fn term_at_seq_num(&self, seq_num: u64) -> u64 {
        self.term_changes
            .range(..=seq_num)
            .next_back()
            .map(|(_, &term)| term)
            .unwrap_or(0)
    }

    pub fn config_at_seq_num(&self, seq_num: u64) -> QuorumConfigurationWithSeqNum {
        self.configurations
            .range(..=seq_num)
            .next_back()
            .map(|(&seq_num, config)| QuorumConfigurationWithSeqNum {
                configuration: config.clone(),
                seq_num,
            })
            .unwrap_or_else(QuorumConfigurationWithSeqNum::empty)
    }

    pub fn last_configuration(&self) -> QuorumConfigurationWithSeqNum {
        self.config_at_seq_num(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entries;

    fn oracle_of(logged: &[LogEntry]) -> LogEntryOracle {
        let mut oracle = LogEntryOracle::new();
        logged.iter().for_each(|entry| oracle.notify_logging(entry));
        oracle
    }

    #[test]
    fn tracks_terms_by_change_point() {
        let oracle = oracle_of(&entries().term(77).indexes(&[1, 2]).term(78).indexes(&[3, 4]).build());
        assert_eq!(oracle.term_at_seq_num(0), 0);
        assert_eq!(oracle.term_at_seq_num(2), 77);
        assert_eq!(oracle.term_at_seq_num(3), 78);
        assert_eq!(oracle.term_changes.len(), 2);
    }

    #[test]
    fn truncation_restores_earlier_configurations() {
        let transitional = QuorumConfiguration::of([1, 2, 3]).transitional_configuration([4, 5, 6]);
        let completed = transitional.completed_configuration();
        let mut oracle = oracle_of(
            &entries()
                .term(1)
                .indexes(&[1, 2])
                .configuration_and_index(transitional.clone(), 3)
                .indexes(&[4, 5])
                .configuration_and_index(completed.clone(), 6)
                .build(),
        );
        assert_eq!(oracle.last_configuration().configuration, completed);

        oracle.notify_truncation(4);
        assert_eq!(
            oracle.last_configuration(),
            QuorumConfigurationWithSeqNum {
                configuration: transitional,
                seq_num: 3
            }
        );

        oracle.notify_truncation(2);
        assert_eq!(oracle.last_configuration(), QuorumConfigurationWithSeqNum::empty());
    }

    #[test]
    fn truncation_restores_previous_term() {
        let mut oracle = oracle_of(&entries().term(1).indexes(&[1, 2]).term(2).indexes(&[3]).build());
        oracle.notify_truncation(3);
        assert_eq!(oracle.term_at_seq_num(3), 1);
    }
}
