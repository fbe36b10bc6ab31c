//! Quorum membership, including the joint (transitional) state used while
//! peers are being added or removed.
//!
//! A configuration is created with [`QuorumConfiguration::of`], moves to a
//! transitional configuration spanning the old and new peer sets, and ends at
//! the completed configuration once the transition commits. While
//! transitional, every majority decision needs a majority of *both* sets.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuorumConfiguration {
    current_peers: BTreeSet<u64>,
    transitional: bool,
    next_peers: BTreeSet<u64>,
}

impl QuorumConfiguration {
    pub const EMPTY: QuorumConfiguration = QuorumConfiguration {
        current_peers: BTreeSet::new(),
        transitional: false,
        next_peers: BTreeSet::new(),
    };

    pub fn of(peers: impl IntoIterator<Item = u64>) -> Self {
        Self {
            current_peers: peers.into_iter().collect(),
            transitional: false,
            next_peers: BTreeSet::new(),
        }
    }

    /// Joint configuration spanning this configuration's peers and `new_peers`.
    pub fn transitional_configuration(&self, new_peers: impl IntoIterator<Item = u64>) -> Self {
        Self {
            current_peers: self.current_peers.clone(),
            transitional: true,
            next_peers: new_peers.into_iter().collect(),
        }
    }

    /// The configuration that follows a committed transition.
    ///
    /// Calling this on a configuration that is not transitional returns it unchanged.
    pub fn completed_configuration(&self) -> Self {
        if !self.transitional {
            return self.clone();
        }
        Self::of(self.next_peers.iter().copied())
    }

    pub fn is_transitional(&self) -> bool {
        self.transitional
    }

    pub fn is_empty(&self) -> bool {
        self.current_peers.is_empty() && self.next_peers.is_empty()
    }

    pub fn current_peers(&self) -> &BTreeSet<u64> {
        &self.current_peers
    }

    pub fn next_peers(&self) -> &BTreeSet<u64> {
        &self.next_peers
    }

    /// Every peer taking part in decisions: the union of both sets when transitional.
    pub fn all_peers(&self) -> BTreeSet<u64> {
        if self.transitional {
            self.current_peers.union(&self.next_peers).copied().collect()
        } else {
            self.current_peers.clone()
        }
    }

    pub fn contains(&self, peer: u64) -> bool {
        self.current_peers.contains(&peer) || (self.transitional && self.next_peers.contains(&peer))
    }

    pub fn set_contains_majority(&self, voters: &BTreeSet<u64>) -> bool {
        if self.transitional {
            has_majority(&self.current_peers, voters) && has_majority(&self.next_peers, voters)
        } else {
            has_majority(&self.current_peers, voters)
        }
    }

    /// Greatest index present on a majority, given each peer's last acknowledged index.
    ///
    /// Peers missing from `acked` count as having acknowledged nothing.
    pub fn calculate_committed_index(&self, acked: &HashMap<u64, u64>) -> u64 {
        if self.transitional {
            committed_index_of(&self.current_peers, acked)
                .min(committed_index_of(&self.next_peers, acked))
        } else {
            committed_index_of(&self.current_peers, acked)
        }
    }
}

impl fmt::Display for QuorumConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transitional {
            write!(f, "{:?} -> {:?}", self.current_peers, self.next_peers)
        } else {
            write!(f, "{:?}", self.current_peers)
        }
    }
}

fn has_majority(peers: &BTreeSet<u64>, voters: &BTreeSet<u64>) -> bool {
    if peers.is_empty() {
        return false;
    }
    let votes = peers.intersection(voters).count();
    votes > peers.len() / 2
}

fn committed_index_of(peers: &BTreeSet<u64>, acked: &HashMap<u64, u64>) -> u64 {
    if peers.is_empty() {
        return 0;
    }
    let mut indexes: Vec<u64> = peers
        .iter()
        .map(|peer| acked.get(peer).copied().unwrap_or(0))
        .collect();
    indexes.sort_unstable_by(|a, b| b.cmp(a));
    // the (n/2)-th highest index is held by a majority
    indexes[peers.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u64]) -> BTreeSet<u64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn empty_configuration_is_the_default() {
        assert_eq!(QuorumConfiguration::default(), QuorumConfiguration::EMPTY);
        assert!(QuorumConfiguration::EMPTY.is_empty());
        assert!(!QuorumConfiguration::EMPTY.set_contains_majority(&set(&[1, 2, 3])));
    }

    #[test]
    fn simple_majority() {
        let config = QuorumConfiguration::of([1, 2, 3]);
        assert!(!config.set_contains_majority(&set(&[1])));
        assert!(config.set_contains_majority(&set(&[1, 3])));
        assert!(config.set_contains_majority(&set(&[1, 4, 2])));
    }

    #[test]
    fn transitional_configuration_needs_both_majorities() {
        let config = QuorumConfiguration::of([1, 2, 3]).transitional_configuration([3, 4, 5]);
        assert!(config.is_transitional());
        assert_eq!(config.all_peers(), set(&[1, 2, 3, 4, 5]));

        assert!(!config.set_contains_majority(&set(&[1, 2])));
        assert!(!config.set_contains_majority(&set(&[4, 5])));
        assert!(config.set_contains_majority(&set(&[1, 3, 4])));
    }

    #[test]
    fn completed_configuration_uses_next_peers() {
        let config = QuorumConfiguration::of([1, 2, 3]).transitional_configuration([2, 3, 4]);
        let completed = config.completed_configuration();
        assert!(!completed.is_transitional());
        assert_eq!(completed, QuorumConfiguration::of([2, 3, 4]));
        assert!(!completed.contains(1));
    }

    #[test]
    fn committed_index_is_the_majority_floor() {
        let config = QuorumConfiguration::of([1, 2, 3]);
        let acked = HashMap::from([(1, 7), (2, 5), (3, 2)]);
        assert_eq!(config.calculate_committed_index(&acked), 5);

        let acked = HashMap::from([(1, 7)]);
        assert_eq!(config.calculate_committed_index(&acked), 0);
    }

    #[test]
    fn transitional_committed_index_takes_the_lower_majority() {
        let config = QuorumConfiguration::of([1, 2, 3]).transitional_configuration([4, 5, 6]);
        let acked = HashMap::from([(1, 9), (2, 9), (3, 9), (4, 3), (5, 4), (6, 1)]);
        assert_eq!(config.calculate_committed_index(&acked), 3);
    }
}
