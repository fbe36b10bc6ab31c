//! A write-ahead-log facade with blocking-style `append` then `sync` semantics.
//!
//! [`WalShim::append`] only queues an entry; [`WalShim::sync`] waits until every
//! queued entry is committed, or gives up after the sync timeout.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::entry::{IndexCommitNotice, ReplicatorReceipt};
use crate::error::{ReplicatorError, Result};
use crate::replicator::{ReceiptFuture, Replicator};

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WalShim {
    replicator: Replicator,
    notices: broadcast::Receiver<IndexCommitNotice>,
    pending: VecDeque<ReceiptFuture>,
    latest_notice: Option<IndexCommitNotice>,
    sync_timeout: Duration,
}

impl WalShim {
    pub fn new(replicator: Replicator) -> Self {
        Self::with_sync_timeout(replicator, DEFAULT_SYNC_TIMEOUT)
    }

    pub fn with_sync_timeout(replicator: Replicator, sync_timeout: Duration) -> Self {
        let notices = replicator.subscribe_commit_notices();
        Self {
            replicator,
            notices,
            pending: VecDeque::new(),
            latest_notice: None,
            sync_timeout,
        }
    }

    /// Queues `data` for replication. Fails at once when the replicator is not leader.
    pub fn append(&mut self, data: Vec<Vec<u8>>) -> Result<()> {
        let receipt = self.replicator.log_data(data)?;
        self.pending.push_back(receipt);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Waits until every queued entry is committed in the term it was written in.
    ///
    /// The queue is empty afterwards whether or not the sync succeeded.
    pub async fn sync(&mut self) -> Result<()> {
        let timeout = self.sync_timeout;
        let outcome = match tokio::time::timeout(timeout, self.drain()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReplicatorError::Timeout(format!(
                "wal sync did not complete within {timeout:?}"
            ))),
        };
        if outcome.is_err() {
            self.pending.clear();
        }
        outcome
    }

    async fn drain(&mut self) -> Result<()> {
        while let Some(receipt) = self.pending.front_mut() {
            let receipt = receipt.await?;
            self.pending.pop_front();
            self.await_commit(receipt).await?;
        }
        Ok(())
    }

    async fn await_commit(&mut self, receipt: ReplicatorReceipt) -> Result<()> {
        loop {
            let covering = self
                .latest_notice
                .as_ref()
                .filter(|n| n.last_index >= receipt.seq_num)
                .map(|n| (n.first_index, n.term));
            if let Some((first_index, term)) = covering {
                // notices resume past the entry only after some were lost
                if receipt.seq_num < first_index {
                    if self.committed_in_term(&receipt).await? {
                        return Ok(());
                    }
                    return Err(ReplicatorError::LogConsistency(format!(
                        "commit notices skipped entry {}",
                        receipt.seq_num
                    )));
                }
                if term != receipt.term {
                    return Err(ReplicatorError::LogConsistency(format!(
                        "entry {} was written in term {} but committed in term {term}",
                        receipt.seq_num, receipt.term
                    )));
                }
                return Ok(());
            }

            match self.notices.recv().await {
                Ok(notice) => {
                    if notice.node_id == self.replicator.node_id() && notice.quorum_id == self.replicator.quorum_id() {
                        self.latest_notice = Some(notice);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(quorum_id = %self.replicator.quorum_id(), skipped, "wal shim missed commit notices");
                    if self.committed_in_term(&receipt).await? {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(ReplicatorError::InvalidState("replicator has stopped".into()));
                }
            }
        }
    }

    /// Asks the instance whether `receipt` is committed, for when its notice
    /// was missed. A different commit term is an error.
    async fn committed_in_term(&self, receipt: &ReplicatorReceipt) -> Result<bool> {
        match self.replicator.committed_term(receipt.seq_num).await? {
            Some(term) if term == receipt.term => Ok(true),
            Some(term) => Err(ReplicatorError::LogConsistency(format!(
                "entry {} was written in term {} but committed in term {term}",
                receipt.seq_num, receipt.term
            ))),
            None => Ok(false),
        }
    }
}
