//! Commit-level writes on top of a [`Replicator`].
//!
//! A replicator receipt only says an entry is durable on the leader. The
//! [`GeneralizedReplicator`] pairs each receipt with the commit notices the
//! instance publishes, and resolves the write with its sequence number once
//! the entry is committed in the term it was written in.
//!
//! One task owns the queue of outstanding writes. Submissions travel to that
//! task over a channel and the task itself calls [`Replicator::log_data`], so
//! queue order is submission order and notices can be matched against the
//! queue head alone.

use std::collections::VecDeque;
use std::future::Future;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::entry::{IndexCommitNotice, ReplicatorReceipt};
use crate::error::{ReplicatorError, Result};
use crate::log::LogReader;
use crate::replicator::{ReceiptFuture, Replicator};

struct Submission {
    data: Vec<Vec<u8>>,
    completion: oneshot::Sender<Result<u64>>,
}

struct PendingWrite {
    receipt: ReceiptFuture,
    resolved: Option<Result<ReplicatorReceipt>>,
    completion: oneshot::Sender<Result<u64>>,
}

impl PendingWrite {
    /// The receipt if it has resolved, taken out of the pending write.
    fn take_receipt(&mut self) -> Option<Result<ReplicatorReceipt>> {
        self.resolved.take().or_else(|| self.receipt.try_take())
    }

    fn complete(self, outcome: Result<u64>) {
        let _ = self.completion.send(outcome);
    }
}

pub struct GeneralizedReplicator {
    replicator: Replicator,
    submissions: mpsc::UnboundedSender<Submission>,
    reader: Option<LogReader>,
}

impl GeneralizedReplicator {
    /// Spawns the queue task for `replicator` on the current runtime.
    pub fn new(replicator: Replicator) -> Self {
        let (submissions, inbox) = mpsc::unbounded_channel();
        let notices = replicator.subscribe_commit_notices();
        tokio::spawn(run(replicator.clone(), inbox, notices));
        Self {
            replicator,
            submissions,
            reader: None,
        }
    }

    /// Attaches a reader for the committed data of the same quorum.
    pub fn with_reader(mut self, reader: LogReader) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Replicates `data` and resolves with its sequence number once committed.
    ///
    /// Fails at once with `InvalidState` when the replicator is not leader.
    /// Otherwise the write is queued when this is called, not when the future
    /// is polled.
    pub fn replicate(&self, data: Vec<Vec<u8>>) -> Result<impl Future<Output = Result<u64>> + Send + 'static> {
        self.replicator.check_leader()?;
        let (completion, outcome) = oneshot::channel();
        self.submissions
            .send(Submission { data, completion })
            .map_err(|_| ReplicatorError::InvalidState("replication queue has stopped".into()))?;
        Ok(async move {
            outcome
                .await
                .map_err(|_| ReplicatorError::InvalidState("replication queue dropped the write".into()))?
        })
    }

    /// Resolves once the underlying replicator leads its quorum.
    pub async fn is_available(&self) -> Result<()> {
        self.replicator.is_available().await
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    pub fn reader(&self) -> Option<&LogReader> {
        self.reader.as_ref()
    }
}

async fn run(
    replicator: Replicator,
    mut submissions: mpsc::UnboundedReceiver<Submission>,
    mut notices: broadcast::Receiver<IndexCommitNotice>,
) {
    let mut queue: VecDeque<PendingWrite> = VecDeque::new();
    loop {
        let head_waiting = queue.front().is_some_and(|head| head.resolved.is_none());
        tokio::select! {
            submission = submissions.recv() => {
                let Some(Submission { data, completion }) = submission else { break };
                match replicator.log_data(data) {
                    Ok(receipt) => queue.push_back(PendingWrite { receipt, resolved: None, completion }),
                    Err(err) => {
                        let _ = completion.send(Err(err));
                    }
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    if notice.node_id == replicator.node_id() && notice.quorum_id == replicator.quorum_id() {
                        apply_commit_notice(&mut queue, &notice);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(quorum_id = %replicator.quorum_id(), skipped, "commit notices lagged, catching up");
                    catch_up(&replicator, &mut queue).await;
                }
                Err(RecvError::Closed) => break,
            },
            receipt = head_receipt(&mut queue), if head_waiting => {
                match receipt {
                    Ok(receipt) => {
                        if let Some(head) = queue.front_mut() {
                            head.resolved = Some(Ok(receipt));
                        }
                    }
                    Err(err) => {
                        if let Some(head) = queue.pop_front() {
                            head.complete(Err(err));
                        }
                    }
                }
            }
        }
    }

    debug!(quorum_id = %replicator.quorum_id(), outstanding = queue.len(), "replication queue stopped");
    for pending in queue {
        pending.complete(Err(ReplicatorError::InvalidState("replicator has stopped".into())));
    }
}

async fn head_receipt(queue: &mut VecDeque<PendingWrite>) -> Result<ReplicatorReceipt> {
    match queue.front_mut() {
        Some(head) => (&mut head.receipt).await,
        None => std::future::pending().await,
    }
}

/// Settles queued writes against the instance's commit state after notices
/// were lost. Stops at the first write that is not yet committed; the notices
/// still to come cover it.
async fn catch_up(replicator: &Replicator, queue: &mut VecDeque<PendingWrite>) {
    while let Some(head) = queue.front_mut() {
        let Some(receipt) = head.take_receipt() else { break };
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(err) => {
                if let Some(head) = queue.pop_front() {
                    head.complete(Err(err));
                }
                continue;
            }
        };
        let outcome = match replicator.committed_term(receipt.seq_num).await {
            Ok(None) => {
                if let Some(head) = queue.front_mut() {
                    head.resolved = Some(Ok(receipt));
                }
                break;
            }
            Ok(Some(term)) if term == receipt.term => Ok(receipt.seq_num),
            Ok(Some(term)) => Err(ReplicatorError::LogConsistency(format!(
                "entry {} was written in term {} but committed in term {term}",
                receipt.seq_num, receipt.term
            ))),
            Err(err) => Err(err),
        };
        if let Some(head) = queue.pop_front() {
            head.complete(outcome);
        }
    }
}

/// Resolves every queued write that `notice` commits, stopping at the first
/// write whose receipt is still outstanding or lies beyond the notice.
fn apply_commit_notice(queue: &mut VecDeque<PendingWrite>, notice: &IndexCommitNotice) {
    while let Some(head) = queue.front_mut() {
        let Some(receipt) = head.take_receipt() else { break };
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(err) => {
                if let Some(head) = queue.pop_front() {
                    head.complete(Err(err));
                }
                continue;
            }
        };
        if receipt.seq_num > notice.last_index {
            head.resolved = Some(Ok(receipt));
            break;
        }

        let Some(head) = queue.pop_front() else { break };
        if receipt.seq_num < notice.first_index {
            head.complete(Err(ReplicatorError::LogConsistency(format!(
                "commit notice {}..={} skipped entry {}",
                notice.first_index, notice.last_index, receipt.seq_num
            ))));
        } else if receipt.term != notice.term {
            head.complete(Err(ReplicatorError::LogConsistency(format!(
                "entry {} was written in term {} but committed in term {}",
                receipt.seq_num, receipt.term, notice.term
            ))));
        } else {
            head.complete(Ok(receipt.seq_num));
        }
    }
}
