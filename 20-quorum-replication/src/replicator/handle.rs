//! The cloneable front of a running replicator instance.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::codec::MAX_FRAME_LEN;
use crate::entry::{IndexCommitNotice, ReplicatorReceipt};
use crate::error::{ReplicatorError, Result};
use crate::log::ReplicatorLog;
use crate::persister::ReplicatorInfoPersistence;
use crate::quorum::QuorumConfiguration;
use crate::replicator::instance::{InstanceChannels, ReplicatorInstance};
use crate::replicator::rpc::{AppendEntriesReply, OutgoingRpc, RequestVoteReply, RpcMessage, RpcRequest};
use crate::settings::ReplicatorSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    /// Terminal; the instance has stopped after an unrecoverable error.
    Failed,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorStatus {
    pub node_id: u64,
    pub quorum_id: String,
    pub role: Role,
    pub term: u64,
    pub leader_id: u64,
    pub last_index: u64,
    pub commit_index: u64,
    pub configuration: QuorumConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatorInstanceEvent {
    QuorumStart {
        node_id: u64,
        quorum_id: String,
    },
    LeaderElected {
        node_id: u64,
        quorum_id: String,
        term: u64,
        leader_id: u64,
    },
    ElectionTimeout {
        node_id: u64,
        quorum_id: String,
        term: u64,
    },
    LeaderDeposed {
        node_id: u64,
        quorum_id: String,
        term: u64,
    },
    QuorumFailure {
        node_id: u64,
        quorum_id: String,
        error: String,
    },
}

impl ReplicatorInstanceEvent {
    pub fn node_id(&self) -> u64 {
        match self {
            Self::QuorumStart { node_id, .. }
            | Self::LeaderElected { node_id, .. }
            | Self::ElectionTimeout { node_id, .. }
            | Self::LeaderDeposed { node_id, .. }
            | Self::QuorumFailure { node_id, .. } => *node_id,
        }
    }

    pub fn quorum_id(&self) -> &str {
        match self {
            Self::QuorumStart { quorum_id, .. }
            | Self::LeaderElected { quorum_id, .. }
            | Self::ElectionTimeout { quorum_id, .. }
            | Self::LeaderDeposed { quorum_id, .. }
            | Self::QuorumFailure { quorum_id, .. } => quorum_id,
        }
    }
}

/// Inbox of an instance task.
pub(crate) enum Command {
    LogData {
        data: Vec<Vec<u8>>,
        respond_to: oneshot::Sender<Result<ReplicatorReceipt>>,
    },
    ChangeQuorum {
        peers: BTreeSet<u64>,
        respond_to: oneshot::Sender<Result<ReplicatorReceipt>>,
    },
    Rpc {
        request: RpcRequest,
        respond_to: oneshot::Sender<RpcMessage>,
    },
    AppendReply {
        peer: u64,
        sent_term: u64,
        prev_log_index: u64,
        count: u64,
        reply: Option<AppendEntriesReply>,
    },
    VoteReply {
        peer: u64,
        sent_term: u64,
        reply: Option<RequestVoteReply>,
    },
    LocalAppendComplete {
        index: u64,
    },
    CommittedTerm {
        seq_num: u64,
        respond_to: oneshot::Sender<Option<u64>>,
    },
    Fail(ReplicatorError),
    Shutdown,
}

/// Resolves to the receipt of a logged entry once it is durable locally.
pub struct ReceiptFuture {
    receipt: oneshot::Receiver<Result<ReplicatorReceipt>>,
}

impl ReceiptFuture {
    pub(crate) fn new(receipt: oneshot::Receiver<Result<ReplicatorReceipt>>) -> Self {
        Self { receipt }
    }

    /// The receipt if it has already resolved, without waiting.
    pub fn try_take(&mut self) -> Option<Result<ReplicatorReceipt>> {
        match self.receipt.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(receipt_dropped())),
        }
    }
}

fn receipt_dropped() -> ReplicatorError {
    ReplicatorError::InvalidState("replicator stopped before the entry was logged".into())
}

impl Future for ReceiptFuture {
    type Output = Result<ReplicatorReceipt>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receipt)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(receipt_dropped())))
    }
}

/// Room left in a frame for the entry header and the message envelope.
const FRAME_HEADROOM: u64 = 64 * 1024;

fn check_entry_size(data: &[Vec<u8>]) -> Result<()> {
    let size = data.iter().map(|chunk| chunk.len() as u64 + 8).sum::<u64>();
    if size + FRAME_HEADROOM > MAX_FRAME_LEN {
        return Err(ReplicatorError::InvalidArgument(format!(
            "entry of {size} bytes exceeds the frame limit of {MAX_FRAME_LEN}"
        )));
    }
    Ok(())
}

/// Channels an instance publishes on. Several instances may share them.
#[derive(Clone)]
pub struct ReplicatorChannels {
    pub outgoing: mpsc::UnboundedSender<OutgoingRpc>,
    pub commit_notices: broadcast::Sender<IndexCommitNotice>,
    pub events: broadcast::Sender<ReplicatorInstanceEvent>,
}

impl ReplicatorChannels {
    /// Fresh broadcast channels around the given transport sender.
    pub fn new(outgoing: mpsc::UnboundedSender<OutgoingRpc>) -> Self {
        let (commit_notices, _) = broadcast::channel(1024);
        let (events, _) = broadcast::channel(256);
        Self {
            outgoing,
            commit_notices,
            events,
        }
    }
}

/// Handle to a replicator instance. Clones address the same instance.
#[derive(Clone)]
pub struct Replicator {
    node_id: u64,
    quorum_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ReplicatorStatus>,
    commit_notices: broadcast::Sender<IndexCommitNotice>,
    events: broadcast::Sender<ReplicatorInstanceEvent>,
}

impl Replicator {
    /// Starts an instance for `quorum_id` on the current tokio runtime.
    ///
    /// `peers` is the initial membership, used only when `log` is empty.
    pub async fn start<L: ReplicatorLog>(
        node_id: u64,
        quorum_id: &str,
        peers: impl IntoIterator<Item = u64>,
        settings: ReplicatorSettings,
        log: L,
        persister: Arc<dyn ReplicatorInfoPersistence>,
        channels: ReplicatorChannels,
    ) -> Result<Self> {
        let (commands, inbox) = mpsc::channel(settings.inbox_capacity.max(1));
        let (status_tx, status) = watch::channel(ReplicatorStatus {
            node_id,
            quorum_id: quorum_id.to_string(),
            role: Role::Follower,
            term: 0,
            leader_id: 0,
            last_index: 0,
            commit_index: 0,
            configuration: QuorumConfiguration::EMPTY,
        });

        let instance = ReplicatorInstance::new(
            node_id,
            quorum_id.to_string(),
            peers.into_iter().collect(),
            settings,
            log,
            persister,
            InstanceChannels {
                inbox,
                inbox_handle: commands.downgrade(),
                outgoing: channels.outgoing,
                commit_notices: channels.commit_notices.clone(),
                events: channels.events.clone(),
                status: status_tx,
            },
        )
        .await?;
        tokio::spawn(instance.run());

        Ok(Self {
            node_id,
            quorum_id: Arc::from(quorum_id),
            commands,
            status,
            commit_notices: channels.commit_notices,
            events: channels.events,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn quorum_id(&self) -> &str {
        &self.quorum_id
    }

    pub fn status(&self) -> ReplicatorStatus {
        self.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == Role::Leader
    }

    /// Logs `data` as the next entry. Fails at once with `InvalidState` unless
    /// this instance leads its quorum, and with `InvalidArgument` when the
    /// entry could not fit in a single frame.
    pub fn log_data(&self, data: Vec<Vec<u8>>) -> Result<ReceiptFuture> {
        self.check_leader()?;
        check_entry_size(&data)?;
        let (respond_to, receipt) = oneshot::channel();
        self.submit(Command::LogData { data, respond_to })?;
        Ok(ReceiptFuture::new(receipt))
    }

    /// Begins moving the quorum to `peers`. The receipt covers the transitional
    /// configuration entry; the completed configuration follows automatically.
    pub fn change_quorum(&self, peers: impl IntoIterator<Item = u64>) -> Result<ReceiptFuture> {
        self.check_leader()?;
        let (respond_to, receipt) = oneshot::channel();
        self.submit(Command::ChangeQuorum {
            peers: peers.into_iter().collect(),
            respond_to,
        })?;
        Ok(ReceiptFuture::new(receipt))
    }

    pub(crate) fn check_leader(&self) -> Result<()> {
        let status = self.status.borrow();
        if status.role == Role::Leader {
            return Ok(());
        }
        Err(ReplicatorError::InvalidState(format!(
            "node {} is {} for quorum {}",
            status.node_id, status.role, status.quorum_id
        )))
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                ReplicatorError::InvalidState("too many outstanding requests".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ReplicatorError::InvalidState("replicator has stopped".into())
            }
        })
    }

    /// The term of entry `seq_num` if the instance has committed it, `None`
    /// while it is not yet committed.
    ///
    /// Lets a commit-notice subscriber that fell behind the broadcast find out
    /// what it missed.
    pub async fn committed_term(&self, seq_num: u64) -> Result<Option<u64>> {
        let (respond_to, term) = oneshot::channel();
        self.commands
            .send(Command::CommittedTerm { seq_num, respond_to })
            .await
            .map_err(|_| ReplicatorError::InvalidState("replicator has stopped".into()))?;
        term.await
            .map_err(|_| ReplicatorError::InvalidState("replicator dropped the request".into()))
    }

    /// Hands a peer's request to the instance and waits for its answer.
    pub async fn deliver(&self, request: RpcRequest) -> Result<RpcMessage> {
        let reply = self.enqueue_rpc(request).await?;
        reply
            .await
            .map_err(|_| ReplicatorError::InvalidState("replicator dropped the request".into()))
    }

    /// Queues a peer's request behind those already queued, returning where
    /// the answer will arrive.
    pub(crate) async fn enqueue_rpc(&self, request: RpcRequest) -> Result<oneshot::Receiver<RpcMessage>> {
        let (respond_to, reply) = oneshot::channel();
        self.commands
            .send(Command::Rpc {
                request,
                respond_to,
            })
            .await
            .map_err(|_| ReplicatorError::InvalidState("replicator has stopped".into()))?;
        Ok(reply)
    }

    /// Resolves once this instance is leader. Fails if the instance stops or fails first.
    pub async fn is_available(&self) -> Result<()> {
        let mut status = self.status.clone();
        loop {
            match status.borrow_and_update().role {
                Role::Leader => return Ok(()),
                Role::Failed => {
                    return Err(ReplicatorError::Fatal(format!(
                        "replicator for quorum {} has failed",
                        self.quorum_id
                    )))
                }
                Role::Follower | Role::Candidate => {}
            }
            status
                .changed()
                .await
                .map_err(|_| ReplicatorError::InvalidState("replicator has stopped".into()))?;
        }
    }

    /// Resolves with the next status matching `predicate`.
    pub async fn wait_for_status(&self, predicate: impl Fn(&ReplicatorStatus) -> bool) -> Result<ReplicatorStatus> {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| ReplicatorError::InvalidState("replicator has stopped".into()))?;
        Ok(matched.clone())
    }

    pub fn subscribe_commit_notices(&self) -> broadcast::Receiver<IndexCommitNotice> {
        self.commit_notices.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ReplicatorInstanceEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.try_send(Command::Shutdown);
    }

    /// Whether the instance task has exited.
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}
