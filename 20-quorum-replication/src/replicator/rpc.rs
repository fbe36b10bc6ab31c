//! Messages exchanged between the replicator instances of a quorum.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::entry::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

/// `next_log_index` is the index the follower expects next: one past its last
/// entry on success, or where the leader should back off to on rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub next_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
}

impl RpcMessage {
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::RequestVoteReply(_) | Self::AppendEntriesReply(_))
    }
}

/// A request addressed from one node to another within a quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub from: u64,
    pub to: u64,
    pub quorum_id: String,
    pub message: RpcMessage,
}

/// A request on its way out of an instance, with the slot its reply goes into.
///
/// `session` identifies the exchange; when the requester gives up waiting it
/// sends [`OutgoingRpc::Cancel`] with the same session.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub session: u64,
    pub request: RpcRequest,
    pub reply_to: oneshot::Sender<RpcMessage>,
}

/// What replicator instances hand to the transport.
#[derive(Debug)]
pub enum OutgoingRpc {
    Request(OutgoingRequest),
    Cancel { session: u64 },
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session() -> u64 {
    NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
}
