//! Replicator instances: leader election, log matching and commit detection.
//!
//! [`Replicator::start`] spawns the instance task and returns a handle. The
//! instance talks to its peers only through [`OutgoingRpc`] values it pushes
//! to the transport; whoever owns the transport routes each request to the
//! destination's [`Replicator::deliver`] and passes the answer back through the
//! request's reply slot.

mod handle;
mod instance;
pub mod rpc;

pub use handle::{ReceiptFuture, Replicator, ReplicatorChannels, ReplicatorInstanceEvent, ReplicatorStatus, Role};
pub use rpc::{
    AppendEntries, AppendEntriesReply, OutgoingRequest, OutgoingRpc, RequestVote, RequestVoteReply, RpcMessage,
    RpcRequest,
};
