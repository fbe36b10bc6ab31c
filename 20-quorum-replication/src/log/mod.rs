//! The replicated log and its persistence.
//!
//! - [`replicator_log`]: the [`ReplicatorLog`] trait instances write through,
//!   plus the in-memory and intercepting implementations
//! - [`service`]: per-quorum worker threads and the [`Mooring`] facade
//! - [`quorum`]: one quorum's rolled log files
//! - [`navigator`], [`oracle`], [`persistence`], [`files`]: the pieces a
//!   quorum log is built from

pub mod files;
pub mod navigator;
pub mod oracle;
pub mod persistence;
pub mod quorum;
pub mod replicator_log;
pub mod service;

pub use oracle::{LogEntryOracle, QuorumConfigurationWithSeqNum};
pub use replicator_log::{InRamLog, InterceptingLog, LogCall, LogFuture, ReplicatorLog};
pub use service::{LogReader, LogService, Mooring};
