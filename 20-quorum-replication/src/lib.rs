//! Quorum-replicated write-ahead log.
//!
//! Every quorum is a group of nodes that keep one ordered log in agreement
//! using a Raft-style protocol: a leader is elected per term, appends entries,
//! and declares them committed once a majority of the current configuration
//! (both halves of a transitional one) holds them durably.
//!
//! # Architecture
//!
//! - **Replicator instance**: one tokio task per node and quorum that owns the
//!   consensus state and talks to its peers only through channels
//! - **Log worker**: one OS thread per quorum that owns the log files, so disk
//!   I/O never blocks an async task
//! - **Service**: routes RPCs between nodes over TCP and hosts the instances
//!
//! Writers either wait for a local receipt and then watch the commit notices
//! themselves, or use [`generalized::GeneralizedReplicator`] or
//! [`shim::WalShim`], which do the pairing for them.
//!
//! # Modules
//!
//! - [`quorum`]: membership, majorities and the committed index
//! - [`entry`]: log entries, receipts and commit notices
//! - [`codec`]: length-prefixed bincode framing
//! - [`log`]: the per-quorum log, its files and its in-memory variants
//! - [`persister`]: durable current term and vote
//! - [`replicator`]: the consensus state machine and its handle
//! - [`generalized`]: writes that resolve on commit
//! - [`shim`]: append-then-sync facade
//! - [`wire`]: the network envelope
//! - [`service`]: TCP transport and instance registry
//! - [`settings`]: tunables and on-disk names

pub mod codec;
pub mod entry;
pub mod error;
pub mod generalized;
pub mod log;
pub mod persister;
pub mod quorum;
pub mod replicator;
pub mod service;
pub mod settings;
pub mod shim;
pub mod wire;

pub use error::{ReplicatorError, Result};
