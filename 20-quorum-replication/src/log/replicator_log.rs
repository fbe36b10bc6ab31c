//! The log a replicator instance writes through.
//!
//! # Contract
//!
//! - Mutations (`append`, `truncate`) take `&mut self`; the synchronous getters
//!   reflect a mutation as soon as the call returns, before its future resolves.
//! - `append` must continue the log without a gap, otherwise it fails with
//!   [`ReplicatorError::LogConsistency`] and the log is untouched.
//! - `entries(start, end)` excludes `end`; `term_at` of a missing entry is 0.

use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};

use crate::entry::LogEntry;
use crate::error::{ReplicatorError, Result};
use crate::log::oracle::LogEntryOracle;
use crate::quorum::QuorumConfiguration;

pub type LogFuture<T> = BoxFuture<'static, Result<T>>;

pub trait ReplicatorLog: Send + 'static {
    fn append(&mut self, entries: Vec<LogEntry>) -> LogFuture<()>;

    fn entries(&self, start: u64, end: u64) -> LogFuture<Vec<LogEntry>>;

    fn term_at(&self, index: u64) -> u64;

    fn last_term(&self) -> u64;

    fn last_index(&self) -> u64;

    /// Removes `index` and every entry after it.
    fn truncate(&mut self, index: u64) -> LogFuture<()>;

    fn last_configuration(&self) -> QuorumConfiguration;

    fn last_configuration_index(&self) -> u64;
}

/// Verifies that `entries` continue a log whose last index is `last_index`.
pub fn check_append(last_index: u64, entries: &[LogEntry]) -> Result<()> {
    let mut expected = last_index + 1;
    for entry in entries {
        if entry.index != expected {
            return Err(ReplicatorError::LogConsistency(format!(
                "append expected seq {expected} but got {}",
                entry.index
            )));
        }
        expected += 1;
    }
    Ok(())
}

fn ready<T: Send + 'static>(result: Result<T>) -> LogFuture<T> {
    future::ready(result).boxed()
}

/// A log held in memory, for simulations and tests.
#[derive(Debug, Default)]
pub struct InRamLog {
    entries: Vec<LogEntry>,
    oracle: LogEntryOracle,
}

impl InRamLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicatorLog for InRamLog {
    fn append(&mut self, entries: Vec<LogEntry>) -> LogFuture<()> {
        if let Err(err) = check_append(self.last_index(), &entries) {
            return ready(Err(err));
        }
        for entry in entries {
            self.oracle.notify_logging(&entry);
            self.entries.push(entry);
        }
        ready(Ok(()))
    }

    fn entries(&self, start: u64, end: u64) -> LogFuture<Vec<LogEntry>> {
        if start == end {
            return ready(Ok(Vec::new()));
        }
        if start == 0 || start > end || end > self.last_index() + 1 {
            return ready(Err(ReplicatorError::InvalidArgument(format!(
                "entry range {start}..{end} outside log ending at {}",
                self.last_index()
            ))));
        }
        let slice = self.entries[(start - 1) as usize..(end - 1) as usize].to_vec();
        ready(Ok(slice))
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 || index > self.last_index() {
            return 0;
        }
        self.entries[(index - 1) as usize].term
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|entry| entry.term).unwrap_or(0)
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn truncate(&mut self, index: u64) -> LogFuture<()> {
        if index == 0 {
            return ready(Err(ReplicatorError::InvalidArgument(
                "cannot truncate at index 0".into(),
            )));
        }
        self.entries.truncate((index - 1) as usize);
        self.oracle.notify_truncation(index);
        ready(Ok(()))
    }

    fn last_configuration(&self) -> QuorumConfiguration {
        self.oracle.last_configuration().configuration
    }

    fn last_configuration_index(&self) -> u64 {
        self.oracle.last_configuration().seq_num
    }
}

/// A mutating call observed by [`InterceptingLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCall {
    Append(Vec<LogEntry>),
    Truncate(u64),
}

/// Forwards to another log while recording every mutating call.
///
/// Tests keep a clone of [`InterceptingLog::calls`] and assert on the recorded
/// sequence after handing the log to a replicator.
pub struct InterceptingLog<L> {
    inner: L,
    calls: Arc<Mutex<Vec<LogCall>>>,
}

impl<L: ReplicatorLog> InterceptingLog<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<LogCall>>> {
        Arc::clone(&self.calls)
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn record(&self, call: LogCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl<L: ReplicatorLog> ReplicatorLog for InterceptingLog<L> {
    fn append(&mut self, entries: Vec<LogEntry>) -> LogFuture<()> {
        self.record(LogCall::Append(entries.clone()));
        self.inner.append(entries)
    }

    fn entries(&self, start: u64, end: u64) -> LogFuture<Vec<LogEntry>> {
        self.inner.entries(start, end)
    }

    fn term_at(&self, index: u64) -> u64 {
        self.inner.term_at(index)
    }

    fn last_term(&self) -> u64 {
        self.inner.last_term()
    }

    fn last_index(&self) -> u64 {
        self.inner.last_index()
    }

    fn truncate(&mut self, index: u64) -> LogFuture<()> {
        self.record(LogCall::Truncate(index));
        self.inner.truncate(index)
    }

    fn last_configuration(&self) -> QuorumConfiguration {
        self.inner.last_configuration()
    }

    fn last_configuration_index(&self) -> u64 {
        self.inner.last_configuration_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entries;

    #[tokio::test]
    async fn empty_log_defaults() {
        let log = InRamLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(1), 0);
        assert_eq!(log.last_configuration_index(), 0);
        assert_eq!(log.last_configuration(), QuorumConfiguration::EMPTY);
        assert!(log.entries(1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_gaps_without_mutating() {
        let mut log = InRamLog::new();
        log.append(entries().term(1).indexes(&[1, 2]).build()).await.unwrap();

        let gap = log.append(entries().term(1).indexes(&[4]).build()).await;
        assert!(matches!(gap, Err(ReplicatorError::LogConsistency(_))));
        assert_eq!(log.last_index(), 2);
    }

    #[tokio::test]
    async fn getters_reflect_truncation_immediately() {
        let config = QuorumConfiguration::of([1, 2, 3]);
        let mut log = InRamLog::new();
        log.append(
            entries()
                .term(1)
                .configuration_and_index(config.clone(), 1)
                .term(2)
                .indexes(&[2, 3])
                .build(),
        )
        .await
        .unwrap();
        assert_eq!(log.last_configuration(), config);

        let pending = log.truncate(2);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
        pending.await.unwrap();

        log.truncate(1).await.unwrap();
        assert_eq!(log.last_configuration(), QuorumConfiguration::EMPTY);
    }

    #[tokio::test]
    async fn intercepting_log_records_mutations() {
        let mut log = InterceptingLog::new(InRamLog::new());
        let calls = log.calls();
        let logged = entries().term(1).indexes(&[1, 2]).build();
        log.append(logged.clone()).await.unwrap();
        log.truncate(2).await.unwrap();

        assert_eq!(log.inner().last_index(), 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![LogCall::Append(logged), LogCall::Truncate(2)]
        );
    }
}
