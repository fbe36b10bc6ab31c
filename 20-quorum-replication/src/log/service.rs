//! Owns every quorum's on-disk log and hands out the facades replicators write through.
//!
//! # Threading
//!
//! Each quorum gets one named OS thread that owns its [`QuorumLog`]. Requests
//! reach it over an unbounded channel and answers come back on oneshot
//! channels, so file I/O for a quorum is strictly serialized while different
//! quorums proceed in parallel and async callers never block.
//!
//! A [`Mooring`] is the single writer of a quorum. It keeps its own copy of the
//! oracle and last index, updated the moment a mutation is issued, which is
//! what lets the synchronous getters of [`ReplicatorLog`] stay current while
//! the write is still in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use futures::future::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::entry::{EntryPayload, LogEntry, ReplicatorEntry};
use crate::error::{ReplicatorError, Result};
use crate::log::files::validate_quorum_id;
use crate::log::oracle::LogEntryOracle;
use crate::log::quorum::QuorumLog;
use crate::log::replicator_log::{check_append, LogFuture, ReplicatorLog};
use crate::quorum::QuorumConfiguration;
use crate::settings::LogSettings;

enum LogCommand {
    Describe {
        respond_to: oneshot::Sender<Result<LogState>>,
    },
    Append {
        entries: Vec<LogEntry>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Entries {
        start: u64,
        end: u64,
        respond_to: oneshot::Sender<Result<Vec<LogEntry>>>,
    },
    Truncate {
        seq_num: u64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Roll {
        respond_to: oneshot::Sender<Result<()>>,
    },
    ClearOldLogs {
        older_than: SystemTime,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    Shutdown,
}

/// Snapshot handed to a new mooring.
struct LogState {
    last_index: u64,
    oracle: LogEntryOracle,
}

struct QuorumWorker {
    commands: mpsc::UnboundedSender<LogCommand>,
    thread: JoinHandle<()>,
    moored: bool,
}

pub struct LogService {
    base_dir: PathBuf,
    settings: LogSettings,
    workers: Mutex<HashMap<String, QuorumWorker>>,
}

impl LogService {
    pub fn open(base_dir: impl Into<PathBuf>, settings: LogSettings) -> Result<Arc<Self>> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        info!(base_dir = %base_dir.display(), "log service opened");
        Ok(Arc::new(Self {
            base_dir,
            settings,
            workers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn workers(&self) -> Result<MutexGuard<'_, HashMap<String, QuorumWorker>>> {
        self.workers
            .lock()
            .map_err(|_| ReplicatorError::Fatal("log service lock poisoned".into()))
    }

    fn commands_for(
        &self,
        workers: &mut HashMap<String, QuorumWorker>,
        quorum_id: &str,
    ) -> Result<mpsc::UnboundedSender<LogCommand>> {
        if let Some(worker) = workers.get(quorum_id) {
            return Ok(worker.commands.clone());
        }
        validate_quorum_id(quorum_id)?;
        let worker = spawn_worker(&self.base_dir, quorum_id, self.settings.clone())?;
        let commands = worker.commands.clone();
        workers.insert(quorum_id.to_string(), worker);
        Ok(commands)
    }

    /// The single writable facade for `quorum_id`'s log. Asking twice is an error.
    pub async fn mooring(&self, quorum_id: &str) -> Result<Mooring> {
        let commands = {
            let mut workers = self.workers()?;
            let commands = self.commands_for(&mut workers, quorum_id)?;
            let worker = workers
                .get_mut(quorum_id)
                .ok_or_else(|| ReplicatorError::Fatal(format!("no log worker for {quorum_id}")))?;
            if worker.moored {
                return Err(ReplicatorError::InvalidState(format!(
                    "quorum {quorum_id} already has a mooring"
                )));
            }
            worker.moored = true;
            commands
        };

        let state = request(&commands, |respond_to| LogCommand::Describe { respond_to }).await;
        let state = match state {
            Ok(state) => state,
            Err(err) => {
                // let a later attempt try again
                if let Some(worker) = self.workers()?.get_mut(quorum_id) {
                    worker.moored = false;
                }
                return Err(err);
            }
        };
        debug!(quorum_id, last_index = state.last_index, "moored quorum log");
        Ok(Mooring {
            quorum_id: quorum_id.to_string(),
            commands,
            oracle: state.oracle,
            last_index: state.last_index,
        })
    }

    /// Read-only access to the data entries of `quorum_id`'s log.
    pub fn reader(&self, quorum_id: &str) -> Result<LogReader> {
        let mut workers = self.workers()?;
        let commands = self.commands_for(&mut workers, quorum_id)?;
        Ok(LogReader { commands })
    }

    /// Closes the current file of `quorum_id` and starts a new one.
    pub async fn roll(&self, quorum_id: &str) -> Result<()> {
        let commands = {
            let mut workers = self.workers()?;
            self.commands_for(&mut workers, quorum_id)?
        };
        request(&commands, |respond_to| LogCommand::Roll { respond_to }).await
    }

    /// Deletes archived files of `quorum_id` last modified before `older_than`.
    pub async fn clear_old_logs(&self, quorum_id: &str, older_than: SystemTime) -> Result<usize> {
        let commands = {
            let mut workers = self.workers()?;
            self.commands_for(&mut workers, quorum_id)?
        };
        request(&commands, |respond_to| LogCommand::ClearOldLogs {
            older_than,
            respond_to,
        })
        .await
    }

    /// Stops every worker, waiting up to the configured close timeout for each.
    pub async fn close(&self) -> Result<()> {
        let workers: Vec<(String, QuorumWorker)> = self.workers()?.drain().collect();
        let timeout = Duration::from_secs(self.settings.close_timeout_secs);
        for (quorum_id, worker) in workers {
            let _ = worker.commands.send(LogCommand::Shutdown);
            let joined = tokio::task::spawn_blocking(move || worker.thread.join());
            match tokio::time::timeout(timeout, joined).await {
                Ok(Ok(Ok(()))) => debug!(quorum_id, "log worker stopped"),
                Ok(_) => warn!(quorum_id, "log worker panicked"),
                Err(_) => {
                    return Err(ReplicatorError::Timeout(format!(
                        "log worker for {quorum_id} did not stop"
                    )))
                }
            }
        }
        Ok(())
    }
}

async fn request<T>(
    commands: &mpsc::UnboundedSender<LogCommand>,
    command: impl FnOnce(oneshot::Sender<Result<T>>) -> LogCommand,
) -> Result<T> {
    let (respond_to, response) = oneshot::channel();
    commands
        .send(command(respond_to))
        .map_err(|_| ReplicatorError::InvalidState("log worker has stopped".into()))?;
    response
        .await
        .map_err(|_| ReplicatorError::Fatal("log worker dropped the request".into()))?
}

fn spawn_worker(base_dir: &Path, quorum_id: &str, settings: LogSettings) -> Result<QuorumWorker> {
    let (commands, inbox) = mpsc::unbounded_channel();
    let base_dir = base_dir.to_path_buf();
    let thread_quorum_id = quorum_id.to_string();
    let thread = thread::Builder::new()
        .name(format!("log-{quorum_id}"))
        .spawn(move || run_worker(&base_dir, &thread_quorum_id, &settings, inbox))?;
    Ok(QuorumWorker {
        commands,
        thread,
        moored: false,
    })
}

fn run_worker(
    base_dir: &Path,
    quorum_id: &str,
    settings: &LogSettings,
    mut inbox: mpsc::UnboundedReceiver<LogCommand>,
) {
    let mut log = match QuorumLog::open(base_dir, quorum_id, settings) {
        Ok(log) => log,
        Err(err) => {
            error!(quorum_id, error = %err, "failed to open quorum log");
            fail_all(inbox, &err);
            return;
        }
    };

    while let Some(command) = inbox.blocking_recv() {
        match command {
            LogCommand::Describe { respond_to } => {
                let _ = respond_to.send(Ok(LogState {
                    last_index: log.last_index(),
                    oracle: log.oracle().clone(),
                }));
            }
            LogCommand::Append {
                entries,
                respond_to,
            } => {
                let _ = respond_to.send(log.append(&entries));
            }
            LogCommand::Entries {
                start,
                end,
                respond_to,
            } => {
                let _ = respond_to.send(log.entries(start, end));
            }
            LogCommand::Truncate {
                seq_num,
                respond_to,
            } => {
                let _ = respond_to.send(log.truncate(seq_num));
            }
            LogCommand::Roll { respond_to } => {
                let _ = respond_to.send(log.roll());
            }
            LogCommand::ClearOldLogs {
                older_than,
                respond_to,
            } => {
                let _ = respond_to.send(log.clear_old_logs(older_than));
            }
            LogCommand::Shutdown => break,
        }
    }
    debug!(quorum_id, "log worker exiting");
}

fn fail_all(mut inbox: mpsc::UnboundedReceiver<LogCommand>, err: &ReplicatorError) {
    let unavailable = || ReplicatorError::Fatal(format!("quorum log unavailable: {err}"));
    while let Some(command) = inbox.blocking_recv() {
        match command {
            LogCommand::Describe { respond_to } => {
                let _ = respond_to.send(Err(unavailable()));
            }
            LogCommand::Append { respond_to, .. }
            | LogCommand::Truncate { respond_to, .. }
            | LogCommand::Roll { respond_to } => {
                let _ = respond_to.send(Err(unavailable()));
            }
            LogCommand::Entries { respond_to, .. } => {
                let _ = respond_to.send(Err(unavailable()));
            }
            LogCommand::ClearOldLogs { respond_to, .. } => {
                let _ = respond_to.send(Err(unavailable()));
            }
            LogCommand::Shutdown => break,
        }
    }
}

/// The [`ReplicatorLog`] of one quorum, backed by that quorum's log files.
pub struct Mooring {
    quorum_id: String,
    commands: mpsc::UnboundedSender<LogCommand>,
    oracle: LogEntryOracle,
    last_index: u64,
}

impl Mooring {
    pub fn quorum_id(&self) -> &str {
        &self.quorum_id
    }

    fn submit<T: Send + 'static>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> LogCommand,
    ) -> LogFuture<T> {
        let (respond_to, response) = oneshot::channel();
        let sent = self.commands.send(command(respond_to)).is_ok();
        async move {
            if !sent {
                return Err(ReplicatorError::Fatal("log worker has stopped".into()));
            }
            response
                .await
                .map_err(|_| ReplicatorError::Fatal("log worker dropped the request".into()))?
        }
        .boxed()
    }
}

impl ReplicatorLog for Mooring {
    fn append(&mut self, entries: Vec<LogEntry>) -> LogFuture<()> {
        if let Err(err) = check_append(self.last_index, &entries) {
            return futures::future::ready(Err(err)).boxed();
        }
        for entry in &entries {
            self.oracle.notify_logging(entry);
        }
        if let Some(last) = entries.last() {
            self.last_index = last.index;
        }
        self.submit(|respond_to| LogCommand::Append {
            entries,
            respond_to,
        })
    }

    fn entries(&self, start: u64, end: u64) -> LogFuture<Vec<LogEntry>> {
        self.submit(|respond_to| LogCommand::Entries {
            start,
            end,
            respond_to,
        })
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 || index > self.last_index {
            return 0;
        }
        self.oracle.term_at_seq_num(index)
    }

    fn last_term(&self) -> u64 {
        self.term_at(self.last_index)
    }

    fn last_index(&self) -> u64 {
        self.last_index
    }

    fn truncate(&mut self, index: u64) -> LogFuture<()> {
        if index == 0 {
            return futures::future::ready(Err(ReplicatorError::InvalidArgument(
                "cannot truncate at index 0".into(),
            )))
            .boxed();
        }
        if index <= self.last_index {
            self.last_index = index - 1;
            self.oracle.notify_truncation(index);
        }
        self.submit(|respond_to| LogCommand::Truncate {
            seq_num: index,
            respond_to,
        })
    }

    fn last_configuration(&self) -> QuorumConfiguration {
        self.oracle.last_configuration().configuration
    }

    fn last_configuration_index(&self) -> u64 {
        self.oracle.last_configuration().seq_num
    }
}

/// Reads client data back out of a quorum's log.
///
/// The reader sees whatever is in the log, committed or not; callers bound
/// their reads by the commit notices they have observed.
#[derive(Clone)]
pub struct LogReader {
    commands: mpsc::UnboundedSender<LogCommand>,
}

impl LogReader {
    /// Data entries with seq numbers in `start..end`; configuration entries are skipped.
    pub async fn data_entries(&self, start: u64, end: u64) -> Result<Vec<ReplicatorEntry>> {
        let entries = request(&self.commands, |respond_to| LogCommand::Entries {
            start,
            end,
            respond_to,
        })
        .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry.payload {
                EntryPayload::Data(data) => Some(ReplicatorEntry {
                    seq_num: entry.index,
                    data,
                }),
                EntryPayload::Configuration(_) => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entries;

    #[tokio::test]
    async fn second_mooring_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let service = LogService::open(dir.path(), LogSettings::default()).unwrap();
        let _mooring = service.mooring("q").await.unwrap();
        assert!(matches!(
            service.mooring("q").await,
            Err(ReplicatorError::InvalidState(_))
        ));
        assert!(service.mooring("other").await.is_ok());
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn reader_skips_configuration_entries() {
        let dir = tempfile::tempdir().unwrap();
        let service = LogService::open(dir.path(), LogSettings::default()).unwrap();
        let mut mooring = service.mooring("q").await.unwrap();
        mooring
            .append(
                entries()
                    .term(1)
                    .configuration_and_index(QuorumConfiguration::of([1]), 1)
                    .indexes(&[2, 3])
                    .build(),
            )
            .await
            .unwrap();

        let read = service.reader("q").unwrap().data_entries(1, 4).await.unwrap();
        assert_eq!(read.iter().map(|e| e.seq_num).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(read[0].data, vec![b"data-2".to_vec()]);
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_quorum_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = LogService::open(dir.path(), LogSettings::default()).unwrap();
        assert!(matches!(
            service.mooring("../escape").await,
            Err(ReplicatorError::InvalidArgument(_))
        ));
    }
}
