//! The consensus state machine of one node in one quorum.
//!
//! # Execution
//!
//! An instance runs as a single tokio task that exclusively owns its state and
//! its log. Everything reaches it through the inbox: client writes, incoming
//! RPCs, and the replies to its own RPCs (which are awaited in helper tasks and
//! posted back). Handlers run one at a time and await log I/O inline, so no
//! two handlers ever observe a half-applied change.
//!
//! # Timers
//!
//! - every `election_check_interval` a follower or candidate checks whether
//!   its randomized election deadline has passed
//! - every `leader_log_interval` a leader sends AppendEntries to each peer
//!   without a request in flight (heartbeat when there is nothing new)
//!
//! # Failure
//!
//! A failed term/vote write or log write is fatal: the instance publishes
//! [`ReplicatorInstanceEvent::QuorumFailure`], marks itself failed and stops.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::entry::{IndexCommitNotice, LogEntry, ReplicatorReceipt};
use crate::error::{ReplicatorError, Result};
use crate::log::ReplicatorLog;
use crate::persister::ReplicatorInfoPersistence;
use crate::quorum::QuorumConfiguration;
use crate::replicator::handle::{Command, ReplicatorInstanceEvent, ReplicatorStatus, Role};
use crate::replicator::rpc::{
    next_session, AppendEntries, AppendEntriesReply, OutgoingRequest, OutgoingRpc, RequestVote,
    RequestVoteReply, RpcMessage, RpcRequest,
};
use crate::settings::ReplicatorSettings;

/// Leader-side replication cursor for one peer.
#[derive(Debug, Clone, Copy)]
struct PeerProgress {
    next_index: u64,
    match_index: u64,
    in_flight: bool,
}

pub(crate) struct InstanceChannels {
    pub inbox: mpsc::Receiver<Command>,
    pub inbox_handle: mpsc::WeakSender<Command>,
    pub outgoing: mpsc::UnboundedSender<OutgoingRpc>,
    pub commit_notices: broadcast::Sender<IndexCommitNotice>,
    pub events: broadcast::Sender<ReplicatorInstanceEvent>,
    pub status: watch::Sender<ReplicatorStatus>,
}

pub(crate) struct ReplicatorInstance<L> {
    node_id: u64,
    quorum_id: String,
    settings: ReplicatorSettings,
    log: L,
    persister: Arc<dyn ReplicatorInfoPersistence>,
    channels: InstanceChannels,

    current_term: u64,
    voted_for: u64,
    last_committed_index: u64,
    durable_index: u64,
    role: Role,
    leader_id: u64,
    quorum_config: QuorumConfiguration,
    quorum_config_index: u64,
    election_deadline: Instant,
    last_leader_contact: Option<Instant>,

    votes: BTreeSet<u64>,
    peers: HashMap<u64, PeerProgress>,
}

impl<L: ReplicatorLog> ReplicatorInstance<L> {
    /// Loads persisted term and vote, and bootstraps an empty log with the
    /// initial configuration.
    pub(crate) async fn new(
        node_id: u64,
        quorum_id: String,
        initial_peers: BTreeSet<u64>,
        settings: ReplicatorSettings,
        mut log: L,
        persister: Arc<dyn ReplicatorInfoPersistence>,
        channels: InstanceChannels,
    ) -> Result<Self> {
        let mut current_term = persister.read_current_term(&quorum_id)?;
        let voted_for = persister.read_voted_for(&quorum_id)?;

        if log.last_index() == 0 && !initial_peers.is_empty() {
            let config = QuorumConfiguration::of(initial_peers);
            info!(node_id, quorum_id = %quorum_id, %config, "bootstrapping quorum");
            log.append(vec![LogEntry::configuration(1, 1, config)]).await?;
            if current_term < 1 {
                current_term = 1;
                persister.write_current_term_and_voted_for(&quorum_id, current_term, 0)?;
            }
        }

        let quorum_config = log.last_configuration();
        let quorum_config_index = log.last_configuration_index();
        let durable_index = log.last_index();
        let mut instance = Self {
            node_id,
            quorum_id,
            settings,
            log,
            persister,
            channels,
            current_term,
            voted_for,
            last_committed_index: 0,
            durable_index,
            role: Role::Follower,
            leader_id: 0,
            quorum_config,
            quorum_config_index,
            election_deadline: Instant::now(),
            last_leader_contact: None,
            votes: BTreeSet::new(),
            peers: HashMap::new(),
        };
        instance.reset_election_deadline();
        instance.publish_status();
        Ok(instance)
    }

    pub(crate) async fn run(mut self) {
        info!(
            node_id = self.node_id,
            quorum_id = %self.quorum_id,
            term = self.current_term,
            last_index = self.log.last_index(),
            "replicator started"
        );
        self.publish_event(ReplicatorInstanceEvent::QuorumStart {
            node_id: self.node_id,
            quorum_id: self.quorum_id.clone(),
        });

        let mut election_tick = time::interval(self.settings.election_check_interval);
        election_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut leader_tick = time::interval(self.settings.leader_log_interval);
        leader_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                command = self.channels.inbox.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = election_tick.tick() => self.check_election_timeout(),
                _ = leader_tick.tick(), if self.role == Role::Leader => {
                    self.replicate_to_peers();
                    Ok(())
                }
            };
            if let Err(err) = outcome {
                self.fail(err);
                return;
            }
        }
        info!(node_id = self.node_id, quorum_id = %self.quorum_id, "replicator stopped");
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::LogData { data, respond_to } => {
                self.log_data(data, respond_to);
                Ok(())
            }
            Command::ChangeQuorum { peers, respond_to } => {
                self.change_quorum(peers, respond_to);
                Ok(())
            }
            Command::Rpc {
                request,
                respond_to,
            } => {
                if let Some(reply) = self.handle_rpc(request).await? {
                    let _ = respond_to.send(reply);
                }
                Ok(())
            }
            Command::AppendReply {
                peer,
                sent_term,
                prev_log_index,
                count,
                reply,
            } => self.handle_append_reply(peer, sent_term, prev_log_index, count, reply),
            Command::VoteReply {
                peer,
                sent_term,
                reply,
            } => self.handle_vote_reply(peer, sent_term, reply),
            Command::LocalAppendComplete { index } => {
                self.durable_index = self.durable_index.max(index);
                if self.role == Role::Leader {
                    self.advance_commit_index()?;
                }
                Ok(())
            }
            Command::CommittedTerm { seq_num, respond_to } => {
                let committed = seq_num <= self.last_committed_index && seq_num <= self.log.last_index();
                let _ = respond_to.send(committed.then(|| self.log.term_at(seq_num)));
                Ok(())
            }
            Command::Fail(err) => Err(err),
            Command::Shutdown => Ok(()),
        }
    }

    /// Answers a peer's request. Replies delivered as requests are dropped.
    async fn handle_rpc(&mut self, request: RpcRequest) -> Result<Option<RpcMessage>> {
        match request.message {
            RpcMessage::RequestVote(vote) => {
                let reply = self.handle_request_vote(vote)?;
                Ok(Some(RpcMessage::RequestVoteReply(reply)))
            }
            RpcMessage::AppendEntries(append) => {
                let reply = self.handle_append_entries(append).await?;
                Ok(Some(RpcMessage::AppendEntriesReply(reply)))
            }
            other => {
                warn!(node_id = self.node_id, from = request.from, message = ?other, "dropping reply sent as a request");
                Ok(None)
            }
        }
    }

    // ---- election ----

    fn reset_election_deadline(&mut self) {
        let base = self.settings.election_timeout.as_millis().max(1) as u64;
        let jitter = rand::thread_rng().gen_range(base..=base * 2);
        self.election_deadline = Instant::now() + Duration::from_millis(jitter);
    }

    fn check_election_timeout(&mut self) -> Result<()> {
        if matches!(self.role, Role::Leader | Role::Failed) || Instant::now() < self.election_deadline {
            return Ok(());
        }
        if !self.quorum_config.contains(self.node_id) {
            self.reset_election_deadline();
            return Ok(());
        }
        self.start_election()
    }

    fn start_election(&mut self) -> Result<()> {
        self.current_term += 1;
        self.voted_for = self.node_id;
        self.persist()?;
        self.role = Role::Candidate;
        self.leader_id = 0;
        self.votes = BTreeSet::from([self.node_id]);
        self.reset_election_deadline();

        info!(node_id = self.node_id, quorum_id = %self.quorum_id, term = self.current_term, "starting election");
        self.publish_event(ReplicatorInstanceEvent::ElectionTimeout {
            node_id: self.node_id,
            quorum_id: self.quorum_id.clone(),
            term: self.current_term,
        });
        self.publish_status();

        if self.quorum_config.set_contains_majority(&self.votes) {
            return self.become_leader();
        }

        let request = RequestVote {
            term: self.current_term,
            candidate_id: self.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.other_peers() {
            self.send_vote_request(peer, request.clone());
        }
        Ok(())
    }

    /// Whether a leader is known to be alive, in which case vote requests are
    /// ignored rather than allowed to bump the term.
    fn leader_is_fresh(&self) -> bool {
        match self.role {
            Role::Leader => true,
            Role::Follower => self
                .last_leader_contact
                .is_some_and(|contact| contact.elapsed() < self.settings.election_timeout),
            Role::Candidate | Role::Failed => false,
        }
    }

    fn handle_request_vote(&mut self, request: RequestVote) -> Result<RequestVoteReply> {
        if request.term < self.current_term || (request.term > self.current_term && self.leader_is_fresh()) {
            debug!(node_id = self.node_id, candidate = request.candidate_id, term = request.term, "rejecting stale vote request");
            return Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            });
        }
        if request.term > self.current_term {
            self.step_down(request.term)?;
        }

        let candidate_log = (request.last_log_term, request.last_log_index);
        let our_log = (self.log.last_term(), self.log.last_index());
        let free_to_vote = self.voted_for == 0 || self.voted_for == request.candidate_id;
        let vote_granted = free_to_vote && candidate_log >= our_log;
        if vote_granted {
            self.voted_for = request.candidate_id;
            self.persist()?;
            self.reset_election_deadline();
        }
        debug!(
            node_id = self.node_id,
            candidate = request.candidate_id,
            term = self.current_term,
            vote_granted,
            "answered vote request"
        );
        Ok(RequestVoteReply {
            term: self.current_term,
            vote_granted,
        })
    }

    fn handle_vote_reply(&mut self, peer: u64, sent_term: u64, reply: Option<RequestVoteReply>) -> Result<()> {
        let Some(reply) = reply else {
            return Ok(());
        };
        if reply.term > self.current_term {
            return self.step_down(reply.term);
        }
        if self.role != Role::Candidate || sent_term != self.current_term || !reply.vote_granted {
            return Ok(());
        }
        self.votes.insert(peer);
        if self.quorum_config.set_contains_majority(&self.votes) {
            self.become_leader()?;
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        self.role = Role::Leader;
        self.leader_id = self.node_id;
        self.durable_index = self.durable_index.min(self.log.last_index());
        self.peers.clear();
        self.track_peers();

        info!(node_id = self.node_id, quorum_id = %self.quorum_id, term = self.current_term, "elected leader");
        self.publish_event(ReplicatorInstanceEvent::LeaderElected {
            node_id: self.node_id,
            quorum_id: self.quorum_id.clone(),
            term: self.current_term,
            leader_id: self.node_id,
        });
        self.publish_status();

        self.advance_commit_index()?;
        self.replicate_to_peers();
        Ok(())
    }

    /// Adopts a newer term as a follower, clearing the vote.
    fn step_down(&mut self, term: u64) -> Result<()> {
        self.current_term = term;
        self.voted_for = 0;
        self.persist()?;
        self.become_follower(0);
        Ok(())
    }

    fn become_follower(&mut self, leader_id: u64) {
        let was_leader = self.role == Role::Leader;
        self.role = Role::Follower;
        self.leader_id = leader_id;
        self.votes.clear();
        self.peers.clear();
        self.reset_election_deadline();
        if was_leader {
            info!(node_id = self.node_id, quorum_id = %self.quorum_id, term = self.current_term, "leader deposed");
            self.publish_event(ReplicatorInstanceEvent::LeaderDeposed {
                node_id: self.node_id,
                quorum_id: self.quorum_id.clone(),
                term: self.current_term,
            });
        }
        self.publish_status();
    }

    // ---- follower ----

    async fn handle_append_entries(&mut self, request: AppendEntries) -> Result<AppendEntriesReply> {
        if request.term < self.current_term {
            return Ok(self.append_reply(false, self.log.last_index() + 1));
        }
        if request.term > self.current_term {
            self.current_term = request.term;
            self.voted_for = 0;
            self.persist()?;
        }
        if self.role != Role::Follower || self.leader_id != request.leader_id {
            self.become_follower(request.leader_id);
        } else {
            self.reset_election_deadline();
        }
        self.last_leader_contact = Some(Instant::now());

        let last_index = self.log.last_index();
        if request.prev_log_index > last_index {
            return Ok(self.append_reply(false, last_index + 1));
        }
        if request.prev_log_index > 0 && self.log.term_at(request.prev_log_index) != request.prev_log_term {
            debug!(
                node_id = self.node_id,
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                "log mismatch at prev index"
            );
            return Ok(self.append_reply(false, (last_index + 1).min(request.prev_log_index)));
        }

        let mut new_entries = Vec::with_capacity(request.entries.len());
        for entry in request.entries {
            if !new_entries.is_empty() || entry.index > self.log.last_index() {
                new_entries.push(entry);
                continue;
            }
            if self.log.term_at(entry.index) != entry.term {
                if entry.index <= self.last_committed_index {
                    return Err(ReplicatorError::Fatal(format!(
                        "leader {} conflicts with committed entry {}",
                        request.leader_id, entry.index
                    )));
                }
                debug!(node_id = self.node_id, from = entry.index, "truncating conflicting suffix");
                self.log.truncate(entry.index).await?;
                new_entries.push(entry);
            }
        }
        if !new_entries.is_empty() {
            self.log.append(new_entries).await?;
        }
        self.durable_index = self.log.last_index();
        self.refresh_configuration();

        let new_commit = request.commit_index.min(self.log.last_index());
        if new_commit > self.last_committed_index {
            self.commit_through(new_commit);
        } else {
            self.publish_status();
        }
        Ok(self.append_reply(true, self.log.last_index() + 1))
    }

    fn append_reply(&self, success: bool, next_log_index: u64) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term,
            success,
            next_log_index,
        }
    }

    fn refresh_configuration(&mut self) {
        let index = self.log.last_configuration_index();
        if index != self.quorum_config_index {
            self.quorum_config = self.log.last_configuration();
            self.quorum_config_index = index;
            info!(node_id = self.node_id, quorum_id = %self.quorum_id, config = %self.quorum_config, "configuration changed");
        }
    }

    // ---- commit ----

    /// Marks everything up to `index` committed, one notice per run of equal terms.
    fn commit_through(&mut self, index: u64) {
        let mut first = self.last_committed_index + 1;
        while first <= index {
            let term = self.log.term_at(first);
            let mut last = first;
            while last < index && self.log.term_at(last + 1) == term {
                last += 1;
            }
            let notice = IndexCommitNotice {
                node_id: self.node_id,
                quorum_id: self.quorum_id.clone(),
                first_index: first,
                last_index: last,
                term,
            };
            debug!(node_id = self.node_id, first, last, term, "committed");
            let _ = self.channels.commit_notices.send(notice);
            first = last + 1;
        }
        self.last_committed_index = index;
        self.publish_status();
    }

    fn advance_commit_index(&mut self) -> Result<()> {
        let mut acked: HashMap<u64, u64> = self
            .peers
            .iter()
            .map(|(&peer, progress)| (peer, progress.match_index))
            .collect();
        acked.insert(self.node_id, self.durable_index);

        // never ahead of our own disk, so receipts resolve before their notices
        let majority_index = self
            .quorum_config
            .calculate_committed_index(&acked)
            .min(self.durable_index);
        if majority_index <= self.last_committed_index || self.log.term_at(majority_index) != self.current_term {
            return Ok(());
        }
        self.commit_through(majority_index);
        self.after_commit()
    }

    /// Moves configuration changes forward once the entry that began them commits.
    fn after_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader || self.quorum_config_index > self.last_committed_index {
            return Ok(());
        }
        if self.quorum_config.is_transitional() {
            let completed = self.quorum_config.completed_configuration();
            info!(node_id = self.node_id, quorum_id = %self.quorum_id, config = %completed, "completing configuration change");
            self.append_as_leader(LogEntryKind::Configuration(completed), None);
        } else if !self.quorum_config.contains(self.node_id) {
            info!(node_id = self.node_id, quorum_id = %self.quorum_id, "no longer a member, stepping down");
            self.become_follower(0);
        }
        Ok(())
    }

    // ---- leader ----

    fn log_data(&mut self, data: Vec<Vec<u8>>, respond_to: oneshot::Sender<Result<ReplicatorReceipt>>) {
        if self.role != Role::Leader {
            let _ = respond_to.send(Err(self.not_leader()));
            return;
        }
        self.append_as_leader(LogEntryKind::Data(data), Some(respond_to));
    }

    fn change_quorum(&mut self, peers: BTreeSet<u64>, respond_to: oneshot::Sender<Result<ReplicatorReceipt>>) {
        if self.role != Role::Leader {
            let _ = respond_to.send(Err(self.not_leader()));
            return;
        }
        if self.quorum_config.is_transitional() {
            let _ = respond_to.send(Err(ReplicatorError::InvalidState(
                "a configuration change is already in progress".into(),
            )));
            return;
        }
        let transitional = self.quorum_config.transitional_configuration(peers);
        info!(node_id = self.node_id, quorum_id = %self.quorum_id, config = %transitional, "changing quorum");
        self.append_as_leader(LogEntryKind::Configuration(transitional), Some(respond_to));
    }

    fn not_leader(&self) -> ReplicatorError {
        ReplicatorError::InvalidState(format!(
            "node {} is {} for quorum {}, leader is {}",
            self.node_id, self.role, self.quorum_id, self.leader_id
        ))
    }

    /// Appends at the next index in the current term. The receipt resolves
    /// once the write is durable; a failed write takes the instance down.
    fn append_as_leader(
        &mut self,
        kind: LogEntryKind,
        respond_to: Option<oneshot::Sender<Result<ReplicatorReceipt>>>,
    ) {
        let index = self.log.last_index() + 1;
        let term = self.current_term;
        let entry = match kind {
            LogEntryKind::Data(data) => LogEntry::data(term, index, data),
            LogEntryKind::Configuration(config) => LogEntry::configuration(term, index, config),
        };
        let written = self.log.append(vec![entry]);
        self.refresh_configuration();
        self.track_peers();
        self.publish_status();

        let inbox = self.channels.inbox_handle.clone();
        tokio::spawn(async move {
            let outcome = written.await;
            let followup = match outcome {
                Ok(()) => {
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(Ok(ReplicatorReceipt { term, seq_num: index }));
                    }
                    Command::LocalAppendComplete { index }
                }
                Err(err) => {
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(Err(err.duplicate()));
                    }
                    Command::Fail(err)
                }
            };
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(followup).await;
            }
        });
    }

    /// Makes sure every peer of the current configuration has a cursor.
    fn track_peers(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let next_index = self.log.last_index() + 1;
        for peer in self.other_peers() {
            self.peers.entry(peer).or_insert(PeerProgress {
                next_index,
                match_index: 0,
                in_flight: false,
            });
        }
    }

    fn replicate_to_peers(&mut self) {
        for peer in self.other_peers() {
            self.replicate_to_peer(peer);
        }
    }

    fn replicate_to_peer(&mut self, peer: u64) {
        let last_index = self.log.last_index();
        let Some(progress) = self.peers.get_mut(&peer) else {
            return;
        };
        if progress.in_flight {
            return;
        }
        progress.in_flight = true;
        let next_index = progress.next_index.clamp(1, last_index + 1);
        progress.next_index = next_index;

        let prev_log_index = next_index - 1;
        let end = (last_index + 1).min(next_index + self.settings.max_entries_per_append);
        let header = AppendEntries {
            term: self.current_term,
            leader_id: self.node_id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index),
            entries: Vec::new(),
            commit_index: self.last_committed_index,
        };
        let entries = self.log.entries(next_index, end);
        self.send_append_request(peer, header, entries);
    }

    fn handle_append_reply(
        &mut self,
        peer: u64,
        sent_term: u64,
        prev_log_index: u64,
        count: u64,
        reply: Option<AppendEntriesReply>,
    ) -> Result<()> {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.in_flight = false;
        }
        let Some(reply) = reply else {
            return Ok(());
        };
        if reply.term > self.current_term {
            return self.step_down(reply.term);
        }
        if self.role != Role::Leader || sent_term != self.current_term {
            return Ok(());
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.peers.get_mut(&peer) else {
            return Ok(());
        };

        if reply.success {
            let matched = prev_log_index + count;
            progress.match_index = progress.match_index.max(matched);
            progress.next_index = progress.match_index + 1;
            let caught_up = progress.next_index > last_index;
            self.advance_commit_index()?;
            if !caught_up {
                self.replicate_to_peer(peer);
            }
        } else {
            progress.next_index = reply.next_log_index.clamp(1, last_index + 1);
            debug!(node_id = self.node_id, peer, next_index = progress.next_index, "peer rejected append, backing off");
            self.replicate_to_peer(peer);
        }
        Ok(())
    }

    // ---- transport ----

    fn send_vote_request(&self, peer: u64, request: RequestVote) {
        let sent_term = request.term;
        self.send_request(
            peer,
            futures::future::ready(Ok(RpcMessage::RequestVote(request))),
            move |_, reply| Command::VoteReply {
                peer,
                sent_term,
                reply: match reply {
                    Some(RpcMessage::RequestVoteReply(reply)) => Some(reply),
                    _ => None,
                },
            },
        );
    }

    fn send_append_request(
        &self,
        peer: u64,
        header: AppendEntries,
        entries: BoxFuture<'static, Result<Vec<LogEntry>>>,
    ) {
        let sent_term = header.term;
        let prev_log_index = header.prev_log_index;
        let max_bytes = self.settings.max_append_bytes;
        let message = async move {
            let entries = fit_to_budget(entries.await?, max_bytes);
            Ok(RpcMessage::AppendEntries(AppendEntries { entries, ..header }))
        };
        self.send_request(peer, message, move |count, reply| Command::AppendReply {
            peer,
            sent_term,
            prev_log_index,
            count,
            reply: match reply {
                Some(RpcMessage::AppendEntriesReply(reply)) => Some(reply),
                _ => None,
            },
        });
    }

    /// Builds `message`, hands it to the transport, and posts `on_reply` back to
    /// the inbox with the number of entries sent and the reply, which is `None`
    /// on timeout or failure.
    fn send_request<M, F>(&self, peer: u64, message: M, on_reply: F)
    where
        M: Future<Output = Result<RpcMessage>> + Send + 'static,
        F: FnOnce(u64, Option<RpcMessage>) -> Command + Send + 'static,
    {
        let from = self.node_id;
        let quorum_id = self.quorum_id.clone();
        let outgoing = self.channels.outgoing.clone();
        let inbox = self.channels.inbox_handle.clone();
        let rpc_timeout = self.settings.rpc_timeout;

        tokio::spawn(async move {
            let (count, reply) = match message.await {
                Ok(message) => {
                    let count = match &message {
                        RpcMessage::AppendEntries(append) => append.entries.len() as u64,
                        _ => 0,
                    };
                    let session = next_session();
                    let (reply_to, reply) = oneshot::channel();
                    let request = OutgoingRequest {
                        session,
                        request: RpcRequest {
                            from,
                            to: peer,
                            quorum_id,
                            message,
                        },
                        reply_to,
                    };
                    if outgoing.send(OutgoingRpc::Request(request)).is_err() {
                        (count, None)
                    } else {
                        match time::timeout(rpc_timeout, reply).await {
                            Ok(Ok(reply)) => (count, Some(reply)),
                            Ok(Err(_)) => (count, None),
                            Err(_) => {
                                let _ = outgoing.send(OutgoingRpc::Cancel { session });
                                (count, None)
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(node_id = from, peer, error = %err, "could not build request");
                    (0, None)
                }
            };
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(on_reply(count, reply)).await;
            }
        });
    }

    // ---- bookkeeping ----

    fn other_peers(&self) -> Vec<u64> {
        self.quorum_config
            .all_peers()
            .into_iter()
            .filter(|&peer| peer != self.node_id)
            .collect()
    }

    fn persist(&self) -> Result<()> {
        self.persister
            .write_current_term_and_voted_for(&self.quorum_id, self.current_term, self.voted_for)
            .map_err(|err| ReplicatorError::Fatal(format!("persisting term and vote: {err}")))
    }

    fn publish_event(&self, event: ReplicatorInstanceEvent) {
        let _ = self.channels.events.send(event);
    }

    fn publish_status(&self) {
        let status = ReplicatorStatus {
            node_id: self.node_id,
            quorum_id: self.quorum_id.clone(),
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id,
            last_index: self.log.last_index(),
            commit_index: self.last_committed_index,
            configuration: self.quorum_config.clone(),
        };
        self.channels.status.send_replace(status);
    }

    fn fail(&mut self, err: ReplicatorError) {
        error!(node_id = self.node_id, quorum_id = %self.quorum_id, error = %err, "replicator failed");
        self.role = Role::Failed;
        self.publish_status();
        self.publish_event(ReplicatorInstanceEvent::QuorumFailure {
            node_id: self.node_id,
            quorum_id: self.quorum_id.clone(),
            error: err.to_string(),
        });
    }
}

enum LogEntryKind {
    Data(Vec<Vec<u8>>),
    Configuration(QuorumConfiguration),
}

/// Keeps the longest prefix of `entries` whose encoded size stays within
/// `max_bytes`. The first entry is kept whatever its size.
pub(crate) fn fit_to_budget(mut entries: Vec<LogEntry>, max_bytes: u64) -> Vec<LogEntry> {
    let mut total = 0u64;
    let mut keep = 0;
    for entry in &entries {
        total = total.saturating_add(bincode::serialized_size(entry).unwrap_or(u64::MAX));
        if keep > 0 && total > max_bytes {
            break;
        }
        keep += 1;
    }
    entries.truncate(keep);
    entries
}
