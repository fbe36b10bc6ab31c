//! Hosts the replicator instances of one node and carries their RPCs over TCP.
//!
//! # Tasks
//!
//! - **Accept loop**: takes connections from peers and serves each one
//! - **Dispatcher**: drains the instances' shared outgoing channel, numbers
//!   each request, and matches replies back to the requester by message id
//! - **Connections**: one task per TCP stream; requests read from a stream
//!   are answered on the same stream, replies are handed to the dispatcher
//! - **Failure watcher**: forgets instances that report a quorum failure
//!
//! Requests addressed to this node never touch the network. A connection that
//! drops is simply forgotten; the next request to that peer opens a new one,
//! and requests lost with the old connection time out on the requester's side.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::entry::IndexCommitNotice;
use crate::error::{ReplicatorError, Result};
use crate::log::LogService;
use crate::persister::ReplicatorInfoPersistence;
use crate::replicator::{
    OutgoingRequest, OutgoingRpc, Replicator, ReplicatorChannels, ReplicatorInstanceEvent, RpcMessage, RpcRequest,
};
use crate::settings::ReplicatorSettings;
use crate::wire::{read_message, write_message, ReplicationWireMessage};

/// State shared by every task of the service.
struct Shared {
    node_id: u64,
    replicators: Mutex<HashMap<String, Replicator>>,
    replies: mpsc::UnboundedSender<ReplicationWireMessage>,
}

impl Shared {
    async fn replicator(&self, quorum_id: &str) -> Option<Replicator> {
        self.replicators.lock().await.get(quorum_id).cloned()
    }
}

pub struct ReplicatorService {
    node_id: u64,
    local_addr: SocketAddr,
    settings: ReplicatorSettings,
    log_service: Arc<LogService>,
    persister: Arc<dyn ReplicatorInfoPersistence>,
    channels: ReplicatorChannels,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl ReplicatorService {
    /// Starts serving on `listener`. `peer_addrs` maps the node ids this node
    /// may talk to onto their listening addresses.
    pub async fn start(
        settings: ReplicatorSettings,
        node_id: u64,
        listener: TcpListener,
        peer_addrs: HashMap<u64, SocketAddr>,
        log_service: Arc<LogService>,
        persister: Arc<dyn ReplicatorInfoPersistence>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let channels = ReplicatorChannels::new(outgoing);
        let shared = Arc::new(Shared {
            node_id,
            replicators: Mutex::new(HashMap::new()),
            replies,
        });

        tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx.clone()));
        let dispatcher = Dispatcher {
            node_id,
            peer_addrs,
            shared: shared.clone(),
            shutdown: shutdown_rx.clone(),
            connections: HashMap::new(),
            outstanding: HashMap::new(),
            sessions: HashMap::new(),
            next_message_id: 1,
        };
        tokio::spawn(dispatcher.run(outgoing_rx, replies_rx));
        tokio::spawn(watch_failures(channels.events.subscribe(), shared.clone(), shutdown_rx));

        info!(node_id, %local_addr, "replicator service started");
        Ok(Self {
            node_id,
            local_addr,
            settings,
            log_service,
            persister,
            channels,
            shared,
            shutdown,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn log_service(&self) -> &Arc<LogService> {
        &self.log_service
    }

    /// The instance for `quorum_id`, started on first request.
    ///
    /// `peers` seeds the membership of a brand-new quorum and always includes
    /// this node. An instance that already runs is returned unchanged.
    pub async fn create_replicator(&self, quorum_id: &str, peers: impl IntoIterator<Item = u64>) -> Result<Replicator> {
        if *self.shutdown.borrow() {
            return Err(ReplicatorError::InvalidState("replicator service is shut down".into()));
        }
        let mut replicators = self.shared.replicators.lock().await;
        if let Some(existing) = replicators.get(quorum_id) {
            return Ok(existing.clone());
        }

        let mut peers: BTreeSet<u64> = peers.into_iter().collect();
        peers.insert(self.node_id);
        let mooring = self.log_service.mooring(quorum_id).await?;
        let replicator = Replicator::start(
            self.node_id,
            quorum_id,
            peers,
            self.settings.clone(),
            mooring,
            self.persister.clone(),
            self.channels.clone(),
        )
        .await?;
        info!(node_id = self.node_id, quorum_id, "created replicator");
        replicators.insert(quorum_id.to_string(), replicator.clone());
        Ok(replicator)
    }

    pub async fn replicator(&self, quorum_id: &str) -> Option<Replicator> {
        self.shared.replicator(quorum_id).await
    }

    pub async fn quorum_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.replicators.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Commit notices of every instance on this node.
    pub fn subscribe_commit_notices(&self) -> broadcast::Receiver<IndexCommitNotice> {
        self.channels.commit_notices.subscribe()
    }

    /// Events of every instance on this node.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ReplicatorInstanceEvent> {
        self.channels.events.subscribe()
    }

    /// Stops the instances and the network tasks. The log service stays open.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let replicators: Vec<Replicator> = self.shared.replicators.lock().await.drain().map(|(_, r)| r).collect();
        for replicator in replicators {
            replicator.shutdown();
        }
        info!(node_id = self.node_id, "replicator service stopped");
    }
}

struct Outstanding {
    session: u64,
    reply_to: oneshot::Sender<RpcMessage>,
}

/// Owns the bookkeeping of requests that left this node.
struct Dispatcher {
    node_id: u64,
    peer_addrs: HashMap<u64, SocketAddr>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    connections: HashMap<u64, mpsc::UnboundedSender<ReplicationWireMessage>>,
    outstanding: HashMap<u64, Outstanding>,
    sessions: HashMap<u64, u64>,
    next_message_id: u64,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut outgoing: mpsc::UnboundedReceiver<OutgoingRpc>,
        mut replies: mpsc::UnboundedReceiver<ReplicationWireMessage>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                rpc = outgoing.recv() => match rpc {
                    Some(OutgoingRpc::Request(request)) => self.send(request),
                    Some(OutgoingRpc::Cancel { session }) => self.cancel(session),
                    None => break,
                },
                Some(reply) = replies.recv() => self.complete(reply),
                _ = shutdown.changed() => break,
            }
        }
        debug!(node_id = self.node_id, outstanding = self.outstanding.len(), "dispatcher stopped");
    }

    fn send(&mut self, outgoing: OutgoingRequest) {
        let OutgoingRequest {
            session,
            request,
            reply_to,
        } = outgoing;
        if request.to == self.node_id {
            tokio::spawn(loopback(self.shared.clone(), request, reply_to));
            return;
        }

        let message_id = self.next_message_id;
        self.next_message_id += 1;
        let peer = request.to;
        let message = ReplicationWireMessage {
            message_id,
            sender_id: self.node_id,
            receiver_id: peer,
            quorum_id: request.quorum_id,
            in_reply: false,
            body: request.message,
        };
        let Some(connection) = self.connection(peer) else {
            warn!(node_id = self.node_id, peer, "no address for peer, dropping request");
            return;
        };
        if connection.send(message).is_err() {
            debug!(node_id = self.node_id, peer, "connection closed before send");
            self.connections.remove(&peer);
            return;
        }
        self.outstanding.insert(message_id, Outstanding { session, reply_to });
        self.sessions.insert(session, message_id);
    }

    /// The live connection to `peer`, opening a new one if there is none.
    fn connection(&mut self, peer: u64) -> Option<mpsc::UnboundedSender<ReplicationWireMessage>> {
        if let Some(existing) = self.connections.get(&peer) {
            if !existing.is_closed() {
                return Some(existing.clone());
            }
        }
        let addr = *self.peer_addrs.get(&peer)?;
        let (sender, outbound) = mpsc::unbounded_channel();
        tokio::spawn(connect(
            addr,
            sender.clone(),
            outbound,
            self.shared.clone(),
            self.shutdown.clone(),
        ));
        self.connections.insert(peer, sender.clone());
        Some(sender)
    }

    fn cancel(&mut self, session: u64) {
        if let Some(message_id) = self.sessions.remove(&session) {
            self.outstanding.remove(&message_id);
        }
    }

    fn complete(&mut self, reply: ReplicationWireMessage) {
        let Some(Outstanding { session, reply_to }) = self.outstanding.remove(&reply.message_id) else {
            debug!(node_id = self.node_id, message_id = reply.message_id, "reply for unknown request");
            return;
        };
        self.sessions.remove(&session);
        let _ = reply_to.send(reply.body);
    }
}

async fn loopback(shared: Arc<Shared>, request: RpcRequest, reply_to: oneshot::Sender<RpcMessage>) {
    let Some(replicator) = shared.replicator(&request.quorum_id).await else {
        return;
    };
    if let Ok(reply) = replicator.deliver(request).await {
        let _ = reply_to.send(reply);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(node_id = shared.node_id, %addr, "accepted connection");
                    let (sender, outbound) = mpsc::unbounded_channel();
                    tokio::spawn(serve(stream, sender, outbound, shared.clone(), shutdown.clone()));
                }
                Err(err) => warn!(node_id = shared.node_id, error = %err, "accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn connect(
    addr: SocketAddr,
    sender: mpsc::UnboundedSender<ReplicationWireMessage>,
    outbound: mpsc::UnboundedReceiver<ReplicationWireMessage>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) {
    match TcpStream::connect(addr).await {
        Ok(stream) => serve(stream, sender, outbound, shared, shutdown).await,
        Err(err) => warn!(node_id = shared.node_id, %addr, error = %err, "could not connect to peer"),
    }
}

/// Writes `outbound` to the stream while a reader task routes what arrives.
/// Ends when either direction fails or the service shuts down.
async fn serve(
    stream: TcpStream,
    sender: mpsc::UnboundedSender<ReplicationWireMessage>,
    mut outbound: mpsc::UnboundedReceiver<ReplicationWireMessage>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut read_half = BufReader::new(read_half);
    let node_id = shared.node_id;

    let mut reader = tokio::spawn(async move {
        loop {
            match read_message(&mut read_half).await {
                Ok(Some(message)) => route(message, &sender, &shared).await,
                Ok(None) => break,
                Err(err) => {
                    debug!(node_id = shared.node_id, error = %err, "connection read failed");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(err) = write_message(&mut write_half, &message).await {
                    warn!(node_id, peer = message.receiver_id, error = %err, "connection write failed");
                    break;
                }
            }
            _ = &mut reader => break,
            _ = shutdown.changed() => break,
        }
    }
    reader.abort();
}

/// Handles one message read from a connection.
async fn route(message: ReplicationWireMessage, writer: &mpsc::UnboundedSender<ReplicationWireMessage>, shared: &Shared) {
    if message.receiver_id != shared.node_id {
        warn!(
            node_id = shared.node_id,
            receiver_id = message.receiver_id,
            "dropping message addressed to another node"
        );
        return;
    }
    if message.in_reply {
        let _ = shared.replies.send(message);
        return;
    }
    let Some(replicator) = shared.replicator(&message.quorum_id).await else {
        debug!(node_id = shared.node_id, quorum_id = %message.quorum_id, "no replicator for quorum");
        return;
    };

    let ReplicationWireMessage {
        message_id,
        sender_id,
        receiver_id,
        quorum_id,
        body,
        ..
    } = message;
    let request = RpcRequest {
        from: sender_id,
        to: receiver_id,
        quorum_id: quorum_id.clone(),
        message: body,
    };
    // queue in arrival order, answer whenever the instance gets to it
    let reply = match replicator.enqueue_rpc(request).await {
        Ok(reply) => reply,
        Err(err) => {
            debug!(node_id = shared.node_id, quorum_id = %quorum_id, error = %err, "could not deliver request");
            return;
        }
    };
    let writer = writer.clone();
    tokio::spawn(async move {
        if let Ok(body) = reply.await {
            let _ = writer.send(ReplicationWireMessage {
                message_id,
                sender_id: receiver_id,
                receiver_id: sender_id,
                quorum_id,
                in_reply: true,
                body,
            });
        }
    });
}

async fn watch_failures(
    mut events: broadcast::Receiver<ReplicatorInstanceEvent>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        match event {
            Ok(ReplicatorInstanceEvent::QuorumFailure {
                node_id,
                quorum_id,
                error,
            }) if node_id == shared.node_id => {
                warn!(node_id, quorum_id = %quorum_id, error = %error, "removing failed replicator");
                shared.replicators.lock().await.remove(&quorum_id);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(node_id = shared.node_id, skipped, "replicator events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
