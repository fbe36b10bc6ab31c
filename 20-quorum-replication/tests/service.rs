//! Replicator services talking over real TCP connections on localhost.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use quorum_replication::generalized::GeneralizedReplicator;
use quorum_replication::log::LogService;
use quorum_replication::persister::{FilePersister, MemoryPersister};
use quorum_replication::quorum::QuorumConfiguration;
use quorum_replication::replicator::{Replicator, ReplicatorInstanceEvent, RequestVote, Role, RpcMessage};
use quorum_replication::service::ReplicatorService;
use quorum_replication::settings::{LogSettings, ReplicatorSettings};
use quorum_replication::wire::{read_message, write_message, ReplicationWireMessage};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(10);

struct Node {
    service: ReplicatorService,
    _dir: TempDir,
}

async fn start_nodes(ids: &[u64]) -> Result<Vec<Node>> {
    let mut listeners = Vec::new();
    let mut addrs: HashMap<u64, SocketAddr> = HashMap::new();
    for &id in ids {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        addrs.insert(id, listener.local_addr()?);
        listeners.push((id, listener));
    }

    let mut nodes = Vec::new();
    for (id, listener) in listeners {
        let dir = tempfile::tempdir()?;
        let log_service = LogService::open(dir.path(), LogSettings::default())?;
        let service = ReplicatorService::start(
            ReplicatorSettings::fast(),
            id,
            listener,
            addrs.clone(),
            log_service,
            Arc::new(FilePersister::new(dir.path())),
        )
        .await?;
        nodes.push(Node { service, _dir: dir });
    }
    Ok(nodes)
}

async fn wait_for_leader(replicators: &[Replicator]) -> Result<Replicator> {
    let start = Instant::now();
    loop {
        let leaders: Vec<&Replicator> = replicators.iter().filter(|r| r.is_leader()).collect();
        if let [leader] = leaders[..] {
            return Ok(leader.clone());
        }
        if start.elapsed() > WAIT {
            bail!("no single leader elected");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn three_services_replicate_over_tcp() -> Result<()> {
    let nodes = start_nodes(&[1, 2, 3]).await?;
    let mut replicators = Vec::new();
    for node in &nodes {
        replicators.push(node.service.create_replicator("tcp", [1, 2, 3]).await?);
    }
    let leader = wait_for_leader(&replicators).await?;
    let writer = GeneralizedReplicator::new(leader.clone());

    let mut last = 0;
    for value in 0..5u8 {
        last = tokio::time::timeout(WAIT, writer.replicate(vec![vec![value]])?).await??;
    }

    for node in &nodes {
        let replicator = node.service.replicator("tcp").await.expect("replicator exists");
        tokio::time::timeout(WAIT, replicator.wait_for_status(|status| status.commit_index >= last)).await??;
        let data = node.service.log_service().reader("tcp")?.data_entries(1, last + 1).await?;
        let values: Vec<Vec<u8>> = data.into_iter().flat_map(|entry| entry.data).collect();
        assert_eq!(values, (0..5u8).map(|value| vec![value]).collect::<Vec<_>>());
    }

    for node in &nodes {
        node.service.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn creating_a_replicator_twice_returns_the_same_instance() -> Result<()> {
    let nodes = start_nodes(&[1]).await?;
    let service = &nodes[0].service;

    // self is added to the membership
    let first = service.create_replicator("solo", []).await?;
    assert_eq!(first.status().configuration, QuorumConfiguration::of([1]));
    let second = service.create_replicator("solo", [1, 2, 3]).await?;
    assert_eq!(second.status().configuration, QuorumConfiguration::of([1]));
    assert_eq!(service.quorum_ids().await, vec!["solo".to_string()]);

    tokio::time::timeout(WAIT, second.is_available()).await??;
    assert!(first.is_leader());
    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn messages_for_another_node_are_dropped() -> Result<()> {
    let nodes = start_nodes(&[1]).await?;
    let service = &nodes[0].service;
    let replicator = service.create_replicator("solo", [1]).await?;
    tokio::time::timeout(WAIT, replicator.is_available()).await??;

    let mut stream = TcpStream::connect(service.local_addr()).await?;
    let request = |receiver_id| ReplicationWireMessage {
        message_id: 42,
        sender_id: 7,
        receiver_id,
        quorum_id: "solo".into(),
        in_reply: false,
        body: RpcMessage::RequestVote(RequestVote {
            term: 0,
            candidate_id: 7,
            last_log_index: 0,
            last_log_term: 0,
        }),
    };

    write_message(&mut stream, &request(9)).await?;
    write_message(&mut stream, &request(1)).await?;
    let reply = tokio::time::timeout(WAIT, read_message(&mut stream)).await??;
    let Some(reply) = reply else { bail!("connection closed") };
    assert!(reply.in_reply);
    assert_eq!((reply.message_id, reply.sender_id, reply.receiver_id), (42, 1, 7));
    let RpcMessage::RequestVoteReply(vote) = &reply.body else { bail!("unexpected reply {:?}", reply.body) };
    assert!(!vote.vote_granted);

    // only one answer: the misaddressed request got none
    let extra = tokio::time::timeout(Duration::from_millis(300), read_message(&mut stream)).await;
    assert!(extra.is_err());
    assert_eq!(replicator.status().role, Role::Leader);
    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_replicators_are_forgotten() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let dir = tempfile::tempdir()?;
    let persister = Arc::new(MemoryPersister::new());
    let service = ReplicatorService::start(
        ReplicatorSettings::fast(),
        1,
        listener,
        HashMap::new(),
        LogService::open(dir.path(), LogSettings::default())?,
        persister.clone(),
    )
    .await?;
    let mut events = service.subscribe_events();

    // peers 2 and 3 are unreachable, so node 1 keeps campaigning
    service.create_replicator("doomed", [1, 2, 3]).await?;
    persister.fail_writes(true);

    tokio::time::timeout(WAIT, async {
        loop {
            if let ReplicatorInstanceEvent::QuorumFailure { quorum_id, .. } = events.recv().await? {
                if quorum_id == "doomed" {
                    return anyhow::Ok(());
                }
            }
        }
    })
    .await??;

    let start = Instant::now();
    while service.replicator("doomed").await.is_some() {
        if start.elapsed() > WAIT {
            bail!("failed replicator is still registered");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(service.quorum_ids().await.is_empty());
    service.shutdown().await;
    Ok(())
}
