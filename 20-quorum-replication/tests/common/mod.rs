//! In-process network for integration tests.
//!
//! Every node gets its own outgoing channel; a router task per node delivers
//! each request straight to the target's [`Replicator::deliver`]. Isolated
//! nodes neither send nor receive, which looks to their peers like requests
//! that never get an answer.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use quorum_replication::log::{InRamLog, InterceptingLog, LogCall};
use quorum_replication::persister::MemoryPersister;
use quorum_replication::replicator::{OutgoingRpc, Replicator, ReplicatorChannels, ReplicatorStatus, Role};
use quorum_replication::settings::ReplicatorSettings;

pub const QUORUM: &str = "quorum";

type Registry = Arc<Mutex<HashMap<u64, Replicator>>>;

pub struct TestCluster {
    nodes: Registry,
    isolated: Arc<Mutex<BTreeSet<u64>>>,
    calls: BTreeMap<u64, Arc<Mutex<Vec<LogCall>>>>,
    settings: ReplicatorSettings,
}

impl TestCluster {
    /// Starts one node per id, all bootstrapped with the full membership.
    pub async fn start(ids: &[u64]) -> Result<Self> {
        let mut cluster = Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            isolated: Arc::new(Mutex::new(BTreeSet::new())),
            calls: BTreeMap::new(),
            settings: ReplicatorSettings::fast(),
        };
        for &id in ids {
            cluster.add_node(id, ids).await?;
        }
        Ok(cluster)
    }

    /// Starts a node. Pass no peers for a node that should learn its
    /// membership from a leader.
    pub async fn add_node(&mut self, id: u64, peers: &[u64]) -> Result<Replicator> {
        let (outgoing, transport) = mpsc::unbounded_channel();
        let log = InterceptingLog::new(InRamLog::new());
        self.calls.insert(id, log.calls());
        let replicator = Replicator::start(
            id,
            QUORUM,
            peers.iter().copied(),
            self.settings.clone(),
            log,
            Arc::new(MemoryPersister::new()),
            ReplicatorChannels::new(outgoing),
        )
        .await?;
        self.nodes.lock().unwrap().insert(id, replicator.clone());
        tokio::spawn(route(id, transport, self.nodes.clone(), self.isolated.clone()));
        Ok(replicator)
    }

    pub fn node(&self, id: u64) -> Replicator {
        self.nodes.lock().unwrap()[&id].clone()
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.nodes.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn statuses(&self) -> Vec<ReplicatorStatus> {
        self.ids().into_iter().map(|id| self.node(id).status()).collect()
    }

    /// Mutations each node made to its log, in order.
    pub fn log_calls(&self, id: u64) -> Vec<LogCall> {
        self.calls[&id].lock().unwrap().clone()
    }

    pub fn isolate(&self, id: u64) {
        self.isolated.lock().unwrap().insert(id);
    }

    pub fn heal(&self, id: u64) {
        self.isolated.lock().unwrap().remove(&id);
    }

    fn is_isolated(&self, id: u64) -> bool {
        self.isolated.lock().unwrap().contains(&id)
    }

    /// Waits until exactly one connected node leads and returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<u64> {
        let start = Instant::now();
        loop {
            let leaders: Vec<u64> = self
                .statuses()
                .into_iter()
                .filter(|status| status.role == Role::Leader && !self.is_isolated(status.node_id))
                .map(|status| status.node_id)
                .collect();
            if let [leader] = leaders[..] {
                return Ok(leader);
            }
            if start.elapsed() > timeout {
                bail!("no single leader after {timeout:?}, found {leaders:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until `predicate` holds for node `id`.
    pub async fn wait_for(
        &self,
        id: u64,
        timeout: Duration,
        predicate: impl Fn(&ReplicatorStatus) -> bool,
    ) -> Result<ReplicatorStatus> {
        match tokio::time::timeout(timeout, self.node(id).wait_for_status(predicate)).await {
            Ok(status) => Ok(status?),
            Err(_) => bail!("node {id} did not reach the expected state: {:?}", self.node(id).status()),
        }
    }
}

async fn route(
    from: u64,
    mut transport: mpsc::UnboundedReceiver<OutgoingRpc>,
    nodes: Registry,
    isolated: Arc<Mutex<BTreeSet<u64>>>,
) {
    while let Some(rpc) = transport.recv().await {
        let OutgoingRpc::Request(outgoing) = rpc else { continue };
        let to = outgoing.request.to;
        let cut_off = {
            let isolated = isolated.lock().unwrap();
            isolated.contains(&from) || isolated.contains(&to)
        };
        let target = nodes.lock().unwrap().get(&to).cloned();
        let (false, Some(target)) = (cut_off, target) else { continue };

        let isolated = isolated.clone();
        tokio::spawn(async move {
            if let Ok(reply) = target.deliver(outgoing.request).await {
                // a partition that appeared meanwhile also swallows the reply
                let cut_off = {
                    let isolated = isolated.lock().unwrap();
                    isolated.contains(&from) || isolated.contains(&to)
                };
                if !cut_off {
                    let _ = outgoing.reply_to.send(reply);
                }
            }
        });
    }
}
