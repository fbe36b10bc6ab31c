//! Runs one node of a replicated log and lets you write to it from stdin.
//!
//! # Example usage
//!
//! Start a 3-node quorum:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- --id 1 --listen 127.0.0.1:7101 --data-dir /tmp/q1 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminals 2 and 3 likewise with --id 2 / --id 3, their own listen
//! # address and data directory, and the same --peer list.
//! ```
//!
//! Any line typed on the leader is replicated; `status`, `read <from> <to>`,
//! `roll` and `exit` are commands.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueHint};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use quorum_replication::generalized::GeneralizedReplicator;
use quorum_replication::log::LogService;
use quorum_replication::persister::FilePersister;
use quorum_replication::service::ReplicatorService;
use quorum_replication::settings::NodeSettings;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a node of a quorum-replicated log")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: u64,

    /// Address to listen on for replication traffic, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: SocketAddr,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Directory holding this node's log files and term/vote records
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Quorum to join
    #[arg(long, default_value = "default")]
    quorum: String,

    /// Optional JSON file overriding timing and log settings
    #[arg(long, value_hint = ValueHint::FilePath)]
    settings: Option<PathBuf>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let peers = parse_peers(&args.peer)?;
    if peers.get(&args.id) != Some(&args.listen) {
        return Err(anyhow!(
            "self id {} must map to listen addr {} via --peer entries",
            args.id,
            args.listen
        ));
    }

    let settings = match &args.settings {
        Some(path) => NodeSettings::from_json_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => NodeSettings::default(),
    };

    let log_service = LogService::open(&args.data_dir, settings.log.clone())
        .with_context(|| format!("failed to open log in {}", args.data_dir.display()))?;
    let persister = Arc::new(FilePersister::new(&args.data_dir));
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    let members: Vec<u64> = peers.keys().copied().collect();
    let service = ReplicatorService::start(
        settings.replicator.clone(),
        args.id,
        listener,
        peers,
        log_service.clone(),
        persister,
    )
    .await?;
    let replicator = service.create_replicator(&args.quorum, members).await?;
    let reader = log_service.reader(&args.quorum)?;
    let writer = GeneralizedReplicator::new(replicator.clone()).with_reader(reader);
    info!(node_id = args.id, quorum_id = %args.quorum, "node ready; type a line to replicate it");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        match words.next() {
            Some("exit") => break,
            Some("status") => {
                let status = replicator.status();
                println!(
                    "node {} | term {} | {} | leader {} | last {} | committed {} | {}",
                    status.node_id,
                    status.term,
                    status.role,
                    status.leader_id,
                    status.last_index,
                    status.commit_index,
                    status.configuration
                );
            }
            Some("roll") => match log_service.roll(&args.quorum).await {
                Ok(()) => println!("rolled log"),
                Err(err) => println!("ERROR: {err}"),
            },
            Some("read") => {
                let range: Vec<u64> = words.filter_map(|word| word.parse().ok()).collect();
                let [from, to] = range[..] else {
                    println!("usage: read <from> <to>");
                    continue;
                };
                let Some(reader) = writer.reader() else { continue };
                match reader.data_entries(from, to).await {
                    Ok(entries) => {
                        for entry in entries {
                            let text: Vec<String> =
                                entry.data.iter().map(|chunk| String::from_utf8_lossy(chunk).into_owned()).collect();
                            println!("{}: {}", entry.seq_num, text.join(" "));
                        }
                    }
                    Err(err) => println!("ERROR: {err}"),
                }
            }
            _ => {
                let outcome = match writer.replicate(vec![line.as_bytes().to_vec()]) {
                    Ok(write) => write.await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(seq_num) => println!("committed at {seq_num}"),
                    Err(err) => {
                        warn!(error = %err, "write failed");
                        println!("ERROR: {err}");
                    }
                }
            }
        }
    }

    service.shutdown().await;
    log_service.close().await?;
    Ok(())
}

/// Parses `id=addr` entries from the command line into a map.
fn parse_peers(entries: &[String]) -> Result<HashMap<u64, SocketAddr>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id.parse().with_context(|| format!("invalid peer id in '{entry}'"))?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address in '{entry}'"))?;
        peers.insert(id, addr);
    }
    if peers.is_empty() {
        return Err(anyhow!("at least one --peer entry is required (include self)"));
    }
    Ok(peers)
}
