use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

use ballot_core::config::StorageBackend;
use ballot_core::observability::{init_tracing, raft_span};
use ballot_core::{
    open_storage, BallotConfig, Command, LocalTransport, NodeStatus, RaftNode,
    RegisterStateMachine, Role, Ticker,
};

#[derive(Parser)]
#[command(name = "ballot")]
#[command(about = "Run and inspect in-process Raft clusters", long_about = None)]
struct Cli {
    /// TOML configuration file; every node starts from it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Boot a cluster, replicate commands and print every node's status
    Demo {
        /// Number of voting nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Commands to submit through the leader, in order
        #[arg(long, value_delimiter = ',', default_value = "foo")]
        commands: Vec<String>,

        /// Persist each node in a redb database under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// How long to wait for the first leader
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        election_wait: Duration,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Serialize)]
struct CommandReport {
    command: String,
    leader_id: Option<String>,
    entry_term: u64,
    entry_index: u64,
}

#[derive(Serialize)]
struct DemoReport {
    leader: String,
    committed: Vec<CommandReport>,
    nodes: Vec<NodeStatus>,
}

fn load_config(path: Option<&PathBuf>) -> Result<BallotConfig> {
    match path {
        Some(path) => BallotConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(BallotConfig::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let base = load_config(cli.config.as_ref())?;
    init_tracing(Some(&base.log_filter));

    match cli.command {
        Commands::Demo {
            nodes,
            commands,
            data_dir,
            election_wait,
        } => {
            let report = run_demo(base, nodes, commands, data_dir, election_wait).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&base)?);
        }
    }

    Ok(())
}

async fn run_demo(
    base: BallotConfig,
    size: usize,
    commands: Vec<String>,
    data_dir: Option<PathBuf>,
    election_wait: Duration,
) -> Result<DemoReport> {
    if size == 0 {
        bail!("a cluster needs at least one node");
    }

    let ids: Vec<String> = (1..=size).map(|i| format!("node-{}", i)).collect();
    let transport = LocalTransport::new();
    let mut nodes = Vec::with_capacity(size);

    for id in &ids {
        let mut config = BallotConfig::for_cluster(id.clone(), ids.iter().cloned());
        config.raft = base.raft.clone();
        config.storage = base.storage.clone();
        config.log_filter = base.log_filter.clone();
        if let Some(dir) = &data_dir {
            config.storage.backend = StorageBackend::Redb;
            config.storage.data_dir = dir.clone();
        }

        let storage = open_storage(&config.storage, id)
            .with_context(|| format!("opening storage for {}", id))?;
        let node = RaftNode::start(
            &config,
            storage,
            Arc::new(RegisterStateMachine::new()),
            Arc::new(transport.clone()),
        )
        .await
        .with_context(|| format!("starting {}", id))?;
        transport.register(&node);
        nodes.push(node);
    }

    info!(nodes = size, "Cluster started");
    let ticker = Ticker::spawn(nodes.clone(), base.raft.tick_interval);

    let result = replicate(&nodes, commands, election_wait).await;

    ticker.stop().await;
    for node in &nodes {
        if let Err(e) = node.shutdown().await {
            warn!(node_id = %node.id(), error = %e, "Shutdown failed");
        }
    }

    result
}

async fn replicate(
    nodes: &[RaftNode],
    commands: Vec<String>,
    election_wait: Duration,
) -> Result<DemoReport> {
    let mut leader = wait_for_leader(nodes, election_wait).await?;
    info!(leader = %leader.id(), "Leader elected");

    let mut committed = Vec::with_capacity(commands.len());
    for command in commands {
        let response = loop {
            let span = raft_span("client_request", leader.id());
            let attempt = leader
                .client_request(Command::data(command.clone().into_bytes()))
                .instrument(span)
                .await;
            match attempt {
                Ok(response) => break response,
                Err(e) if e.is_transport() || e.is_protocol_rejection() => {
                    warn!(error = %e, "Leader lost, waiting for a new one");
                    leader = wait_for_leader(nodes, election_wait).await?;
                }
                Err(e) => return Err(e).context("replicating command"),
            }
        };
        committed.push(CommandReport {
            command,
            leader_id: response.leader_id,
            entry_term: response.entry_term,
            entry_index: response.entry_index,
        });
    }

    // Let followers learn the final commit index
    if let Some(last) = committed.last().map(|c| c.entry_index) {
        let deadline = tokio::time::Instant::now() + election_wait;
        while tokio::time::Instant::now() < deadline {
            let mut caught_up = true;
            for node in nodes {
                caught_up &= node.status().await.commit_index >= last;
            }
            if caught_up {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    let mut statuses = Vec::with_capacity(nodes.len());
    for node in nodes {
        statuses.push(node.status().await);
    }

    Ok(DemoReport {
        leader: leader.id().clone(),
        committed,
        nodes: statuses,
    })
}

async fn wait_for_leader(nodes: &[RaftNode], wait: Duration) -> Result<RaftNode> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let mut best: Option<(u64, &RaftNode)> = None;
        for node in nodes {
            let status = node.status().await;
            if status.role == Role::Leader && best.map_or(true, |(term, _)| status.term > term) {
                best = Some((status.term, node));
            }
        }
        if let Some((_, node)) = best {
            return Ok(node.clone());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("no leader elected within {:?}", wait);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
