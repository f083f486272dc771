// Common test utilities and helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use ballot_core::{
    BallotConfig, BallotResult, LocalTransport, LogEntry, LogIndex, LogStorage, MemoryStorage,
    NodeId, PartitionFilter, RaftNode, RegisterStateMachine, Role, StateMachine,
    StateMachineSnapshot, Ticker,
};

/// Test configuration constants
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const TICK: Duration = Duration::from_millis(5);

/// CI machines are slower; allow scaling every timeout
pub fn timeout_multiplier() -> u32 {
    if env::var("CI").is_ok() {
        return 3;
    }
    env::var("TEST_TIMEOUT_MULTIPLIER")
        .ok()
        .and_then(|m| m.parse().ok())
        .unwrap_or(1)
}

pub fn scaled_timeout(base: Duration) -> Duration {
    base.saturating_mul(timeout_multiplier())
}

/// Wait for a condition with simple polling
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout: Duration) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + scaled_timeout(timeout);
    while Instant::now() < deadline {
        if condition().await {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    Err(format!("Condition not met within {:?}", scaled_timeout(timeout)))
}

/// Register state machine that also counts snapshot restores
#[derive(Default)]
pub struct RecordingStateMachine {
    register: RegisterStateMachine,
    restores: AtomicUsize,
}

impl RecordingStateMachine {
    pub fn data(&self) -> Option<Vec<u8>> {
        self.register.data()
    }

    pub fn applied(&self) -> u64 {
        self.register.applied()
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateMachine for RecordingStateMachine {
    fn commit_index(&self) -> LogIndex {
        self.register.commit_index()
    }

    async fn apply(&self, entries: &[LogEntry]) -> BallotResult<()> {
        self.register.apply(entries).await
    }

    async fn snapshot(&self) -> BallotResult<StateMachineSnapshot> {
        self.register.snapshot().await
    }

    async fn restore(&self, snapshot: StateMachineSnapshot) -> BallotResult<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.register.restore(snapshot).await
    }
}

/// Fast timings for in-process clusters
pub fn test_config<S: AsRef<str>>(node_id: &str, ids: &[S]) -> BallotConfig {
    let mut config = BallotConfig::for_cluster(node_id, ids.iter().map(|id| id.as_ref().to_string()));
    config.raft.election_timeout_min_ticks = 10;
    config.raft.election_timeout_max_ticks = 20;
    config.raft.heartbeat_interval_ticks = 2;
    config.raft.tick_interval = TICK;
    config.raft.proposal_timeout = Duration::from_secs(5);
    config
}

pub fn node_ids(size: usize) -> Vec<NodeId> {
    (1..=size).map(|i| format!("raft-{}", i)).collect()
}

pub struct TestNode {
    pub node: RaftNode,
    pub state_machine: Arc<RecordingStateMachine>,
    pub storage: Arc<dyn LogStorage>,
}

/// An in-process cluster on a [`LocalTransport`], ticked in the background
pub struct TestCluster {
    pub transport: LocalTransport,
    pub partition: PartitionFilter,
    pub nodes: BTreeMap<NodeId, TestNode>,
    ticker: Option<Ticker>,
}

impl TestCluster {
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, |_| {}).await
    }

    /// Build a cluster, letting `tweak` adjust every node's configuration
    pub async fn with_config<F>(size: usize, tweak: F) -> Self
    where
        F: Fn(&mut BallotConfig),
    {
        let transport = LocalTransport::new();
        let partition = PartitionFilter::new();
        transport.add_filter(Arc::new(partition.clone()));

        let mut cluster = Self {
            transport,
            partition,
            nodes: BTreeMap::new(),
            ticker: None,
        };

        let ids = node_ids(size);
        for id in &ids {
            let mut config = test_config(id, &ids);
            tweak(&mut config);
            cluster.start_node(config).await;
        }
        cluster.restart_ticker().await;
        cluster
    }

    /// Start a node from `config` and register it with the transport. The
    /// ticker is not touched.
    pub async fn start_node(&mut self, config: BallotConfig) -> RaftNode {
        let storage: Arc<dyn LogStorage> = Arc::new(MemoryStorage::new());
        let state_machine = Arc::new(RecordingStateMachine::default());
        let node = RaftNode::start(
            &config,
            storage.clone(),
            state_machine.clone(),
            Arc::new(self.transport.clone()),
        )
        .await
        .unwrap();

        self.transport.register(&node);
        self.nodes.insert(
            config.node_id.clone(),
            TestNode {
                node: node.clone(),
                state_machine,
                storage,
            },
        );
        node
    }

    /// Tick every current node
    pub async fn restart_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop().await;
        }
        let nodes = self.nodes.values().map(|n| n.node.clone()).collect();
        self.ticker = Some(Ticker::spawn(nodes, TICK));
    }

    pub fn node(&self, id: &str) -> &RaftNode {
        &self.nodes[id].node
    }

    pub fn state_machine(&self, id: &str) -> &Arc<RecordingStateMachine> {
        &self.nodes[id].state_machine
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// The leader with the highest term among `candidates`, if any
    pub async fn current_leader_among(&self, candidates: &[NodeId]) -> Option<NodeId> {
        let mut best: Option<(u64, NodeId)> = None;
        for id in candidates {
            let status = self.node(id).status().await;
            if status.role == Role::Leader && best.as_ref().map_or(true, |(t, _)| status.term > *t) {
                best = Some((status.term, id.clone()));
            }
        }
        best.map(|(_, id)| id)
    }

    pub async fn wait_for_leader(&self) -> NodeId {
        self.wait_for_leader_among(&self.ids()).await
    }

    /// Wait until one of `candidates` leads and the others follow it
    pub async fn wait_for_leader_among(&self, candidates: &[NodeId]) -> NodeId {
        let deadline = Instant::now() + scaled_timeout(TEST_TIMEOUT);
        loop {
            if let Some(leader) = self.current_leader_among(candidates).await {
                let mut agreed = true;
                for id in candidates {
                    if id != &leader
                        && self.node(id).status().await.leader_id.as_deref() != Some(leader.as_str())
                    {
                        agreed = false;
                        break;
                    }
                }
                if agreed {
                    return leader;
                }
            }
            assert!(Instant::now() < deadline, "no leader elected among {:?}", candidates);
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every node in `ids` has applied up to `index`
    pub async fn wait_for_commit(&self, ids: &[NodeId], index: LogIndex) {
        let result = wait_for_condition(
            move || async move {
                ids.iter()
                    .all(|id| self.state_machine(id).commit_index() >= index)
            },
            TEST_TIMEOUT,
        )
        .await;
        if let Err(e) = result {
            let mut report = Vec::new();
            for id in ids {
                report.push(self.node(id).status().await);
            }
            panic!("{}: {:#?}", e, report);
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop().await;
        }
        for test_node in self.nodes.values() {
            let _ = test_node.node.shutdown().await;
        }
    }
}
