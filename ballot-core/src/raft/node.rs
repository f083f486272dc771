//! The Raft node
//!
//! A [`RaftNode`] is a cheap, cloneable handle to one logical actor. All
//! volatile and persistent state sits behind a single async mutex; every
//! handler re-checks term and role after acquiring it. The lock may be held
//! across command log and state machine awaits, never across a transport
//! call: outbound RPCs run on spawned tasks tracked by the outstanding
//! message table and re-acquire the lock to process their responses.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::cluster::ClusterConfiguration;
use crate::config::{BallotConfig, RaftConfig};
use crate::error::{BallotError, BallotResult};
use crate::raft::log::CommandLog;
use crate::raft::messages::{RaftRequest, RaftResponse};
use crate::raft::outstanding::OutstandingMessages;
use crate::raft::snapshot::Snapshotter;
use crate::state_machine::StateMachine;
use crate::storage::{HardState, LogStorage};
use crate::transport::Transport;
use crate::types::{LogEntry, LogIndex, NodeId, NodeStatus, Role, Term};

/// What a node publishes whenever its term, role, leader or commit index moves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProgress {
    pub term: Term,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
}

/// Leader-side replication state for one peer
#[derive(Debug, Clone, Default)]
pub(super) struct PeerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub snapshot_in_flight: bool,
}

impl PeerProgress {
    pub fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            ..Self::default()
        }
    }
}

pub(super) struct NodeState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    /// Ticks left before a follower or candidate starts an election
    pub election_remaining: u32,
    /// Ticks left before a leader sends heartbeats
    pub heartbeat_remaining: u32,
    pub cluster: Arc<ClusterConfiguration>,
    pub log: CommandLog,
    /// Distinct voters that granted this candidacy, self included
    pub votes: BTreeSet<NodeId>,
    pub progress: BTreeMap<NodeId, PeerProgress>,
    pub stopped: bool,
}

/// What an outbound request was, so its response can be interpreted
#[derive(Debug, Clone, Copy)]
pub(super) enum Sent {
    Vote {
        term: Term,
    },
    Append {
        term: Term,
        prev_log_index: LogIndex,
        last_index: LogIndex,
    },
    Snapshot {
        term: Term,
        last_index: LogIndex,
    },
}

pub(super) struct NodeInner {
    pub id: NodeId,
    pub config: RaftConfig,
    pub state: Mutex<NodeState>,
    pub storage: Arc<dyn LogStorage>,
    pub state_machine: Arc<dyn StateMachine>,
    pub transport: Arc<dyn Transport>,
    pub outstanding: Arc<OutstandingMessages>,
    pub snapshotter: Snapshotter,
    pub progress_tx: watch::Sender<NodeProgress>,
}

#[derive(Clone)]
pub struct RaftNode {
    pub(super) inner: Arc<NodeInner>,
}

/// Non-owning handle, used by registries that must not keep nodes alive
#[derive(Clone)]
pub struct WeakRaftNode {
    inner: Weak<NodeInner>,
}

impl WeakRaftNode {
    pub fn upgrade(&self) -> Option<RaftNode> {
        self.inner.upgrade().map(|inner| RaftNode { inner })
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode").field("id", &self.inner.id).finish()
    }
}

impl RaftNode {
    /// Load persisted state from `storage` and start as a follower
    pub async fn start(
        config: &BallotConfig,
        storage: Arc<dyn LogStorage>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> BallotResult<Self> {
        config.validate()?;
        let id = config.node_id.clone();

        let hard_state = storage.hard_state()?;
        let base_membership = match storage.membership()? {
            Some(record) => record,
            None => {
                let record = config.membership();
                storage.save_membership(&record)?;
                record
            }
        };

        let log = CommandLog::open(storage.clone(), state_machine.clone()).await?;
        let record = log.latest_membership()?.unwrap_or(base_membership);
        let cluster = ClusterConfiguration::new(id.clone(), record)?;

        let state = NodeState {
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            role: Role::Follower,
            leader_id: None,
            election_remaining: config.raft.random_election_timeout(),
            heartbeat_remaining: config.raft.heartbeat_interval_ticks,
            cluster: Arc::new(cluster),
            log,
            votes: BTreeSet::new(),
            progress: BTreeMap::new(),
            stopped: false,
        };

        let (progress_tx, _) = watch::channel(NodeProgress {
            term: state.current_term,
            role: Role::Follower,
            leader_id: None,
            commit_index: state_machine.commit_index(),
        });

        info!(
            node_id = %id,
            term = state.current_term,
            last_index = state.log.last().index,
            "Raft node started"
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                id,
                snapshotter: Snapshotter::new(config.storage.snapshot_read_batch),
                config: config.raft.clone(),
                state: Mutex::new(state),
                storage,
                state_machine,
                transport,
                outstanding: Arc::new(OutstandingMessages::new()),
                progress_tx,
            }),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn downgrade(&self) -> WeakRaftNode {
        WeakRaftNode {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state_machine(&self) -> Arc<dyn StateMachine> {
        self.inner.state_machine.clone()
    }

    /// Watch term, role, leader and commit index changes
    pub fn subscribe(&self) -> watch::Receiver<NodeProgress> {
        self.inner.progress_tx.subscribe()
    }

    /// Number of RPCs this node is still waiting on
    pub fn outstanding_requests(&self) -> usize {
        self.inner.outstanding.len()
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.inner.state.lock().await;
        let last = state.log.last();
        NodeStatus {
            id: self.inner.id.clone(),
            role: state.role,
            term: state.current_term,
            voted_for: state.voted_for.clone(),
            leader_id: state.leader_id.clone(),
            commit_index: self.inner.state_machine.commit_index(),
            last_index: last.index,
            last_term: last.term,
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.state.lock().await.role == Role::Leader
    }

    /// The configuration currently in effect
    pub async fn cluster(&self) -> Arc<ClusterConfiguration> {
        self.inner.state.lock().await.cluster.clone()
    }

    /// Log entries in `[start, end)`
    pub async fn entries(
        &self,
        start: LogIndex,
        end: Option<LogIndex>,
    ) -> BallotResult<Vec<LogEntry>> {
        self.inner.state.lock().await.log.slice(start, end)
    }

    /// Dispatch a peer request to its handler
    pub async fn handle(&self, request: RaftRequest) -> BallotResult<RaftResponse> {
        if self.inner.state.lock().await.stopped {
            return Err(BallotError::Unreachable {
                peer_id: self.inner.id.clone(),
            });
        }

        match request {
            RaftRequest::RequestVote(req) => self.request_vote(req).await.map(RaftResponse::RequestVote),
            RaftRequest::AppendEntries(req) => {
                self.append_entries(req).await.map(RaftResponse::AppendEntries)
            }
            RaftRequest::InstallSnapshot(req) => {
                self.install_snapshot(req).await.map(RaftResponse::InstallSnapshot)
            }
        }
    }

    /// Advance logical time by one tick
    pub async fn tick(&self) -> BallotResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.stopped {
            return Ok(());
        }

        match state.role {
            Role::Leader => {
                state.heartbeat_remaining = state.heartbeat_remaining.saturating_sub(1);
                if state.heartbeat_remaining == 0 {
                    state.heartbeat_remaining = self.inner.config.heartbeat_interval_ticks;
                    self.broadcast_append_entries(&mut state).await?;
                }
            }
            Role::Follower | Role::Candidate => {
                state.election_remaining = state.election_remaining.saturating_sub(1);
                if state.election_remaining == 0 {
                    if state.cluster.voting_in_latest_config(&self.inner.id) {
                        self.start_election(&mut state).await?;
                    } else {
                        trace!(node_id = %self.inner.id, "Not a voter, skipping election");
                        self.reset_election_timer(&mut state);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop serving: cancel in-flight requests and flush the log
    pub async fn shutdown(&self) -> BallotResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;
        self.inner.outstanding.cancel_all();
        state.log.close().await?;
        info!(node_id = %self.inner.id, "Raft node stopped");
        Ok(())
    }

    pub(super) fn persist_hard_state(&self, state: &NodeState) -> BallotResult<()> {
        self.inner.storage.save_hard_state(&HardState {
            current_term: state.current_term,
            voted_for: state.voted_for.clone(),
        })
    }

    pub(super) fn reset_election_timer(&self, state: &mut NodeState) {
        state.election_remaining = self.inner.config.random_election_timeout();
    }

    pub(super) fn publish(&self, state: &NodeState) {
        self.inner.progress_tx.send_replace(NodeProgress {
            term: state.current_term,
            role: state.role,
            leader_id: state.leader_id.clone(),
            commit_index: self.inner.state_machine.commit_index(),
        });
    }

    /// Become (or stay) a follower in `term`. A higher term clears the vote
    /// and is persisted before anything else happens.
    ///
    /// The election timer restarts only when `reset_timer` is set, that is
    /// when a live leader has been heard from.
    pub(super) fn become_follower(
        &self,
        state: &mut NodeState,
        term: Term,
        leader_id: Option<NodeId>,
        reset_timer: bool,
    ) -> BallotResult<()> {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            self.persist_hard_state(state)?;
        }

        let previous = state.role;
        state.role = Role::Follower;
        state.leader_id = leader_id;
        state.votes.clear();
        state.progress.clear();
        if reset_timer {
            self.reset_election_timer(state);
        }

        if previous != Role::Follower {
            self.inner.outstanding.cancel_all();
            info!(
                node_id = %self.inner.id,
                term = state.current_term,
                from = %previous,
                "Stepped down to follower"
            );
        }
        self.publish(state);
        Ok(())
    }

    /// Apply committed entries up to `target` to the state machine
    pub(super) async fn apply_up_to(
        &self,
        state: &mut NodeState,
        target: LogIndex,
    ) -> BallotResult<()> {
        let commit_index = self.inner.state_machine.commit_index();
        if target <= commit_index {
            return Ok(());
        }

        let entries = state.log.slice(commit_index + 1, Some(target + 1))?;
        if let Err(e) = self.inner.state_machine.apply(&entries).await {
            error!(node_id = %self.inner.id, error = %e, "State machine apply failed");
            return Err(e);
        }
        debug!(node_id = %self.inner.id, commit_index = target, "Advanced commit index");
        self.publish(state);
        Ok(())
    }

    /// Send `request` to `to` on a tracked task and route the response back
    pub(super) fn dispatch(&self, to: &str, term: Term, request: RaftRequest, sent: Sent) {
        let (id, completion) = self.inner.outstanding.send(
            self.inner.transport.clone(),
            self.inner.id.clone(),
            to.to_string(),
            term,
            request,
        );
        trace!(node_id = %self.inner.id, message_id = id, to, ?sent, "Dispatched request");

        let node = self.clone();
        let peer = to.to_string();
        tokio::spawn(async move {
            let result = completion.await.unwrap_or(Err(BallotError::Canceled));
            node.on_response(peer, sent, result).await;
        });
    }

    async fn on_response(&self, peer: NodeId, sent: Sent, result: BallotResult<RaftResponse>) {
        let outcome = match (sent, result) {
            (_, Err(BallotError::Canceled)) => Ok(()),
            (Sent::Snapshot { term, .. }, Err(e)) => {
                debug!(node_id = %self.inner.id, %peer, error = %e, "Snapshot delivery failed");
                self.clear_snapshot_in_flight(&peer, term).await;
                Ok(())
            }
            (_, Err(e)) => {
                debug!(node_id = %self.inner.id, %peer, error = %e, "Request failed");
                Ok(())
            }
            (Sent::Vote { term }, Ok(RaftResponse::RequestVote(resp))) => {
                self.handle_vote_response(&peer, term, resp).await
            }
            (
                Sent::Append {
                    term,
                    prev_log_index,
                    last_index,
                },
                Ok(RaftResponse::AppendEntries(resp)),
            ) => {
                self.handle_append_response(&peer, term, prev_log_index, last_index, resp)
                    .await
            }
            (Sent::Snapshot { term, last_index }, Ok(RaftResponse::InstallSnapshot(resp))) => {
                self.handle_snapshot_response(&peer, term, last_index, resp)
                    .await
            }
            (sent, Ok(other)) => {
                warn!(node_id = %self.inner.id, %peer, ?sent, kind = %other.kind(), "Mismatched response");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            error!(node_id = %self.inner.id, %peer, error = %e, "Failed to process response");
        }
    }
}
