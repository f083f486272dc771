//! RPC messages exchanged between peers

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::raft::snapshot::Snapshot;
use crate::types::{Command, LogEntry, LogIndex, NodeId, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
}

impl AppendEntriesRequest {
    /// The entries prefixed with the anchor the receiver must already hold
    pub fn stream(&self) -> Vec<LogEntry> {
        let mut stream = Vec::with_capacity(self.entries.len() + 1);
        stream.push(LogEntry::new(
            self.prev_log_term,
            self.prev_log_index,
            Command::Noop,
        ));
        stream.extend(self.entries.iter().cloned());
        stream
    }

    /// Highest index this request covers
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.prev_log_index)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub ack: bool,
}

/// A command submitted to the local node. Never sent between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub leader_id: Option<NodeId>,
    pub entry_term: Term,
    pub entry_index: LogIndex,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    RequestVote,
    AppendEntries,
    InstallSnapshot,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::RequestVote => write!(f, "request_vote"),
            RequestKind::AppendEntries => write!(f, "append_entries"),
            RequestKind::InstallSnapshot => write!(f, "install_snapshot"),
        }
    }
}

/// Peer-to-peer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

impl RaftRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            RaftRequest::RequestVote(_) => RequestKind::RequestVote,
            RaftRequest::AppendEntries(_) => RequestKind::AppendEntries,
            RaftRequest::InstallSnapshot(_) => RequestKind::InstallSnapshot,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            RaftRequest::RequestVote(req) => req.term,
            RaftRequest::AppendEntries(req) => req.term,
            RaftRequest::InstallSnapshot(req) => req.term,
        }
    }
}

/// Peer-to-peer response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
}

impl RaftResponse {
    pub fn kind(&self) -> RequestKind {
        match self {
            RaftResponse::RequestVote(_) => RequestKind::RequestVote,
            RaftResponse::AppendEntries(_) => RequestKind::AppendEntries,
            RaftResponse::InstallSnapshot(_) => RequestKind::InstallSnapshot,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            RaftResponse::RequestVote(resp) => resp.term,
            RaftResponse::AppendEntries(resp) => resp.term,
            RaftResponse::InstallSnapshot(resp) => resp.term,
        }
    }
}
