//! Core identifiers and the replicated log entry

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::MembershipRecord;

/// A peer identifier, unique within a cluster (e.g. `"raft-1"`).
pub type NodeId = String;

/// A leader term. Increases monotonically.
pub type Term = u64;

/// A position in the replicated log. Index 0 is the sentinel.
pub type LogIndex = u64;

/// Payload of a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Carries no application data; the sentinel and leader no-ops use it
    Noop,
    /// Opaque application payload, replicated in log order
    Data(Vec<u8>),
    /// A cluster membership record, effective as soon as it is appended
    Membership(MembershipRecord),
}

impl Command {
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Command::Data(bytes.into())
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Command::Noop)
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }

    /// The permanent entry at index 0 that anchors the first real append
    pub fn sentinel() -> Self {
        Self::new(0, 0, Command::Noop)
    }

    pub fn id(&self) -> EntryId {
        EntryId {
            index: self.index,
            term: self.term,
        }
    }
}

/// Position plus term of an entry: enough to run a consistency check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryId {
    pub index: LogIndex,
    pub term: Term,
}

impl EntryId {
    /// Raft's "at least as up to date" ordering: term first, then index
    pub fn is_at_least_as_up_to_date_as(&self, other: &EntryId) -> bool {
        (self.term, self.index) >= (other.term, other.index)
    }
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node, for drivers and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_index: LogIndex,
    pub last_term: Term,
}
