//! Raft consensus: the command log, the node actor and its RPCs

pub mod log;
pub mod messages;
pub mod outstanding;
pub mod snapshot;

mod election;
mod handlers;
mod membership;
mod node;
mod replication;

pub use self::log::{AppendOutcome, CommandLog};
pub use messages::{
    AppendEntriesRequest, AppendEntriesResponse, ClientRequest, ClientResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RaftRequest, RaftResponse, RequestKind,
    RequestVoteRequest, RequestVoteResponse,
};
pub use node::{NodeProgress, RaftNode, WeakRaftNode};
pub use outstanding::{MessageId, OutstandingMessages};
pub use snapshot::{RestoredSnapshot, Snapshot, Snapshotter};
