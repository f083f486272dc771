//! Ballot: a Raft consensus engine
//!
//! Peers elect a leader, replicate an ordered command log and agree on a
//! commit point, so a [`StateMachine`] applies the same commands in the same
//! order everywhere. Storage, transport and the state machine are narrow
//! traits with in-process reference implementations.

pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod observability;
pub mod raft;
pub mod state_machine;
pub mod storage;
pub mod transport;
pub mod types;

pub use cluster::{ClusterConfiguration, Members, MembershipRecord, PeerAttributes};
pub use config::BallotConfig;
pub use driver::Ticker;
pub use error::{BallotError, BallotResult};
pub use raft::{ClientResponse, CommandLog, NodeProgress, RaftNode, Snapshot, Snapshotter};
pub use state_machine::{RegisterStateMachine, StateMachine, StateMachineSnapshot};
pub use storage::{open_storage, HardState, LogStorage, MemoryStorage, RedbStorage};
pub use transport::{LocalTransport, MessageFilter, PartitionFilter, RandomDropFilter, Transport};
pub use types::{Command, LogEntry, LogIndex, NodeId, NodeStatus, Role, Term};
