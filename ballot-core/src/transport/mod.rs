//! Message delivery between peers
//!
//! A [`Transport`] performs one request/response exchange. Completion
//! tracking and cancellation live in the node's outstanding message table,
//! so implementations only have to deliver or fail.

use async_trait::async_trait;

use crate::error::BallotResult;
use crate::raft::messages::{RaftRequest, RaftResponse};

pub mod filter;
pub mod local;

pub use filter::{MessageFilter, PartitionFilter, RandomDropFilter};
pub use local::LocalTransport;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `request` from `from` to `to` and wait for the answer.
    /// Unknown or unreachable peers fail with `Unreachable`.
    async fn call(&self, from: &str, to: &str, request: RaftRequest) -> BallotResult<RaftResponse>;
}
