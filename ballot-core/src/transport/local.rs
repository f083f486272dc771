//! In-process transport routing requests straight into registered nodes

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

use super::filter::MessageFilter;
use super::Transport;
use crate::error::{BallotError, BallotResult};
use crate::raft::messages::{RaftRequest, RaftResponse};
use crate::raft::{RaftNode, WeakRaftNode};
use crate::types::NodeId;

/// Routes requests between nodes of one process. Holds only weak handles,
/// so dropping a node makes it unreachable.
#[derive(Clone, Default)]
pub struct LocalTransport {
    nodes: Arc<RwLock<HashMap<NodeId, WeakRaftNode>>>,
    filters: Arc<RwLock<Vec<Arc<dyn MessageFilter>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: &RaftNode) {
        self.nodes.write().insert(node.id().clone(), node.downgrade());
    }

    pub fn deregister(&self, id: &str) {
        self.nodes.write().remove(id);
    }

    pub fn add_filter(&self, filter: Arc<dyn MessageFilter>) {
        self.filters.write().push(filter);
    }

    pub fn clear_filters(&self) {
        self.filters.write().clear();
    }

    fn should_deliver(&self, from: &str, to: &str) -> bool {
        self.filters
            .read()
            .iter()
            .all(|filter| filter.should_deliver(from, to))
    }

    fn lookup(&self, id: &str) -> Option<RaftNode> {
        self.nodes.read().get(id).and_then(WeakRaftNode::upgrade)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, from: &str, to: &str, request: RaftRequest) -> BallotResult<RaftResponse> {
        let unreachable = || BallotError::Unreachable {
            peer_id: to.to_string(),
        };

        if !self.should_deliver(from, to) {
            trace!(from, to, kind = %request.kind(), "Dropped request");
            return Err(unreachable());
        }
        let node = self.lookup(to).ok_or_else(unreachable)?;

        // The handler runs on its own task, so a caller that stops waiting
        // drops only the reply and never interrupts the receiving node
        let handler = tokio::spawn(async move { node.handle(request).await });
        let response = handler.await.map_err(|e| {
            warn!(from, to, error = %e, "Request handler did not finish");
            unreachable()
        })??;

        // The reply travels the reverse link
        if !self.should_deliver(to, from) {
            trace!(from, to, kind = %response.kind(), "Dropped response");
            return Err(unreachable());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MembershipRecord;
    use crate::config::BallotConfig;
    use crate::raft::{InstallSnapshotRequest, OutstandingMessages, Snapshot};
    use crate::state_machine::{RegisterStateMachine, StateMachine, StateMachineSnapshot};
    use crate::storage::MemoryStorage;
    use crate::types::{Command, LogEntry, LogIndex};
    use std::time::Duration;

    /// Register that keeps working for a while after installing a snapshot
    #[derive(Default)]
    struct SlowRestore {
        register: RegisterStateMachine,
    }

    #[async_trait]
    impl StateMachine for SlowRestore {
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
            self.register.restore(snapshot).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_canceled_call_still_completes_on_receiver() {
        let transport = LocalTransport::new();
        let config = BallotConfig::for_cluster("raft-2", ["raft-1", "raft-2", "raft-3"]);
        let receiver = RaftNode::start(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::new(SlowRestore::default()),
            Arc::new(transport.clone()),
        )
        .await
        .unwrap();
        transport.register(&receiver);

        let mut entries = vec![LogEntry::sentinel()];
        for (offset, payload) in ["foo", "bar", "baz"].iter().enumerate() {
            entries.push(LogEntry::new(
                1,
                offset as u64 + 1,
                Command::data(payload.as_bytes().to_vec()),
            ));
        }
        let source = RegisterStateMachine::new();
        source.apply(&entries[1..]).await.unwrap();
        let request = RaftRequest::InstallSnapshot(InstallSnapshotRequest {
            term: 1,
            leader_id: "raft-1".to_string(),
            snapshot: Snapshot {
                membership: MembershipRecord::voters(["raft-1", "raft-2", "raft-3"]),
                state_machine: source.snapshot().await.unwrap(),
                entries,
            },
        });

        let outstanding = Arc::new(OutstandingMessages::new());
        let (id, completion) = outstanding.send(
            Arc::new(transport.clone()),
            "raft-1".to_string(),
            "raft-2".to_string(),
            1,
            request,
        );

        // Cancel while the receiver is inside its state machine restore
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outstanding.cancel(id));
        assert!(matches!(completion.await, Ok(Err(BallotError::Canceled))));

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = receiver.status().await;
                if status.commit_index == 3 {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(status.term, 1);
        assert_eq!(status.last_index, 3);
        assert!(status.commit_index <= status.last_index);
        assert!(receiver.cluster().await.peer_exists("raft-3"));
        receiver.shutdown().await.unwrap();
    }
}
