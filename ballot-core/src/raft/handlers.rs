//! Peer RPC handlers
//!
//! Protocol rejections become negative responses. Only internal and storage
//! failures surface as errors.

use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{BallotError, BallotResult};
use crate::raft::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::node::RaftNode;
use crate::types::{Command, EntryId, Role};

impl RaftNode {
    #[instrument(skip(self, request), fields(node_id = %self.inner.id, candidate = %request.candidate_id, term = request.term))]
    pub async fn request_vote(&self, request: RequestVoteRequest) -> BallotResult<RequestVoteResponse> {
        let mut state = self.inner.state.lock().await;

        if !state.cluster.exists(&request.candidate_id) {
            let err = BallotError::InvalidPeer {
                peer_id: request.candidate_id.clone(),
            };
            warn!(error = %err, "Refusing vote to unknown candidate");
            return Ok(RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }

        if request.term < state.current_term {
            debug!(current_term = state.current_term, "Rejecting stale vote request");
            return Ok(RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }

        if request.term > state.current_term {
            self.become_follower(&mut state, request.term, None, false)?;
        }

        let candidate_log = EntryId {
            index: request.last_log_index,
            term: request.last_log_term,
        };
        let vote_granted = match &state.voted_for {
            Some(voted_for) => *voted_for == request.candidate_id,
            None => candidate_log.is_at_least_as_up_to_date_as(&state.log.last().id()),
        };

        if vote_granted {
            if state.voted_for.is_none() {
                state.voted_for = Some(request.candidate_id.clone());
                self.persist_hard_state(&state)?;
                info!("Granted vote");
            }
            self.reset_election_timer(&mut state);
        } else {
            debug!(voted_for = ?state.voted_for, "Vote not granted");
        }

        Ok(RequestVoteResponse {
            term: state.current_term,
            vote_granted,
        })
    }

    #[instrument(skip(self, request), fields(node_id = %self.inner.id, leader = %request.leader_id, term = request.term, prev = request.prev_log_index, entries = request.entries.len()))]
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> BallotResult<AppendEntriesResponse> {
        let mut state = self.inner.state.lock().await;

        if request.term < state.current_term {
            debug!(current_term = state.current_term, "Rejecting stale append");
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
            });
        }

        if state.role == Role::Leader && request.term == state.current_term {
            error!("Another leader claims our term");
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
            });
        }

        if request.term > state.current_term
            || state.role != Role::Follower
            || state.leader_id.as_deref() != Some(request.leader_id.as_str())
        {
            let leader = Some(request.leader_id.clone());
            self.become_follower(&mut state, request.term, leader, true)?;
        } else {
            self.reset_election_timer(&mut state);
        }

        let outcome = match state.log.replicate(&request.stream(), request.term).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_protocol_rejection() => {
                debug!(error = %e, "Rejected entries");
                return Ok(AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                });
            }
            Err(e) => {
                error!(error = %e, "Append failed");
                return Err(e);
            }
        };

        let carries_membership = request
            .entries
            .iter()
            .any(|entry| matches!(entry.command, Command::Membership(_)));
        if outcome.truncated || carries_membership {
            self.refresh_membership(&mut state)?;
        }

        let target = request.commit_index.min(outcome.last_index);
        self.apply_up_to(&mut state, target).await?;

        Ok(AppendEntriesResponse {
            term: state.current_term,
            success: true,
        })
    }

    /// Replace configuration, state machine and log with the bundle's
    #[instrument(skip(self, request), fields(node_id = %self.inner.id, leader = %request.leader_id, term = request.term))]
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> BallotResult<InstallSnapshotResponse> {
        let mut state = self.inner.state.lock().await;

        if request.term < state.current_term {
            debug!(current_term = state.current_term, "Rejecting stale snapshot");
            return Ok(InstallSnapshotResponse {
                term: state.current_term,
                ack: false,
            });
        }

        let leader = Some(request.leader_id.clone());
        self.become_follower(&mut state, request.term, leader, true)?;

        let mut snapshot = request.snapshot;
        let local_commit = self.inner.state_machine.commit_index();
        if snapshot.commit_index() < local_commit {
            if snapshot.last_index() < local_commit {
                warn!(
                    local_commit,
                    snapshot_last = snapshot.last_index(),
                    "Snapshot is missing committed entries"
                );
                return Ok(InstallSnapshotResponse {
                    term: state.current_term,
                    ack: false,
                });
            }
            // Keep the state we already applied; the bundle's log covers it
            snapshot.state_machine = self.inner.state_machine.snapshot().await?;
        }

        let restored = self
            .inner
            .snapshotter
            .read(
                snapshot,
                &self.inner.id,
                self.inner.storage.clone(),
                self.inner.state_machine.clone(),
            )
            .await?;

        state.log = restored.log;
        state.cluster = Arc::new(restored.config);
        state.voted_for = None;
        state.leader_id = None;
        self.persist_hard_state(&state)?;
        self.reset_election_timer(&mut state);
        self.publish(&state);

        Ok(InstallSnapshotResponse {
            term: state.current_term,
            ack: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MembershipRecord;
    use crate::config::BallotConfig;
    use crate::raft::messages::{RaftRequest, RaftResponse};
    use crate::raft::snapshot::Snapshot;
    use crate::state_machine::{RegisterStateMachine, StateMachine, StateMachineSnapshot};
    use crate::storage::{LogStorage, MemoryStorage};
    use crate::transport::Transport;
    use crate::types::{LogEntry, Term};
    use async_trait::async_trait;

    /// Every peer is unreachable; handlers are driven directly
    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn call(
            &self,
            _from: &str,
            to: &str,
            _request: RaftRequest,
        ) -> BallotResult<RaftResponse> {
            Err(BallotError::Unreachable {
                peer_id: to.to_string(),
            })
        }
    }

    async fn node(id: &str) -> (RaftNode, Arc<RegisterStateMachine>, Arc<MemoryStorage>) {
        let config = BallotConfig::for_cluster(id, ["raft-1", "raft-2", "raft-3"]);
        let storage = Arc::new(MemoryStorage::new());
        let sm = Arc::new(RegisterStateMachine::new());
        let node = RaftNode::start(&config, storage.clone(), sm.clone(), Arc::new(NoTransport))
            .await
            .unwrap();
        (node, sm, storage)
    }

    fn vote(term: Term, candidate: &str, last_log_index: u64, last_log_term: Term) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index,
            last_log_term,
        }
    }

    fn data(term: Term, index: u64, payload: &str) -> LogEntry {
        LogEntry::new(term, index, Command::data(payload.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn test_fresh_node() {
        let (node, sm, _) = node("raft-2").await;
        let status = node.status().await;
        assert_eq!(status.term, 0);
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.commit_index, 0);
        assert_eq!(status.last_index + 1, 1);
        assert_eq!(node.entries(0, None).await.unwrap(), vec![LogEntry::sentinel()]);
        assert_eq!(sm.commit_index(), 0);
    }

    #[tokio::test]
    async fn test_grants_vote_and_persists_it() {
        let (node, _, storage) = node("raft-2").await;
        let response = node.request_vote(vote(3, "raft-1", 3, 3)).await.unwrap();
        assert_eq!(
            response,
            RequestVoteResponse {
                term: 3,
                vote_granted: true
            }
        );

        let status = node.status().await;
        assert_eq!(status.voted_for.as_deref(), Some("raft-1"));
        let hard_state = storage.hard_state().unwrap();
        assert_eq!(hard_state.current_term, 3);
        assert_eq!(hard_state.voted_for.as_deref(), Some("raft-1"));
    }

    #[tokio::test]
    async fn test_one_vote_per_term() {
        let (node, _, _) = node("raft-2").await;
        assert!(node.request_vote(vote(1, "raft-1", 0, 0)).await.unwrap().vote_granted);
        // Idempotent re-grant
        assert!(node.request_vote(vote(1, "raft-1", 0, 0)).await.unwrap().vote_granted);
        assert!(!node.request_vote(vote(1, "raft-3", 0, 0)).await.unwrap().vote_granted);
        // A new term frees the vote
        assert!(node.request_vote(vote(2, "raft-3", 0, 0)).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_stale_and_unknown_candidates_are_refused() {
        let (node, _, _) = node("raft-2").await;
        node.request_vote(vote(5, "raft-1", 0, 0)).await.unwrap();

        let stale = node.request_vote(vote(4, "raft-3", 9, 4)).await.unwrap();
        assert_eq!(stale.term, 5);
        assert!(!stale.vote_granted);

        let unknown = node.request_vote(vote(9, "raft-9", 9, 9)).await.unwrap();
        assert!(!unknown.vote_granted);
        assert_eq!(node.status().await.term, 5);
    }

    #[tokio::test]
    async fn test_refuses_candidate_with_older_log() {
        let (node, _, _) = node("raft-2").await;
        let response = node
            .append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: "raft-1".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![data(2, 1, "foo"), data(2, 2, "bar")],
                commit_index: 0,
            })
            .await
            .unwrap();
        assert!(response.success);

        // Same last term, shorter log
        assert!(!node.request_vote(vote(3, "raft-3", 1, 2)).await.unwrap().vote_granted);
        // Higher last term wins regardless of length
        assert!(node.request_vote(vote(3, "raft-3", 1, 3)).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_only_granted_votes_restart_the_election_timer() {
        let (node, _, _) = node("raft-2").await;
        node.append_entries(AppendEntriesRequest {
            term: 2,
            leader_id: "raft-1".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![data(2, 1, "foo"), data(2, 2, "bar")],
            commit_index: 0,
        })
        .await
        .unwrap();
        node.inner.state.lock().await.election_remaining = 1;

        // A higher term from a candidate with an older log is adopted, but
        // the election this node is about to start is not pushed back
        let denied = node.request_vote(vote(3, "raft-3", 1, 1)).await.unwrap();
        assert!(!denied.vote_granted);
        assert_eq!(denied.term, 3);
        assert_eq!(node.inner.state.lock().await.election_remaining, 1);

        let granted = node.request_vote(vote(4, "raft-3", 2, 2)).await.unwrap();
        assert!(granted.vote_granted);
        assert!(node.inner.state.lock().await.election_remaining > 1);
    }

    #[tokio::test]
    async fn test_append_entries_applies_commit() {
        let (node, sm, _) = node("raft-2").await;
        let response = node
            .append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "raft-1".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![data(1, 1, "foo")],
                commit_index: 1,
            })
            .await
            .unwrap();

        assert_eq!(response, AppendEntriesResponse { term: 1, success: true });
        assert_eq!(sm.commit_index(), 1);
        assert_eq!(sm.data(), Some(b"foo".to_vec()));

        let status = node.status().await;
        assert_eq!(status.leader_id.as_deref(), Some("raft-1"));
    }

    #[tokio::test]
    async fn test_commit_is_capped_by_covered_index() {
        let (node, sm, _) = node("raft-2").await;
        node.append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: "raft-1".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![data(1, 1, "foo")],
            commit_index: 5,
        })
        .await
        .unwrap();
        assert_eq!(sm.commit_index(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_anchor_is_negative_response() {
        let (node, _, _) = node("raft-2").await;
        let response = node
            .append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "raft-1".to_string(),
                prev_log_index: 4,
                prev_log_term: 1,
                entries: vec![data(1, 5, "foo")],
                commit_index: 0,
            })
            .await
            .unwrap();
        assert_eq!(response, AppendEntriesResponse { term: 1, success: false });
        assert_eq!(node.status().await.last_index, 0);
    }

    #[tokio::test]
    async fn test_stale_append_is_rejected() {
        let (node, _, _) = node("raft-2").await;
        node.request_vote(vote(4, "raft-3", 0, 0)).await.unwrap();
        let response = node
            .append_entries(AppendEntriesRequest {
                term: 3,
                leader_id: "raft-1".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                commit_index: 0,
            })
            .await
            .unwrap();
        assert_eq!(response, AppendEntriesResponse { term: 4, success: false });
        assert_eq!(node.status().await.leader_id, None);
    }

    #[tokio::test]
    async fn test_install_snapshot_replaces_everything() {
        let (node, sm, storage) = node("raft-2").await;
        node.request_vote(vote(2, "raft-1", 0, 0)).await.unwrap();

        let source = RegisterStateMachine::new();
        let entries = vec![LogEntry::sentinel(), data(2, 1, "foo"), data(2, 2, "bar")];
        source.apply(&entries[1..]).await.unwrap();

        let membership = MembershipRecord::voters(["raft-1", "raft-2", "raft-3", "raft-4"]);
        let response = node
            .install_snapshot(InstallSnapshotRequest {
                term: 2,
                leader_id: "raft-1".to_string(),
                snapshot: Snapshot {
                    membership: membership.clone(),
                    state_machine: source.snapshot().await.unwrap(),
                    entries: entries.clone(),
                },
            })
            .await
            .unwrap();

        assert_eq!(response, InstallSnapshotResponse { term: 2, ack: true });
        let status = node.status().await;
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.voted_for, None);
        assert_eq!(status.leader_id, None);
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.last_index, 2);
        assert_eq!(sm.data(), Some(b"bar".to_vec()));
        assert_eq!(node.cluster().await.record(), &membership);
        assert_eq!(storage.membership().unwrap(), Some(membership));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_refused() {
        let (node, _, _) = node("raft-2").await;
        node.request_vote(vote(3, "raft-1", 0, 0)).await.unwrap();
        let response = node
            .install_snapshot(InstallSnapshotRequest {
                term: 2,
                leader_id: "raft-3".to_string(),
                snapshot: Snapshot {
                    membership: MembershipRecord::voters(["raft-3"]),
                    state_machine: StateMachineSnapshot {
                        commit_index: 0,
                        data: Vec::new(),
                    },
                    entries: vec![LogEntry::sentinel()],
                },
            })
            .await
            .unwrap();
        assert_eq!(response, InstallSnapshotResponse { term: 3, ack: false });
    }

    #[tokio::test]
    async fn test_membership_entries_take_effect_on_append() {
        let (node, _, _) = node("raft-2").await;
        let grown = MembershipRecord::voters(["raft-1", "raft-2", "raft-3", "raft-4"]);
        node.append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: "raft-1".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, Command::Membership(grown.clone()))],
            commit_index: 0,
        })
        .await
        .unwrap();
        assert!(node.cluster().await.exists("raft-4"));

        // Truncating the entry away restores the base configuration
        node.append_entries(AppendEntriesRequest {
            term: 2,
            leader_id: "raft-3".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![data(2, 1, "foo")],
            commit_index: 0,
        })
        .await
        .unwrap();
        assert!(!node.cluster().await.exists("raft-4"));
    }

    #[tokio::test]
    async fn test_handle_dispatches_by_variant() {
        let (node, _, _) = node("raft-2").await;
        let response = node
            .handle(RaftRequest::RequestVote(vote(1, "raft-3", 0, 0)))
            .await
            .unwrap();
        assert!(matches!(
            response,
            RaftResponse::RequestVote(RequestVoteResponse {
                vote_granted: true,
                ..
            })
        ));

        node.shutdown().await.unwrap();
        let err = node
            .handle(RaftRequest::RequestVote(vote(2, "raft-3", 0, 0)))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
