//! Leader-side replication: AppendEntries fan-out, log back-off, snapshot
//! catch-up, commit advancement and client requests

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{BallotError, BallotResult};
use crate::raft::messages::{
    AppendEntriesRequest, AppendEntriesResponse, ClientResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftRequest,
};
use crate::raft::node::{NodeProgress, NodeState, RaftNode, Sent};
use crate::types::{Command, LogEntry, LogIndex, Role, Term};

impl RaftNode {
    /// Submit a command. Resolves once the entry is committed and applied
    /// on this node.
    #[instrument(skip(self, command), fields(node_id = %self.inner.id))]
    pub async fn client_request(&self, command: Command) -> BallotResult<ClientResponse> {
        if matches!(command, Command::Membership(_)) {
            return Err(BallotError::InvalidOperation {
                operation: "client request".to_string(),
                reason: "membership changes go through change_membership".to_string(),
            });
        }

        let (entry, progress) = {
            let mut state = self.inner.state.lock().await;
            self.ensure_leader(&state)?;

            let entry = state.log.append_command(state.current_term, command).await?;
            debug!(index = entry.index, term = entry.term, "Appended client command");

            let progress = self.subscribe();
            self.advance_commit(&mut state).await?;
            self.broadcast_append_entries(&mut state).await?;
            (entry, progress)
        };

        self.wait_for_commit(&entry, progress).await?;
        Ok(ClientResponse {
            leader_id: Some(self.inner.id.clone()),
            entry_term: entry.term,
            entry_index: entry.index,
            success: true,
        })
    }

    pub(super) fn ensure_leader(&self, state: &NodeState) -> BallotResult<()> {
        if state.stopped || state.role != Role::Leader {
            return Err(BallotError::NotLeader {
                leader_id: state.leader_id.clone(),
            });
        }
        Ok(())
    }

    /// Wait until `entry` is committed, failing if leadership or the term
    /// changes first or the proposal timeout runs out
    pub(super) async fn wait_for_commit(
        &self,
        entry: &LogEntry,
        progress: watch::Receiver<NodeProgress>,
    ) -> BallotResult<()> {
        let timeout = self.inner.config.proposal_timeout;
        match tokio::time::timeout(timeout, await_commit(entry.term, entry.index, progress)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(node_id = %self.inner.id, index = entry.index, "Proposal timed out");
                Err(BallotError::Timeout {
                    operation: format!("commit of entry {}", entry.index),
                    duration: timeout,
                })
            }
        }
    }

    /// Send AppendEntries (or a snapshot) to every peer
    pub(super) async fn broadcast_append_entries(&self, state: &mut NodeState) -> BallotResult<()> {
        let peers: Vec<_> = state.progress.keys().cloned().collect();
        for peer in peers {
            self.replicate_to(state, &peer).await?;
        }
        Ok(())
    }

    /// Send `peer` the entries starting at its `next_index`, or a snapshot
    /// if it lags too far behind
    pub(super) async fn replicate_to(&self, state: &mut NodeState, peer: &str) -> BallotResult<()> {
        let Some(progress) = state.progress.get(peer).cloned() else {
            return Ok(());
        };
        let last_index = state.log.last().index;

        let lag = (last_index + 1).saturating_sub(progress.next_index);
        let threshold = self.inner.config.snapshot_lag_threshold;
        if threshold > 0 && lag >= threshold {
            if !progress.snapshot_in_flight {
                self.send_snapshot(state, peer).await?;
            }
            return Ok(());
        }

        let prev_log_index = progress.next_index.saturating_sub(1);
        let prev_log_term = state.log.term_at(prev_log_index)?.ok_or_else(|| {
            BallotError::internal(format!(
                "leader log has no entry at {} for peer {}",
                prev_log_index, peer
            ))
        })?;
        let end = progress.next_index + self.inner.config.max_append_entries as u64;
        let entries = state.log.slice(progress.next_index, Some(end))?;

        let term = state.current_term;
        let request = AppendEntriesRequest {
            term,
            leader_id: self.inner.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.inner.state_machine.commit_index(),
        };
        let sent = Sent::Append {
            term,
            prev_log_index,
            last_index: request.last_index(),
        };
        self.dispatch(peer, term, RaftRequest::AppendEntries(request), sent);
        Ok(())
    }

    async fn send_snapshot(&self, state: &mut NodeState, peer: &str) -> BallotResult<()> {
        let snapshot = self
            .inner
            .snapshotter
            .get_latest(&state.cluster, self.inner.state_machine.as_ref(), &state.log)
            .await?;
        let last_index = snapshot.last_index();
        info!(
            node_id = %self.inner.id,
            peer,
            last_index,
            commit_index = snapshot.commit_index(),
            "Sending snapshot to lagging peer"
        );

        if let Some(progress) = state.progress.get_mut(peer) {
            progress.snapshot_in_flight = true;
        }

        let term = state.current_term;
        let request = RaftRequest::InstallSnapshot(InstallSnapshotRequest {
            term,
            leader_id: self.inner.id.clone(),
            snapshot,
        });
        self.dispatch(peer, term, request, Sent::Snapshot { term, last_index });
        Ok(())
    }

    pub(super) async fn handle_append_response(
        &self,
        peer: &str,
        term: Term,
        prev_log_index: LogIndex,
        last_index: LogIndex,
        response: AppendEntriesResponse,
    ) -> BallotResult<()> {
        let mut state = self.inner.state.lock().await;

        if response.term > state.current_term {
            return self.become_follower(&mut state, response.term, None, false);
        }
        if state.role != Role::Leader || state.current_term != term {
            return Ok(());
        }

        let log_last = state.log.last().index;
        let Some(progress) = state.progress.get_mut(peer) else {
            return Ok(());
        };

        if response.success {
            progress.match_index = progress.match_index.max(last_index);
            progress.next_index = progress.next_index.max(last_index + 1);
            let behind = progress.next_index <= log_last;

            self.advance_commit(&mut state).await?;
            if behind {
                self.replicate_to(&mut state, peer).await?;
            }
        } else {
            // Back off to the rejected anchor, never below what is known to match
            let next = prev_log_index.max(progress.match_index + 1).max(1);
            if next < progress.next_index {
                debug!(
                    node_id = %self.inner.id,
                    peer,
                    from = progress.next_index,
                    to = next,
                    "Backing off next index"
                );
                progress.next_index = next;
                self.replicate_to(&mut state, peer).await?;
            }
        }
        Ok(())
    }

    pub(super) async fn handle_snapshot_response(
        &self,
        peer: &str,
        term: Term,
        last_index: LogIndex,
        response: InstallSnapshotResponse,
    ) -> BallotResult<()> {
        let mut state = self.inner.state.lock().await;

        if response.term > state.current_term {
            return self.become_follower(&mut state, response.term, None, false);
        }
        if state.role != Role::Leader || state.current_term != term {
            return Ok(());
        }

        let log_last = state.log.last().index;
        let Some(progress) = state.progress.get_mut(peer) else {
            return Ok(());
        };
        progress.snapshot_in_flight = false;

        if !response.ack {
            warn!(node_id = %self.inner.id, peer, "Snapshot refused");
            return Ok(());
        }

        progress.match_index = progress.match_index.max(last_index);
        progress.next_index = progress.next_index.max(last_index + 1);
        let behind = progress.next_index <= log_last;

        self.advance_commit(&mut state).await?;
        if behind {
            self.replicate_to(&mut state, peer).await?;
        }
        Ok(())
    }

    pub(super) async fn clear_snapshot_in_flight(&self, peer: &str, term: Term) {
        let mut state = self.inner.state.lock().await;
        if state.current_term != term {
            return;
        }
        if let Some(progress) = state.progress.get_mut(peer) {
            progress.snapshot_in_flight = false;
        }
    }

    /// Commit the highest current-term index replicated on a majority,
    /// apply it, and tell the followers right away
    pub(super) async fn advance_commit(&self, state: &mut NodeState) -> BallotResult<()> {
        if state.role != Role::Leader {
            return Ok(());
        }

        let commit_index = self.inner.state_machine.commit_index();
        let last_index = state.log.last().index;

        let mut new_commit = commit_index;
        for index in (commit_index + 1..=last_index).rev() {
            // Terms never decrease, so older terms only lie further back
            if state.log.term_at(index)? != Some(state.current_term) {
                break;
            }
            let replicated = state
                .progress
                .iter()
                .filter(|(_, progress)| progress.match_index >= index)
                .map(|(peer, _)| peer.as_str())
                .chain(std::iter::once(self.inner.id.as_str()));
            if state.cluster.is_majority(replicated) {
                new_commit = index;
                break;
            }
        }

        if new_commit > commit_index {
            self.apply_up_to(state, new_commit).await?;
            info!(node_id = %self.inner.id, commit_index = new_commit, "Committed entries");
            self.broadcast_append_entries(state).await?;
        }
        Ok(())
    }
}

async fn await_commit(
    term: Term,
    index: LogIndex,
    mut progress: watch::Receiver<NodeProgress>,
) -> BallotResult<()> {
    loop {
        {
            let current = progress.borrow_and_update();
            if current.term != term || current.role != Role::Leader {
                return Err(BallotError::NotLeader {
                    leader_id: current.leader_id.clone(),
                });
            }
            if current.commit_index >= index {
                return Ok(());
            }
        }
        progress.changed().await.map_err(|_| BallotError::Canceled)?;
    }
}
