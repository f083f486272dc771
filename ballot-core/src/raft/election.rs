//! Candidacy and the transition to leader

use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use crate::error::BallotResult;
use crate::raft::messages::{RaftRequest, RequestVoteRequest, RequestVoteResponse};
use crate::raft::node::{NodeState, PeerProgress, RaftNode, Sent};
use crate::types::{Role, Term};

impl RaftNode {
    /// Election timeout: bump the term, vote for ourselves and solicit votes
    #[instrument(skip(self, state), fields(node_id = %self.inner.id, term = state.current_term + 1))]
    pub(super) async fn start_election(&self, state: &mut NodeState) -> BallotResult<()> {
        state.current_term += 1;
        state.voted_for = Some(self.inner.id.clone());
        self.persist_hard_state(state)?;

        state.role = Role::Candidate;
        state.leader_id = None;
        state.progress.clear();
        state.votes = BTreeSet::from([self.inner.id.clone()]);
        self.reset_election_timer(state);
        self.inner.outstanding.cancel_all();
        info!("Starting election");
        self.publish(state);

        // A single-voter cluster elects itself
        if state.cluster.is_majority(&state.votes) {
            return self.become_leader(state).await;
        }

        let last = state.log.last();
        let term = state.current_term;
        for peer in state.cluster.voting_peer_ids() {
            let request = RaftRequest::RequestVote(RequestVoteRequest {
                term,
                candidate_id: self.inner.id.clone(),
                last_log_index: last.index,
                last_log_term: last.term,
            });
            self.dispatch(&peer, term, request, Sent::Vote { term });
        }
        Ok(())
    }

    pub(super) async fn handle_vote_response(
        &self,
        peer: &str,
        term: Term,
        response: RequestVoteResponse,
    ) -> BallotResult<()> {
        let mut state = self.inner.state.lock().await;

        if response.term > state.current_term {
            return self.become_follower(&mut state, response.term, None, false);
        }
        if state.role != Role::Candidate || state.current_term != term {
            // Stale response from an earlier candidacy
            return Ok(());
        }
        if !response.vote_granted {
            debug!(node_id = %self.inner.id, peer, term, "Vote denied");
            return Ok(());
        }

        state.votes.insert(peer.to_string());
        debug!(node_id = %self.inner.id, peer, term, votes = state.votes.len(), "Vote granted");

        if state.cluster.is_majority(&state.votes) {
            self.become_leader(&mut state).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, state), fields(node_id = %self.inner.id, term = state.current_term))]
    pub(super) async fn become_leader(&self, state: &mut NodeState) -> BallotResult<()> {
        state.role = Role::Leader;
        state.leader_id = Some(self.inner.id.clone());
        state.votes.clear();

        let next_index = state.log.next_index();
        state.progress = state
            .cluster
            .all_peer_ids()
            .into_iter()
            .map(|peer| (peer, PeerProgress::new(next_index)))
            .collect();
        state.heartbeat_remaining = self.inner.config.heartbeat_interval_ticks;

        self.inner.outstanding.cancel_all();
        info!(last_index = next_index - 1, "Became leader");
        self.publish(state);

        // Assert authority before serving clients
        self.broadcast_append_entries(state).await
    }
}
