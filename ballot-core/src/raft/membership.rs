//! Membership changes through joint consensus
//!
//! A change appends `Joint{old,new}`, waits for it to commit, then appends
//! `Current(new)`. Every membership entry takes effect on the node that
//! appends it, before it commits.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::cluster::{ClusterConfiguration, Members, MembershipRecord};
use crate::error::{BallotError, BallotResult};
use crate::raft::messages::ClientResponse;
use crate::raft::node::{NodeState, PeerProgress, RaftNode};
use crate::types::{Command, LogEntry, Role};

impl RaftNode {
    /// Move the cluster to `new_members`. Leader only.
    #[instrument(skip(self, new_members), fields(node_id = %self.inner.id, members = ?new_members.keys().collect::<Vec<_>>()))]
    pub async fn change_membership(&self, new_members: Members) -> BallotResult<ClientResponse> {
        if !new_members.values().any(|attrs| attrs.voting) {
            return Err(BallotError::InvalidOperation {
                operation: "change membership".to_string(),
                reason: "the new configuration has no voters".to_string(),
            });
        }

        let (joint_entry, progress) = {
            let mut state = self.inner.state.lock().await;
            self.ensure_leader(&state)?;
            let joint = state.cluster.record().joint_to(new_members)?;
            let progress = self.subscribe();
            (self.append_membership(&mut state, joint).await?, progress)
        };
        self.wait_for_commit(&joint_entry, progress).await?;
        info!(index = joint_entry.index, "Joint configuration committed");

        let (final_entry, progress) = {
            let mut state = self.inner.state.lock().await;
            self.ensure_leader(&state)?;
            if state.current_term != joint_entry.term || !state.cluster.is_joint() {
                return Err(BallotError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }
            let record = state.cluster.record().finalize();
            let progress = self.subscribe();
            (self.append_membership(&mut state, record).await?, progress)
        };
        self.wait_for_commit(&final_entry, progress).await?;
        info!(index = final_entry.index, "New configuration committed");

        {
            let mut state = self.inner.state.lock().await;
            if state.role == Role::Leader && !state.cluster.voting_in_latest_config(&self.inner.id) {
                info!("No longer a voter, leaving leadership");
                let term = state.current_term;
                self.become_follower(&mut state, term, None, false)?;
            }
        }

        Ok(ClientResponse {
            leader_id: Some(self.inner.id.clone()),
            entry_term: final_entry.term,
            entry_index: final_entry.index,
            success: true,
        })
    }

    async fn append_membership(
        &self,
        state: &mut NodeState,
        record: MembershipRecord,
    ) -> BallotResult<LogEntry> {
        let config = ClusterConfiguration::new(self.inner.id.clone(), record.clone())?;
        let entry = state
            .log
            .append_command(state.current_term, Command::Membership(record))
            .await?;

        self.adopt_configuration(state, config);
        self.advance_commit(state).await?;
        self.broadcast_append_entries(state).await?;
        Ok(entry)
    }

    /// Recompute the configuration from the log, falling back to the base
    /// membership persisted with the node
    pub(super) fn refresh_membership(&self, state: &mut NodeState) -> BallotResult<()> {
        let record = match state.log.latest_membership()? {
            Some(record) => record,
            None => match self.inner.storage.membership()? {
                Some(record) => record,
                None => return Ok(()),
            },
        };

        if &record != state.cluster.record() {
            let config = ClusterConfiguration::new(self.inner.id.clone(), record)?;
            self.adopt_configuration(state, config);
        }
        Ok(())
    }

    fn adopt_configuration(&self, state: &mut NodeState, config: ClusterConfiguration) {
        info!(
            node_id = %self.inner.id,
            joint = config.is_joint(),
            members = ?config.all_ids(),
            "Adopted configuration"
        );

        if state.role == Role::Leader {
            let peers = config.all_peer_ids();
            let next_index = state.log.next_index();
            state.progress.retain(|peer, _| peers.contains(peer));
            for peer in peers {
                state
                    .progress
                    .entry(peer)
                    .or_insert_with(|| PeerProgress::new(next_index));
            }
        }
        state.cluster = Arc::new(config);
    }
}
