//! Snapshot bundles for catching up far-behind peers
//!
//! A [`Snapshot`] carries the membership record, an opaque state machine
//! image and the command log. The [`Snapshotter`] builds and materializes
//! bundles; moving them between nodes is the transport's business.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::cluster::{ClusterConfiguration, MembershipRecord};
use crate::config::DEFAULT_SNAPSHOT_READ_BATCH;
use crate::error::BallotResult;
use crate::raft::log::CommandLog;
use crate::state_machine::{StateMachine, StateMachineSnapshot};
use crate::storage::{LogStorage, WriteBatch};
use crate::types::{LogEntry, LogIndex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub membership: MembershipRecord,
    pub state_machine: StateMachineSnapshot,
    pub entries: Vec<LogEntry>,
}

impl Snapshot {
    pub fn commit_index(&self) -> LogIndex {
        self.state_machine.commit_index
    }

    /// Highest log index in the bundle
    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }
}

/// Everything a node needs to continue from a snapshot
pub struct RestoredSnapshot {
    pub config: ClusterConfiguration,
    pub state_machine: Arc<dyn StateMachine>,
    pub log: CommandLog,
}

#[derive(Debug, Clone)]
pub struct Snapshotter {
    read_batch: u64,
}

impl Default for Snapshotter {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_READ_BATCH)
    }
}

impl Snapshotter {
    pub fn new(read_batch: usize) -> Self {
        Self {
            read_batch: read_batch.max(1) as u64,
        }
    }

    /// Capture membership, state machine and log as one bundle
    pub async fn get_latest(
        &self,
        config: &ClusterConfiguration,
        state_machine: &dyn StateMachine,
        log: &CommandLog,
    ) -> BallotResult<Snapshot> {
        let state_machine = state_machine.snapshot().await?;

        let end = log.next_index();
        let mut entries = Vec::with_capacity(end as usize);
        let mut start = 0;
        while start < end {
            let batch_end = (start + self.read_batch).min(end);
            entries.extend(log.slice(start, Some(batch_end))?);
            start = batch_end;
        }

        Ok(Snapshot {
            membership: config.record().clone(),
            state_machine,
            entries,
        })
    }

    /// Replace the log and base membership in `storage` with one batch,
    /// then restore `state_machine` and open a fresh log on it.
    ///
    /// The log lands first so a restored state machine never runs ahead of
    /// the entries it claims to have applied.
    #[instrument(skip_all, fields(node_id = %self_id, commit_index = snapshot.commit_index(), last_index = snapshot.last_index()))]
    pub async fn read(
        &self,
        snapshot: Snapshot,
        self_id: &str,
        storage: Arc<dyn LogStorage>,
        state_machine: Arc<dyn StateMachine>,
    ) -> BallotResult<RestoredSnapshot> {
        let config = ClusterConfiguration::new(self_id, snapshot.membership.clone())?;

        let mut batch = WriteBatch::new()
            .truncate_from(0)
            .with_membership(snapshot.membership);
        for entry in snapshot.entries {
            batch.put(entry);
        }
        storage.write(batch)?;

        state_machine.restore(snapshot.state_machine).await?;

        let log = CommandLog::open(storage, state_machine.clone()).await?;
        info!(last_index = log.last().index, "Installed snapshot");

        Ok(RestoredSnapshot {
            config,
            state_machine,
            log,
        })
    }
}
