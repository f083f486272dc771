use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Range;

use crate::cluster::MembershipRecord;
use crate::error::BallotResult;
use crate::storage::{HardState, LogStorage, WriteBatch};
use crate::types::{LogEntry, LogIndex};

/// In-memory storage for tests and simulations
///
/// Nothing survives the process, but every operation has the same
/// atomicity as the durable backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    log: RwLock<BTreeMap<LogIndex, LogEntry>>,
    hard_state: RwLock<HardState>,
    membership: RwLock<Option<MembershipRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemoryStorage {
    fn entry(&self, index: LogIndex) -> BallotResult<Option<LogEntry>> {
        Ok(self.log.read().get(&index).cloned())
    }

    fn entries(&self, range: Range<LogIndex>) -> BallotResult<Vec<LogEntry>> {
        if range.start >= range.end {
            return Ok(Vec::new());
        }
        Ok(self.log.read().range(range).map(|(_, e)| e.clone()).collect())
    }

    fn last_entry(&self) -> BallotResult<Option<LogEntry>> {
        Ok(self.log.read().values().next_back().cloned())
    }

    fn write(&self, batch: WriteBatch) -> BallotResult<()> {
        let mut log = self.log.write();
        if let Some(from) = batch.truncation() {
            log.split_off(&from);
        }
        for entry in batch.entries() {
            log.insert(entry.index, entry.clone());
        }
        if let Some(record) = batch.membership() {
            *self.membership.write() = Some(record.clone());
        }
        Ok(())
    }

    fn hard_state(&self) -> BallotResult<HardState> {
        Ok(self.hard_state.read().clone())
    }

    fn save_hard_state(&self, state: &HardState) -> BallotResult<()> {
        *self.hard_state.write() = state.clone();
        Ok(())
    }

    fn membership(&self) -> BallotResult<Option<MembershipRecord>> {
        Ok(self.membership.read().clone())
    }

    fn save_membership(&self, record: &MembershipRecord) -> BallotResult<()> {
        *self.membership.write() = Some(record.clone());
        Ok(())
    }

    fn flush(&self) -> BallotResult<()> {
        Ok(())
    }
}
