use redb::{Database, Durability, ReadableTable, TableDefinition};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::cluster::MembershipRecord;
use crate::error::BallotResult;
use crate::storage::codec;
use crate::storage::{HardState, LogStorage, WriteBatch};
use crate::types::{LogEntry, LogIndex};

// Raft storage tables
pub const RAFT_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
pub const RAFT_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const HARD_STATE_KEY: &str = "hard_state";
const MEMBERSHIP_KEY: &str = "membership";

/// Durable storage backed by a redb database
#[derive(Clone)]
pub struct RedbStorage {
    pub database: Arc<Database>,
    sync_per_batch: bool,
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage")
            .field("sync_per_batch", &self.sync_per_batch)
            .finish()
    }
}

impl RedbStorage {
    /// Open (or create) the database at `path` and make sure both tables exist
    pub fn open(path: impl AsRef<Path>, sync_per_batch: bool) -> BallotResult<Self> {
        let database = Database::create(path.as_ref())?;
        Self::from_database(Arc::new(database), sync_per_batch)
    }

    pub fn from_database(database: Arc<Database>, sync_per_batch: bool) -> BallotResult<Self> {
        let write_txn = database.begin_write()?;
        {
            write_txn.open_table(RAFT_LOG_TABLE)?;
            write_txn.open_table(RAFT_META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            database,
            sync_per_batch,
        })
    }

    fn read_meta(&self, key: &str) -> BallotResult<Option<Vec<u8>>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(RAFT_META_TABLE)?;
        let value = table.get(key)?.map(|data| data.value().to_vec());
        Ok(value)
    }

    fn write_meta(&self, key: &str, data: &[u8]) -> BallotResult<()> {
        // Node properties are always written durably, whatever the batch policy
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(RAFT_META_TABLE)?;
            table.insert(key, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl LogStorage for RedbStorage {
    fn entry(&self, index: LogIndex) -> BallotResult<Option<LogEntry>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(RAFT_LOG_TABLE)?;
        let entry = match table.get(&index)? {
            Some(data) => Some(codec::deserialize_entry(index, data.value())?),
            None => None,
        };
        Ok(entry)
    }

    fn entries(&self, range: Range<LogIndex>) -> BallotResult<Vec<LogEntry>> {
        if range.start >= range.end {
            return Ok(Vec::new());
        }

        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(RAFT_LOG_TABLE)?;

        // Pre-allocate with estimated capacity to avoid reallocations
        let estimated_entries = std::cmp::min(range.end - range.start, 256) as usize;
        let mut entries = Vec::with_capacity(estimated_entries);
        for item in table.range(range)? {
            let (key, data) = item?;
            entries.push(codec::deserialize_entry(key.value(), data.value())?);
        }
        Ok(entries)
    }

    fn last_entry(&self) -> BallotResult<Option<LogEntry>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(RAFT_LOG_TABLE)?;
        let last = match table.last()? {
            Some((key, data)) => Some(codec::deserialize_entry(key.value(), data.value())?),
            None => None,
        };
        Ok(last)
    }

    #[instrument(skip(self, batch), fields(truncate_from = ?batch.truncation(), entries = batch.entries().len(), membership = batch.membership().is_some()))]
    fn write(&self, batch: WriteBatch) -> BallotResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut write_txn = self.database.begin_write()?;
        // Node properties are always written durably, whatever the batch policy
        if !self.sync_per_batch && batch.membership().is_none() {
            write_txn.set_durability(Durability::None);
        }

        {
            let mut table = write_txn.open_table(RAFT_LOG_TABLE)?;

            if let Some(from) = batch.truncation() {
                let doomed: Vec<u64> = table
                    .range(from..)?
                    .map(|item| item.map(|(key, _)| key.value()))
                    .collect::<Result<_, _>>()?;
                debug!("Truncating {} entries from index {}", doomed.len(), from);
                for index in doomed {
                    table.remove(&index)?;
                }
            }

            for entry in batch.entries() {
                let data = codec::serialize_entry(entry)?;
                table.insert(&entry.index, data.as_slice())?;
            }
        }

        if let Some(record) = batch.membership() {
            let data = codec::serialize_membership(record)?;
            let mut meta = write_txn.open_table(RAFT_META_TABLE)?;
            meta.insert(MEMBERSHIP_KEY, data.as_slice())?;
        }

        write_txn.commit()?;
        Ok(())
    }

    fn hard_state(&self) -> BallotResult<HardState> {
        match self.read_meta(HARD_STATE_KEY)? {
            Some(data) => codec::deserialize_hard_state(&data),
            None => {
                debug!("No hard state found in storage, using default");
                Ok(HardState::default())
            }
        }
    }

    fn save_hard_state(&self, state: &HardState) -> BallotResult<()> {
        let data = codec::serialize_hard_state(state)?;
        self.write_meta(HARD_STATE_KEY, &data)
    }

    fn membership(&self) -> BallotResult<Option<MembershipRecord>> {
        self.read_meta(MEMBERSHIP_KEY)?
            .map(|data| codec::deserialize_membership(&data))
            .transpose()
    }

    fn save_membership(&self, record: &MembershipRecord) -> BallotResult<()> {
        let data = codec::serialize_membership(record)?;
        self.write_meta(MEMBERSHIP_KEY, &data)
    }

    fn flush(&self) -> BallotResult<()> {
        // A durable commit persists every earlier non-durable one
        let write_txn = self.database.begin_write()?;
        write_txn.commit()?;
        Ok(())
    }
}
