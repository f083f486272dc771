//! Persistent store contract for the command log and node properties
//!
//! The engine needs only "durable once acknowledged" semantics from its
//! store: ordered range scans over log entries, point reads, atomic batched
//! writes, and a couple of node properties (term/vote and the base cluster
//! membership). [`MemoryStorage`] and [`RedbStorage`] implement it.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

use crate::cluster::MembershipRecord;
use crate::config::{StorageBackend, StorageConfig};
use crate::error::{BallotResult, StorageContext};
use crate::observability::storage_span;
use crate::types::{LogEntry, LogIndex, NodeId, Term};

pub mod codec;
pub mod memory;
pub mod redb_storage;

pub use self::memory::MemoryStorage;
pub use self::redb_storage::RedbStorage;

/// Node properties that must survive a crash to keep elections safe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// An atomic unit of log mutation: an optional truncation followed by puts,
/// optionally replacing the base membership record in the same commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    truncate_from: Option<LogIndex>,
    entries: Vec<LogEntry>,
    membership: Option<MembershipRecord>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry at or after `index` before the puts are applied
    pub fn truncate_from(mut self, index: LogIndex) -> Self {
        self.truncate_from = Some(match self.truncate_from {
            Some(existing) => existing.min(index),
            None => index,
        });
        self
    }

    pub fn put(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Replace the base membership together with the log changes
    pub fn with_membership(mut self, record: MembershipRecord) -> Self {
        self.membership = Some(record);
        self
    }

    pub fn truncation(&self) -> Option<LogIndex> {
        self.truncate_from
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn membership(&self) -> Option<&MembershipRecord> {
        self.membership.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.truncate_from.is_none() && self.entries.is_empty() && self.membership.is_none()
    }
}

/// Storage backend for one node. Exclusively owned by that node.
pub trait LogStorage: Send + Sync + 'static {
    /// Point read of a single entry
    fn entry(&self, index: LogIndex) -> BallotResult<Option<LogEntry>>;

    /// Ordered scan of the entries present in `range`
    fn entries(&self, range: Range<LogIndex>) -> BallotResult<Vec<LogEntry>>;

    /// Highest-index entry, if the store holds any
    fn last_entry(&self) -> BallotResult<Option<LogEntry>>;

    /// Apply a batch atomically; durable once this returns
    fn write(&self, batch: WriteBatch) -> BallotResult<()>;

    fn hard_state(&self) -> BallotResult<HardState>;

    fn save_hard_state(&self, state: &HardState) -> BallotResult<()>;

    /// Membership in force before the log's first membership entry
    fn membership(&self) -> BallotResult<Option<MembershipRecord>>;

    fn save_membership(&self, record: &MembershipRecord) -> BallotResult<()>;

    /// Force everything written so far to durable media
    fn flush(&self) -> BallotResult<()>;
}

/// Open the backend selected by `config` for `node_id`
pub fn open_storage(config: &StorageConfig, node_id: &str) -> BallotResult<Arc<dyn LogStorage>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::Redb => {
            let _span = storage_span("open", node_id).entered();
            let path = config.database_path(node_id);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).storage_context("create data directory")?;
            }
            Ok(Arc::new(RedbStorage::open(path, config.sync_per_batch)?))
        }
    }
}
