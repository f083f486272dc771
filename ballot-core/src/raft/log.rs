//! The command log: an index-addressed sequence of entries starting at the
//! sentinel, extended either by client appends or by replication streams
//! that pass the consistency check.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

use crate::cluster::MembershipRecord;
use crate::error::{BallotError, BallotResult};
use crate::state_machine::StateMachine;
use crate::storage::{LogStorage, WriteBatch};
use crate::types::{Command, LogEntry, LogIndex, Term};

const MEMBERSHIP_SCAN_BATCH: u64 = 256;

/// Result of a successful replication append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Index of the last entry of the stream, now known to match the leader
    pub last_index: LogIndex,
    /// Whether a conflicting suffix was dropped
    pub truncated: bool,
}

pub struct CommandLog {
    storage: Arc<dyn LogStorage>,
    state_machine: Arc<dyn StateMachine>,
    append_lock: Mutex<()>,
    last: RwLock<LogEntry>,
}

impl std::fmt::Debug for CommandLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLog")
            .field("last", &*self.last.read())
            .finish()
    }
}

impl CommandLog {
    /// Open a log over `storage`, writing the sentinel into an empty store
    pub async fn open(
        storage: Arc<dyn LogStorage>,
        state_machine: Arc<dyn StateMachine>,
    ) -> BallotResult<Self> {
        let last = match storage.last_entry()? {
            Some(last) => last,
            None => {
                let mut batch = WriteBatch::new();
                batch.put(LogEntry::sentinel());
                storage.write(batch)?;
                LogEntry::sentinel()
            }
        };

        if storage.entry(0)?.is_none() {
            return Err(BallotError::NotInitialized {
                component: "command log (missing sentinel)".to_string(),
            });
        }

        debug!(last_index = last.index, last_term = last.term, "Opened command log");
        Ok(Self {
            storage,
            state_machine,
            append_lock: Mutex::new(()),
            last: RwLock::new(last),
        })
    }

    /// Flush everything to durable media. The log stays usable.
    pub async fn close(&self) -> BallotResult<()> {
        let _guard = self.append_lock.lock().await;
        self.storage.flush()
    }

    pub fn last(&self) -> LogEntry {
        self.last.read().clone()
    }

    pub fn next_index(&self) -> LogIndex {
        self.last.read().index + 1
    }

    pub fn storage(&self) -> &Arc<dyn LogStorage> {
        &self.storage
    }

    /// Append a client command at the next free index
    pub async fn append_command(&self, term: Term, command: Command) -> BallotResult<LogEntry> {
        let _guard = self.append_lock.lock().await;

        let last = self.last();
        if term < last.term {
            return Err(BallotError::InvalidTerm {
                index: last.index + 1,
                term,
                reason: format!("below last log term {}", last.term),
            });
        }

        let entry = LogEntry::new(term, last.index + 1, command);
        let mut batch = WriteBatch::new();
        batch.put(entry.clone());
        self.storage.write(batch)?;

        *self.last.write() = entry.clone();
        Ok(entry)
    }

    /// Reconcile a replication stream with the log.
    ///
    /// `stream[0]` is the anchor and must already be present with the same
    /// term. Nothing is written unless the whole stream is valid.
    #[instrument(skip(self, stream), fields(anchor = ?stream.first().map(LogEntry::id), len = stream.len()))]
    pub async fn replicate(
        &self,
        stream: &[LogEntry],
        leader_term: Term,
    ) -> BallotResult<AppendOutcome> {
        let _guard = self.append_lock.lock().await;

        let (anchor, rest) = stream.split_first().ok_or_else(|| BallotError::InvalidOperation {
            operation: "replicate".to_string(),
            reason: "stream has no anchor entry".to_string(),
        })?;

        let found = self.storage.entry(anchor.index)?.map(|e| e.term);
        if found != Some(anchor.term) {
            return Err(BallotError::TermMismatch {
                index: anchor.index,
                expected: anchor.term,
                found,
            });
        }

        let commit_index = self.state_machine.commit_index();
        let mut batch = WriteBatch::new();
        let mut truncate_at = None;
        let mut prev = anchor.id();

        for entry in rest {
            if entry.index != prev.index + 1 {
                return Err(BallotError::InvalidIndex {
                    expected: prev.index + 1,
                    found: entry.index,
                });
            }
            if entry.term < prev.term {
                return Err(BallotError::InvalidTerm {
                    index: entry.index,
                    term: entry.term,
                    reason: format!("below previous entry term {}", prev.term),
                });
            }
            if entry.term > leader_term {
                return Err(BallotError::InvalidTerm {
                    index: entry.index,
                    term: entry.term,
                    reason: format!("above leader term {}", leader_term),
                });
            }

            if truncate_at.is_some() {
                // Everything past the cut is gone; write unconditionally
                batch.put(entry.clone());
            } else {
                match self.storage.entry(entry.index)? {
                    Some(existing) if existing.term == entry.term => {}
                    Some(existing) => {
                        if entry.index <= commit_index {
                            error!(
                                index = entry.index,
                                commit_index,
                                existing_term = existing.term,
                                incoming_term = entry.term,
                                "Refusing to truncate committed entries"
                            );
                            return Err(BallotError::internal(format!(
                                "truncation at index {} would drop committed entries (commit index {})",
                                entry.index, commit_index
                            )));
                        }
                        warn!(
                            index = entry.index,
                            existing_term = existing.term,
                            incoming_term = entry.term,
                            "Truncating conflicting log suffix"
                        );
                        truncate_at = Some(entry.index);
                        batch.put(entry.clone());
                    }
                    None => batch.put(entry.clone()),
                }
            }

            prev = entry.id();
        }

        if let Some(index) = truncate_at {
            batch = batch.truncate_from(index);
        }

        if !batch.is_empty() {
            self.storage.write(batch)?;
            let last = self
                .storage
                .last_entry()?
                .ok_or_else(|| BallotError::internal("log lost its sentinel"))?;
            *self.last.write() = last;
        }

        Ok(AppendOutcome {
            last_index: prev.index,
            truncated: truncate_at.is_some(),
        })
    }

    /// Entries in `[start, end)`, clipped to the log
    pub fn slice(&self, start: LogIndex, end: Option<LogIndex>) -> BallotResult<Vec<LogEntry>> {
        let end = match end {
            Some(end) => end.min(self.next_index()),
            None => self.next_index(),
        };
        if start >= end {
            return Ok(Vec::new());
        }
        self.storage.entries(start..end)
    }

    pub fn entry(&self, index: LogIndex) -> BallotResult<Option<LogEntry>> {
        self.storage.entry(index)
    }

    pub fn term_at(&self, index: LogIndex) -> BallotResult<Option<Term>> {
        Ok(self.storage.entry(index)?.map(|e| e.term))
    }

    /// The most recent membership record carried by the log, if any
    pub fn latest_membership(&self) -> BallotResult<Option<MembershipRecord>> {
        let mut end = self.next_index();
        while end > 0 {
            let start = end.saturating_sub(MEMBERSHIP_SCAN_BATCH);
            let entries = self.storage.entries(start..end)?;
            for entry in entries.into_iter().rev() {
                if let Command::Membership(record) = entry.command {
                    return Ok(Some(record));
                }
            }
            end = start;
        }
        Ok(None)
    }
}
