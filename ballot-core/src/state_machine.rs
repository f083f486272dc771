//! State machine contract
//!
//! The engine hands committed entries to a [`StateMachine`] in strict index
//! order. The state machine owns the commit index: it is the index of the
//! last entry it applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BallotError, BallotResult, SerializationContext};
use crate::types::{Command, LogEntry, LogIndex};

/// Opaque state machine image plus the index it reflects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineSnapshot {
    pub commit_index: LogIndex,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Index of the last applied entry
    fn commit_index(&self) -> LogIndex;

    /// Apply `entries` in order. The first entry must sit at
    /// `commit_index() + 1` and the rest must follow without gaps.
    async fn apply(&self, entries: &[LogEntry]) -> BallotResult<()>;

    async fn snapshot(&self) -> BallotResult<StateMachineSnapshot>;

    /// Replace the whole state with `snapshot`
    async fn restore(&self, snapshot: StateMachineSnapshot) -> BallotResult<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Register {
    commit_index: LogIndex,
    data: Option<Vec<u8>>,
    applied: u64,
}

/// Reference state machine: a single register holding the last data payload
#[derive(Debug, Default)]
pub struct RegisterStateMachine {
    inner: Mutex<Register>,
}

impl RegisterStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload of the last applied `Data` command
    pub fn data(&self) -> Option<Vec<u8>> {
        self.inner.lock().data.clone()
    }

    /// Number of `Data` commands applied so far
    pub fn applied(&self) -> u64 {
        self.inner.lock().applied
    }
}

#[async_trait]
impl StateMachine for RegisterStateMachine {
    fn commit_index(&self) -> LogIndex {
        self.inner.lock().commit_index
    }

    async fn apply(&self, entries: &[LogEntry]) -> BallotResult<()> {
        let mut register = self.inner.lock();

        let mut expected = register.commit_index + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(BallotError::internal(format!(
                    "out of order apply: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }

        for entry in entries {
            if let Command::Data(bytes) = &entry.command {
                register.data = Some(bytes.clone());
                register.applied += 1;
            }
            register.commit_index = entry.index;
        }

        if let Some(last) = entries.last() {
            debug!(commit_index = last.index, "Applied {} entries", entries.len());
        }
        Ok(())
    }

    async fn snapshot(&self) -> BallotResult<StateMachineSnapshot> {
        let register = self.inner.lock().clone();
        let data = bincode::serialize(&register).serialization_context("serialize register")?;
        Ok(StateMachineSnapshot {
            commit_index: register.commit_index,
            data,
        })
    }

    async fn restore(&self, snapshot: StateMachineSnapshot) -> BallotResult<()> {
        let mut register: Register =
            bincode::deserialize(&snapshot.data).serialization_context("deserialize register")?;
        register.commit_index = snapshot.commit_index;
        *self.inner.lock() = register;
        Ok(())
    }
}
