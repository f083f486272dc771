use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term};

#[derive(Error, Debug)]
pub enum BallotError {
    // Protocol rejections: expected outcomes of RPC validation.
    #[error("Term mismatch at index {index}: expected term {expected}, found {found:?}")]
    TermMismatch {
        index: LogIndex,
        expected: Term,
        found: Option<Term>,
    },

    #[error("Invalid index: expected {expected}, found {found}")]
    InvalidIndex { expected: LogIndex, found: LogIndex },

    #[error("Invalid term {term} at index {index}: {reason}")]
    InvalidTerm {
        index: LogIndex,
        term: Term,
        reason: String,
    },

    #[error("Not the leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    #[error("Invalid peer: {peer_id}")]
    InvalidPeer { peer_id: NodeId },

    #[error("Stale term {term}, current term is {current_term}")]
    StaleTerm { term: Term, current_term: Term },

    // Internal-consistency failures: a violated invariant, never retried.
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Not initialized: {component}")]
    NotInitialized { component: String },

    // Transport failures.
    #[error("Peer unreachable: {peer_id}")]
    Unreachable { peer_id: NodeId },

    #[error("Request canceled")]
    Canceled,

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BallotResult<T> = std::result::Result<T, BallotError>;

impl BallotError {
    /// Shorthand for an internal-consistency failure.
    pub fn internal(message: impl Into<String>) -> Self {
        BallotError::Internal {
            message: message.into(),
        }
    }

    /// True for rejections that a peer turns into a negative RPC response.
    pub fn is_protocol_rejection(&self) -> bool {
        matches!(
            self,
            BallotError::TermMismatch { .. }
                | BallotError::InvalidIndex { .. }
                | BallotError::InvalidTerm { .. }
                | BallotError::NotLeader { .. }
                | BallotError::InvalidPeer { .. }
                | BallotError::StaleTerm { .. }
        )
    }

    /// True for violated invariants that must never be silently retried.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            BallotError::Internal { .. } | BallotError::NotInitialized { .. }
        )
    }

    /// True for delivery failures that leave the node otherwise healthy.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BallotError::Unreachable { .. } | BallotError::Canceled | BallotError::Timeout { .. }
        )
    }
}

impl From<bincode::Error> for BallotError {
    fn from(err: bincode::Error) -> Self {
        BallotError::Serialization {
            operation: "bincode".to_string(),
            source: err,
        }
    }
}

impl From<redb::Error> for BallotError {
    fn from(err: redb::Error) -> Self {
        BallotError::Storage {
            operation: "redb".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::TransactionError> for BallotError {
    fn from(err: redb::TransactionError) -> Self {
        BallotError::Storage {
            operation: "transaction".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::TableError> for BallotError {
    fn from(err: redb::TableError) -> Self {
        BallotError::Storage {
            operation: "open table".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::StorageError> for BallotError {
    fn from(err: redb::StorageError) -> Self {
        BallotError::Storage {
            operation: "storage".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::DatabaseError> for BallotError {
    fn from(err: redb::DatabaseError) -> Self {
        BallotError::Storage {
            operation: "open database".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::CommitError> for BallotError {
    fn from(err: redb::CommitError) -> Self {
        BallotError::Storage {
            operation: "commit".to_string(),
            source: Box::new(err),
        }
    }
}

/// Adds operation context to storage and serialization failures
pub trait StorageContext<T> {
    fn storage_context(self, operation: &str) -> BallotResult<T>;
}

impl<T, E> StorageContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context(self, operation: &str) -> BallotResult<T> {
        self.map_err(|e| BallotError::Storage {
            operation: operation.to_string(),
            source: Box::new(e),
        })
    }
}

/// Adds operation context to (de)serialization failures
pub trait SerializationContext<T> {
    fn serialization_context(self, operation: &str) -> BallotResult<T>;
}

impl<T, E> SerializationContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn serialization_context(self, operation: &str) -> BallotResult<T> {
        self.map_err(|e| BallotError::Serialization {
            operation: operation.to_string(),
            source: Box::new(e),
        })
    }
}
