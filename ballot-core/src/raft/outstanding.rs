//! Outstanding message table
//!
//! Every outbound RPC is registered here before its transport task starts.
//! Whoever removes an entry (the finished transport task or a canceler)
//! owns its completion, so each request completes exactly once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{BallotError, BallotResult};
use crate::raft::messages::{RaftRequest, RaftResponse, RequestKind};
use crate::transport::Transport;
use crate::types::{NodeId, Term};

pub type MessageId = u64;

pub type Completion = oneshot::Receiver<BallotResult<RaftResponse>>;

struct PendingRequest {
    to: NodeId,
    kind: RequestKind,
    term: Term,
    completion: oneshot::Sender<BallotResult<RaftResponse>>,
    task: Option<JoinHandle<()>>,
}

/// Metadata of an in-flight request, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: MessageId,
    pub to: NodeId,
    pub kind: RequestKind,
    pub term: Term,
}

#[derive(Default)]
pub struct OutstandingMessages {
    next_id: AtomicU64,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
}

impl OutstandingMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start delivering `request` on a spawned task. The returned receiver
    /// yields the response, a transport failure, or `Canceled`.
    pub fn send(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        from: NodeId,
        to: NodeId,
        term: Term,
        request: RaftRequest,
    ) -> (MessageId, Completion) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let kind = request.kind();

        // Registered before the task exists so a fast completion finds it
        let mut pending = self.pending.lock();
        pending.insert(
            id,
            PendingRequest {
                to: to.clone(),
                kind,
                term,
                completion: tx,
                task: None,
            },
        );

        let table = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = transport.call(&from, &to, request).await;
            table.complete(id, result);
        });

        if let Some(entry) = pending.get_mut(&id) {
            entry.task = Some(task);
        }

        trace!(id, %kind, "Registered outstanding request");
        (id, rx)
    }

    fn complete(&self, id: MessageId, result: BallotResult<RaftResponse>) {
        let entry = self.pending.lock().remove(&id);
        if let Some(entry) = entry {
            // The receiver may be gone; nobody is waiting then
            let _ = entry.completion.send(result);
        }
    }

    /// Fail one request with `Canceled`. Returns false if it already completed.
    pub fn cancel(&self, id: MessageId) -> bool {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(entry) => {
                Self::fire_canceled(entry);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with `Canceled`
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            Self::fire_canceled(entry);
        }
        if count > 0 {
            debug!(count, "Canceled outstanding requests");
        }
        count
    }

    fn fire_canceled(entry: PendingRequest) {
        if let Some(task) = entry.task {
            task.abort();
        }
        let _ = entry.completion.send(Err(BallotError::Canceled));
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut infos: Vec<PendingInfo> = self
            .pending
            .lock()
            .iter()
            .map(|(id, entry)| PendingInfo {
                id: *id,
                to: entry.to.clone(),
                kind: entry.kind,
                term: entry.term,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
