//! Message filtering for fault injection
//!
//! Filters sit in front of [`super::LocalTransport`] and decide per message
//! whether it is delivered. Partitions and lossy links are both expressed
//! this way.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

use crate::types::NodeId;

/// A filter that determines whether a message should be delivered
pub trait MessageFilter: Send + Sync {
    /// Returns true if the message should be delivered, false to drop it
    fn should_deliver(&self, from: &str, to: &str) -> bool;
}

/// Blocks messages between partition groups
#[derive(Clone, Default)]
pub struct PartitionFilter {
    partitions: Arc<RwLock<Vec<HashSet<NodeId>>>>,
}

impl PartitionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes in different groups cannot communicate. Nodes not listed in
    /// any group are isolated.
    pub fn set_partitions<G, S>(&self, groups: G)
    where
        G: IntoIterator,
        G::Item: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut partitions = self.partitions.write();
        partitions.clear();
        for group in groups {
            partitions.push(group.into_iter().map(Into::into).collect());
        }
    }

    /// Remove all partitions, allowing full communication
    pub fn heal(&self) {
        self.partitions.write().clear();
    }

    fn in_same_partition(&self, from: &str, to: &str) -> bool {
        let partitions = self.partitions.read();

        // No partitions defined
        if partitions.is_empty() {
            return true;
        }

        partitions
            .iter()
            .any(|group| group.contains(from) && group.contains(to))
    }
}

impl MessageFilter for PartitionFilter {
    fn should_deliver(&self, from: &str, to: &str) -> bool {
        self.in_same_partition(from, to)
    }
}

/// Randomly drops messages to simulate an unreliable network
pub struct RandomDropFilter {
    drop_rate: f64,
}

impl RandomDropFilter {
    /// `drop_rate` is clamped to `0.0..=1.0`
    pub fn new(drop_rate: f64) -> Self {
        Self {
            drop_rate: drop_rate.clamp(0.0, 1.0),
        }
    }
}

impl MessageFilter for RandomDropFilter {
    fn should_deliver(&self, _from: &str, _to: &str) -> bool {
        rand::random::<f64>() >= self.drop_rate
    }
}
