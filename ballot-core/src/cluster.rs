//! Cluster membership and quorum resolution
//!
//! A [`MembershipRecord`] is the replicated, serializable description of who
//! is in the cluster. A [`ClusterConfiguration`] is the immutable view a node
//! derives from a record: id sets and majority checks. During a membership
//! change the record is *joint*: it holds the old and the new member maps and
//! every majority must hold in both.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{BallotError, BallotResult};
use crate::types::NodeId;

/// Membership attributes of a single peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAttributes {
    pub voting: bool,
    /// Transport address; owned by the transport, carried here opaquely
    #[serde(default)]
    pub address: Option<String>,
}

impl PeerAttributes {
    pub fn voter() -> Self {
        Self {
            voting: true,
            address: None,
        }
    }

    pub fn learner() -> Self {
        Self {
            voting: false,
            address: None,
        }
    }
}

pub type Members = BTreeMap<NodeId, PeerAttributes>;

/// Replicated configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipRecord {
    Current(Members),
    Joint { old: Members, new: Members },
}

impl MembershipRecord {
    /// A plain configuration in which every listed id is a voter
    pub fn voters<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        MembershipRecord::Current(
            ids.into_iter()
                .map(|id| (id.into(), PeerAttributes::voter()))
                .collect(),
        )
    }

    pub fn is_joint(&self) -> bool {
        matches!(self, MembershipRecord::Joint { .. })
    }

    /// The configuration the cluster is moving to (or is in)
    pub fn latest(&self) -> &Members {
        match self {
            MembershipRecord::Current(members) => members,
            MembershipRecord::Joint { new, .. } => new,
        }
    }

    /// First half of a membership change: `Current(old)` → `Joint{old,new}`
    pub fn joint_to(&self, new: Members) -> BallotResult<Self> {
        match self {
            MembershipRecord::Current(old) => Ok(MembershipRecord::Joint {
                old: old.clone(),
                new,
            }),
            MembershipRecord::Joint { .. } => Err(BallotError::InvalidOperation {
                operation: "change membership".to_string(),
                reason: "a joint configuration is already in effect".to_string(),
            }),
        }
    }

    /// Second half of a membership change: `Joint{old,new}` → `Current(new)`
    pub fn finalize(&self) -> Self {
        MembershipRecord::Current(self.latest().clone())
    }
}

/// Id sets derived from a single member map
#[derive(Debug, Clone)]
struct MemberSet {
    all: BTreeSet<NodeId>,
    voting: BTreeSet<NodeId>,
}

impl MemberSet {
    fn from_members(members: &Members) -> BallotResult<Self> {
        if members.is_empty() {
            return Err(BallotError::Config(
                "membership map must contain at least one peer".to_string(),
            ));
        }
        Ok(Self {
            all: members.keys().cloned().collect(),
            voting: members
                .iter()
                .filter(|(_, attrs)| attrs.voting)
                .map(|(id, _)| id.clone())
                .collect(),
        })
    }

    fn majority_threshold(&self) -> usize {
        self.voting.len() / 2 + 1
    }

    fn is_majority(&self, ids: &BTreeSet<String>) -> bool {
        let votes = ids.iter().filter(|id| self.voting.contains(*id)).count();
        votes >= self.majority_threshold()
    }
}

#[derive(Debug, Clone)]
enum Configs {
    Current(MemberSet),
    Joint { old: MemberSet, new: MemberSet },
}

/// Immutable quorum view over a [`MembershipRecord`]
#[derive(Debug, Clone)]
pub struct ClusterConfiguration {
    self_id: NodeId,
    record: MembershipRecord,
    configs: Configs,
}

impl ClusterConfiguration {
    pub fn new(self_id: impl Into<NodeId>, record: MembershipRecord) -> BallotResult<Self> {
        let configs = match &record {
            MembershipRecord::Current(members) => {
                Configs::Current(MemberSet::from_members(members)?)
            }
            MembershipRecord::Joint { old, new } => Configs::Joint {
                old: MemberSet::from_members(old)?,
                new: MemberSet::from_members(new)?,
            },
        };
        Ok(Self {
            self_id: self_id.into(),
            record,
            configs,
        })
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn record(&self) -> &MembershipRecord {
        &self.record
    }

    pub fn is_joint(&self) -> bool {
        matches!(self.configs, Configs::Joint { .. })
    }

    /// Every id in any active configuration
    pub fn all_ids(&self) -> BTreeSet<NodeId> {
        match &self.configs {
            Configs::Current(set) => set.all.clone(),
            Configs::Joint { old, new } => old.all.union(&new.all).cloned().collect(),
        }
    }

    /// [`Self::all_ids`] without this node
    pub fn all_peer_ids(&self) -> BTreeSet<NodeId> {
        let mut ids = self.all_ids();
        ids.remove(&self.self_id);
        ids
    }

    /// Every id that votes in any active configuration
    pub fn voting_ids(&self) -> BTreeSet<NodeId> {
        match &self.configs {
            Configs::Current(set) => set.voting.clone(),
            Configs::Joint { old, new } => old.voting.union(&new.voting).cloned().collect(),
        }
    }

    pub fn voting_peer_ids(&self) -> BTreeSet<NodeId> {
        let mut ids = self.voting_ids();
        ids.remove(&self.self_id);
        ids
    }

    /// Whether `ids` (deduplicated) form a voting majority. In joint mode the
    /// majority must hold in the old and the new configuration independently.
    pub fn is_majority<I>(&self, ids: I) -> bool
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let ids: BTreeSet<String> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        match &self.configs {
            Configs::Current(set) => set.is_majority(&ids),
            Configs::Joint { old, new } => old.is_majority(&ids) && new.is_majority(&ids),
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        match &self.configs {
            Configs::Current(set) => set.all.contains(id),
            Configs::Joint { old, new } => old.all.contains(id) || new.all.contains(id),
        }
    }

    pub fn peer_exists(&self, id: &str) -> bool {
        id != self.self_id && self.exists(id)
    }

    pub fn voting_in_all_configs(&self, id: &str) -> bool {
        match &self.configs {
            Configs::Current(set) => set.voting.contains(id),
            Configs::Joint { old, new } => old.voting.contains(id) && new.voting.contains(id),
        }
    }

    pub fn voting_in_latest_config(&self, id: &str) -> bool {
        match &self.configs {
            Configs::Current(set) => set.voting.contains(id),
            Configs::Joint { new, .. } => new.voting.contains(id),
        }
    }
}
