//! Configuration for a Ballot node
//!
//! Structured configuration with defaults, TOML file loading, environment
//! variable overrides (`BALLOT_*`) and validation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cluster::{Members, MembershipRecord, PeerAttributes};
use crate::error::{BallotError, BallotResult};
use crate::types::NodeId;

pub mod defaults;
pub mod raft;
pub mod storage;

pub use defaults::*;
pub use raft::RaftConfig;
pub use storage::{StorageBackend, StorageConfig};

/// Root configuration structure for a Ballot node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BallotConfig {
    /// This node's id; must appear in `members`
    pub node_id: NodeId,

    /// Initial cluster membership
    pub members: Members,

    /// Raft consensus configuration
    pub raft: RaftConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for BallotConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            members: Members::new(),
            raft: RaftConfig::default(),
            storage: StorageConfig::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl BallotConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for `node_id` in a cluster of voters `ids`
    pub fn for_cluster<I, S>(node_id: impl Into<NodeId>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            node_id: node_id.into(),
            members: ids
                .into_iter()
                .map(|id| (id.into(), PeerAttributes::voter()))
                .collect(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> BallotResult<Self> {
        let mut config = Self {
            raft: RaftConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            ..Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> BallotResult<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| BallotError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: BallotConfig = toml::from_str(&contents)
            .map_err(|e| BallotError::Config(format!("Failed to parse TOML: {}", e)))?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("BALLOT_NODE_ID") {
            self.node_id = id;
        }
        if let Ok(members) = std::env::var("BALLOT_MEMBERS") {
            self.members = members
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| (id.to_string(), PeerAttributes::voter()))
                .collect();
        }
        if let Ok(dir) = std::env::var("BALLOT_DATA_DIR") {
            self.storage.data_dir = dir.into();
        }
        if let Ok(filter) = std::env::var("BALLOT_LOG_FILTER") {
            self.log_filter = filter;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> BallotResult<()> {
        if self.node_id.is_empty() {
            return Err(BallotError::Config("node_id cannot be empty".to_string()));
        }

        if !self.members.contains_key(&self.node_id) {
            return Err(BallotError::Config(format!(
                "node_id {} is not listed in members",
                self.node_id
            )));
        }

        self.raft.validate()?;
        self.storage.validate()?;

        Ok(())
    }

    /// The membership record this node bootstraps with
    pub fn membership(&self) -> MembershipRecord {
        MembershipRecord::Current(self.members.clone())
    }
}

/// Helper functions for duration parsing
pub(crate) fn parse_duration_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
