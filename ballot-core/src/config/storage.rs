//! Storage configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::defaults::*;
use crate::error::{BallotError, BallotResult};

/// Which [`LogStorage`](crate::storage::LogStorage) backend a node opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile, for tests and simulations
    #[default]
    Memory,
    /// Durable redb database under `data_dir`
    Redb,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Data directory path
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`
    pub database_file: String,

    /// Fsync once per atomic batch. Disabling trades durability for speed
    /// and must only be used in tests.
    pub sync_per_batch: bool,

    /// Number of entries read per range scan while building a snapshot
    pub snapshot_read_batch: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            sync_per_batch: true,
            snapshot_read_batch: DEFAULT_SNAPSHOT_READ_BATCH,
        }
    }
}

impl StorageConfig {
    /// Load storage configuration from environment variables
    pub fn from_env() -> BallotResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BALLOT_STORAGE_BACKEND") {
            config.backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "redb" => StorageBackend::Redb,
                _ => {
                    return Err(BallotError::Config(format!(
                        "Invalid BALLOT_STORAGE_BACKEND: {}",
                        val
                    )))
                }
            };
        }

        if let Ok(dir) = std::env::var("BALLOT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(val) = std::env::var("BALLOT_SYNC_PER_BATCH") {
            config.sync_per_batch = val
                .parse()
                .map_err(|_| BallotError::Config("Invalid BALLOT_SYNC_PER_BATCH".to_string()))?;
        }

        Ok(config)
    }

    /// Validate storage configuration
    pub fn validate(&self) -> BallotResult<()> {
        if self.backend == StorageBackend::Redb && self.data_dir.as_os_str().is_empty() {
            return Err(BallotError::Config(
                "data_dir cannot be empty for the redb backend".to_string(),
            ));
        }

        if self.database_file.is_empty() {
            return Err(BallotError::Config(
                "database_file cannot be empty".to_string(),
            ));
        }

        if self.snapshot_read_batch == 0 {
            return Err(BallotError::Config(
                "snapshot_read_batch must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Database path for a given node, so nodes sharing a data dir don't collide
    pub fn database_path(&self, node_id: &str) -> PathBuf {
        self.data_dir.join(node_id).join(&self.database_file)
    }
}
