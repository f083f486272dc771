//! Default configuration values for Ballot
//!
//! This module centralizes all default values to make them easy to find and modify.

use std::time::Duration;

// Raft consensus defaults
pub const DEFAULT_ELECTION_TIMEOUT_MIN_TICKS: u32 = 10;
pub const DEFAULT_ELECTION_TIMEOUT_MAX_TICKS: u32 = 20;
pub const DEFAULT_HEARTBEAT_INTERVAL_TICKS: u32 = 3;
pub const DEFAULT_MAX_APPEND_ENTRIES: usize = 64;
pub const DEFAULT_SNAPSHOT_LAG_THRESHOLD: u64 = 1024;
pub const DEFAULT_PROPOSAL_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

// Storage defaults
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_DATABASE_FILE: &str = "raft.redb";
pub const DEFAULT_SNAPSHOT_READ_BATCH: usize = 256;

// Monitoring defaults
pub const DEFAULT_LOG_FILTER: &str = "ballot_core=info,ballot=info";

/// Helper function to create Duration from milliseconds
pub const fn duration_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
