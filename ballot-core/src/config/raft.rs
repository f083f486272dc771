//! Raft consensus configuration

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults::*;
use super::parse_duration_from_env;
use crate::error::{BallotError, BallotResult};

/// Raft consensus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound (inclusive) of the randomized election timeout, in ticks
    pub election_timeout_min_ticks: u32,

    /// Upper bound (exclusive) of the randomized election timeout, in ticks
    pub election_timeout_max_ticks: u32,

    /// Number of ticks between leader heartbeats
    pub heartbeat_interval_ticks: u32,

    /// Maximum number of entries carried by one AppendEntries request
    pub max_append_entries: usize,

    /// A follower lagging the leader's last index by at least this many
    /// entries is caught up with a snapshot. Zero disables snapshots.
    pub snapshot_lag_threshold: u64,

    /// How long a client request waits to be committed
    #[serde(with = "humantime_serde")]
    pub proposal_timeout: Duration,

    /// Wall-clock length of one tick, used by the driver
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ticks: DEFAULT_ELECTION_TIMEOUT_MIN_TICKS,
            election_timeout_max_ticks: DEFAULT_ELECTION_TIMEOUT_MAX_TICKS,
            heartbeat_interval_ticks: DEFAULT_HEARTBEAT_INTERVAL_TICKS,
            max_append_entries: DEFAULT_MAX_APPEND_ENTRIES,
            snapshot_lag_threshold: DEFAULT_SNAPSHOT_LAG_THRESHOLD,
            proposal_timeout: duration_ms(DEFAULT_PROPOSAL_TIMEOUT_MS),
            tick_interval: duration_ms(DEFAULT_TICK_INTERVAL_MS),
        }
    }
}

impl RaftConfig {
    /// Load Raft configuration from environment variables
    pub fn from_env() -> BallotResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BALLOT_ELECTION_TIMEOUT_MIN_TICKS") {
            config.election_timeout_min_ticks = val.parse().map_err(|_| {
                BallotError::Config("Invalid BALLOT_ELECTION_TIMEOUT_MIN_TICKS".to_string())
            })?;
        }

        if let Ok(val) = std::env::var("BALLOT_ELECTION_TIMEOUT_MAX_TICKS") {
            config.election_timeout_max_ticks = val.parse().map_err(|_| {
                BallotError::Config("Invalid BALLOT_ELECTION_TIMEOUT_MAX_TICKS".to_string())
            })?;
        }

        if let Ok(val) = std::env::var("BALLOT_HEARTBEAT_INTERVAL_TICKS") {
            config.heartbeat_interval_ticks = val.parse().map_err(|_| {
                BallotError::Config("Invalid BALLOT_HEARTBEAT_INTERVAL_TICKS".to_string())
            })?;
        }

        if let Ok(val) = std::env::var("BALLOT_MAX_APPEND_ENTRIES") {
            config.max_append_entries = val
                .parse()
                .map_err(|_| BallotError::Config("Invalid BALLOT_MAX_APPEND_ENTRIES".to_string()))?;
        }

        if let Ok(val) = std::env::var("BALLOT_SNAPSHOT_LAG_THRESHOLD") {
            config.snapshot_lag_threshold = val.parse().map_err(|_| {
                BallotError::Config("Invalid BALLOT_SNAPSHOT_LAG_THRESHOLD".to_string())
            })?;
        }

        config.proposal_timeout =
            parse_duration_from_env("BALLOT_PROPOSAL_TIMEOUT_MS", config.proposal_timeout);
        config.tick_interval =
            parse_duration_from_env("BALLOT_TICK_INTERVAL_MS", config.tick_interval);

        Ok(config)
    }

    /// Validate Raft configuration
    pub fn validate(&self) -> BallotResult<()> {
        if self.election_timeout_min_ticks == 0 {
            return Err(BallotError::Config(
                "election_timeout_min_ticks must be non-zero".to_string(),
            ));
        }

        if self.election_timeout_min_ticks >= self.election_timeout_max_ticks {
            return Err(BallotError::Config(
                "election_timeout_min_ticks must be less than election_timeout_max_ticks"
                    .to_string(),
            ));
        }

        // Followers must hear a heartbeat before any of them can time out
        if self.heartbeat_interval_ticks == 0
            || self.heartbeat_interval_ticks >= self.election_timeout_min_ticks
        {
            return Err(BallotError::Config(
                "heartbeat_interval_ticks must be in 1..election_timeout_min_ticks".to_string(),
            ));
        }

        if self.max_append_entries == 0 {
            return Err(BallotError::Config(
                "max_append_entries must be non-zero".to_string(),
            ));
        }

        if self.tick_interval < Duration::from_millis(1) {
            return Err(BallotError::Config(
                "tick_interval too small (min 1ms)".to_string(),
            ));
        }

        if self.proposal_timeout.is_zero() {
            return Err(BallotError::Config(
                "proposal_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Draw a fresh election timeout from the configured range
    pub fn random_election_timeout(&self) -> u32 {
        rand::thread_rng().gen_range(self.election_timeout_min_ticks..self.election_timeout_max_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_raft_config_is_valid() {
        let config = RaftConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_must_beat_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval_ticks: 10,
            election_timeout_min_ticks: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_election_range_is_invalid() {
        let config = RaftConfig {
            election_timeout_min_ticks: 12,
            election_timeout_max_ticks: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min_ticks);
            assert!(timeout < config.election_timeout_max_ticks);
        }
    }
}
