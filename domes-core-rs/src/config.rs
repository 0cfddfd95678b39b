//! Pod configuration
//!
//! Every protocol constant lives here with its default. All structs load from
//! JSON with `#[serde(default)]`, so a file only names what it overrides.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete pod configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    pub election: ElectionConfig,
    pub clock: ClockSyncConfig,
    pub command: CommandConfig,
    pub drill: DrillConfig,
}

/// Election windows and liveness timeouts (milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub discovery_window_ms: u64,
    pub campaign_window_ms: u64,
    pub vote_window_ms: u64,
    /// Master heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Heartbeat silence before a follower restarts discovery
    pub follower_timeout_ms: u64,
    /// Silence before a peer is evicted from the table
    pub peer_timeout_ms: u64,
    /// Unresolved elections before falling back to standalone master
    pub max_retries: u8,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            discovery_window_ms: 500,
            campaign_window_ms: 200,
            vote_window_ms: 300,
            heartbeat_interval_ms: 1_000,
            follower_timeout_ms: 3_000,
            peer_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

/// Clock synchronization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    /// Exchange period until the estimate has converged
    pub fast_interval_ms: u64,
    /// Exchange period once converged
    pub slow_interval_ms: u64,
    /// Give up on an unanswered request after this long
    pub request_timeout_ms: u64,
    /// Master time-beacon period
    pub beacon_interval_ms: u64,
    /// Samples with a larger round trip are discarded
    pub max_rtt_us: u64,
    /// Assumed one-way delay when seeding from a beacon
    pub beacon_one_way_us: u64,
    /// Beacon disagreement that triggers a drift nudge
    pub drift_threshold_us: u64,
    /// Accepted samples before the slow EMA weight applies
    pub fast_samples: u32,
    pub fast_alpha: f64,
    pub slow_alpha: f64,
    /// Estimate age after which quality starts to decay
    pub stale_after_ms: u64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 100,
            slow_interval_ms: 1_000,
            request_timeout_ms: 200,
            beacon_interval_ms: 1_000,
            max_rtt_us: 50_000,
            beacon_one_way_us: 1_000,
            drift_threshold_us: 2_000,
            fast_samples: 5,
            fast_alpha: 0.5,
            slow_alpha: 0.1,
            stale_after_ms: 5_000,
        }
    }
}

/// Pod command handler parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Retries for an event whose send failed
    pub event_retries: u8,
    pub retry_backoff_ms: u64,
    /// A pending event with no failure report after this long is delivered
    pub delivery_window_ms: u64,
    pub status_interval_ms: u64,
    /// Minimum clock quality for a scheduled effect to honour its start time
    pub min_sync_quality: u8,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            event_retries: 3,
            retry_backoff_ms: 50,
            delivery_window_ms: 100,
            status_interval_ms: 5_000,
            min_sync_quality: 50,
        }
    }
}

/// Drill interpreter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrillConfig {
    /// Pause between a resolved round and the next one
    pub inter_round_gap_ms: u64,
    /// Extra time past the round timeout for in-flight events
    pub deadline_grace_ms: u64,
    /// Lead time for synchronized effects
    pub sync_lead_ms: u64,
    /// Seed for random target selection (None = entropy)
    pub seed: Option<u64>,
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            inter_round_gap_ms: 200,
            deadline_grace_ms: 150,
            sync_lead_ms: 50,
            seed: None,
        }
    }
}

impl PodConfig {
    /// Load a configuration file (JSON) and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: PodConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.election;
        if e.discovery_window_ms == 0 || e.campaign_window_ms == 0 || e.vote_window_ms == 0 {
            return Err(ConfigError::Invalid("election windows must be non-zero".into()));
        }
        if e.heartbeat_interval_ms == 0 || e.heartbeat_interval_ms >= e.follower_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval {}ms must be below follower timeout {}ms",
                e.heartbeat_interval_ms, e.follower_timeout_ms
            )));
        }
        if e.peer_timeout_ms < e.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "peer timeout must be at least one heartbeat interval".into(),
            ));
        }

        let c = &self.clock;
        if c.fast_interval_ms == 0 || c.slow_interval_ms == 0 || c.beacon_interval_ms == 0 {
            return Err(ConfigError::Invalid("clock intervals must be non-zero".into()));
        }
        for (name, alpha) in [("fast_alpha", c.fast_alpha), ("slow_alpha", c.slow_alpha)] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(ConfigError::Invalid(format!("{} must be in (0, 1]", name)));
            }
        }
        if c.max_rtt_us == 0 {
            return Err(ConfigError::Invalid("max_rtt_us must be non-zero".into()));
        }

        if self.command.min_sync_quality > 100 {
            return Err(ConfigError::Invalid("min_sync_quality is a percentage".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PodConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.election.discovery_window_ms, 500);
        assert_eq!(config.clock.max_rtt_us, 50_000);
        assert_eq!(config.command.event_retries, 3);
    }

    #[test]
    fn test_partial_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "election": {{ "heartbeat_interval_ms": 500 }}, "drill": {{ "seed": 7 }} }}"#
        )
        .unwrap();

        let config = PodConfig::load(file.path()).unwrap();
        assert_eq!(config.election.heartbeat_interval_ms, 500);
        assert_eq!(config.election.follower_timeout_ms, 3_000);
        assert_eq!(config.drill.seed, Some(7));
        assert_eq!(config.clock, ClockSyncConfig::default());
    }

    #[test]
    fn test_rejects_heartbeat_above_timeout() {
        let mut config = PodConfig::default();
        config.election.heartbeat_interval_ms = 4_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_alpha() {
        let mut config = PodConfig::default();
        config.clock.slow_alpha = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(PodConfig::load(file.path()), Err(ConfigError::Json(_))));
    }
}
