//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CheckpointError, Result};
use crate::properties::{CheckpointProperties, CheckpointRetentionPolicy, RecoveryClaimMode};

/// Periodic checkpointing and retention settings of one job.
///
/// Durations are (de)serialized as integer milliseconds, e.g.
/// `{"interval_ms": 5000, "max_concurrent_checkpoints": 2}`. Missing fields
/// take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointCoordinatorConfig {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    #[serde(rename = "checkpoint_timeout_ms", with = "duration_ms")]
    pub checkpoint_timeout: Duration,
    /// Pause between the start of two non-forced attempts.
    #[serde(rename = "min_pause_between_checkpoints_ms", with = "duration_ms")]
    pub min_pause_between_checkpoints: Duration,
    pub max_concurrent_checkpoints: usize,
    pub max_retained_checkpoints: usize,
    /// Consecutive failed attempts tolerated before the job is failed.
    /// `None` tolerates any number.
    pub tolerable_failed_checkpoints: Option<u32>,
    pub retention_policy: CheckpointRetentionPolicy,
    pub claim_mode: RecoveryClaimMode,
}

impl Default for CheckpointCoordinatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            checkpoint_timeout: Duration::from_secs(600),
            min_pause_between_checkpoints: Duration::ZERO,
            max_concurrent_checkpoints: 1,
            max_retained_checkpoints: 3,
            tolerable_failed_checkpoints: None,
            retention_policy: CheckpointRetentionPolicy::default(),
            claim_mode: RecoveryClaimMode::default(),
        }
    }
}

impl CheckpointCoordinatorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_checkpoint_timeout(mut self, timeout: Duration) -> Self {
        self.checkpoint_timeout = timeout;
        self
    }

    pub fn with_min_pause_between_checkpoints(mut self, pause: Duration) -> Self {
        self.min_pause_between_checkpoints = pause;
        self
    }

    pub fn with_max_concurrent_checkpoints(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent_checkpoints = max_concurrent.max(1);
        self
    }

    pub fn with_retained_checkpoints(mut self, retained_checkpoints: usize) -> Self {
        self.max_retained_checkpoints = retained_checkpoints.max(1);
        self
    }

    pub fn with_tolerable_failed_checkpoints(mut self, tolerable: u32) -> Self {
        self.tolerable_failed_checkpoints = Some(tolerable);
        self
    }

    pub fn with_retention_policy(mut self, policy: CheckpointRetentionPolicy) -> Self {
        self.retention_policy = policy;
        self
    }

    pub fn with_claim_mode(mut self, claim_mode: RecoveryClaimMode) -> Self {
        self.claim_mode = claim_mode;
        self
    }

    /// Properties of the periodic checkpoints this configuration triggers.
    pub fn checkpoint_properties(&self) -> CheckpointProperties {
        CheckpointProperties::for_checkpoint(self.retention_policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(CheckpointError::InvalidConfig(
                "checkpoint interval must be positive".to_string(),
            ));
        }
        if self.checkpoint_timeout.is_zero() {
            return Err(CheckpointError::InvalidConfig(
                "checkpoint timeout must be positive".to_string(),
            ));
        }
        if self.max_concurrent_checkpoints == 0 {
            return Err(CheckpointError::InvalidConfig(
                "max_concurrent_checkpoints must be at least 1".to_string(),
            ));
        }
        if self.max_retained_checkpoints == 0 {
            return Err(CheckpointError::InvalidConfig(
                "max_retained_checkpoints must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
