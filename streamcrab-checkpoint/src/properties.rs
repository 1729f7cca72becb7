//! Checkpoint properties: what kind of snapshot an attempt produces and when
//! its data may be garbage collected.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::CheckpointError;
use crate::types::JobStatus;

/// Binary format a savepoint is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SavepointFormat {
    #[default]
    Canonical,
    Native,
}

/// Flavor of a savepoint. Synchronous savepoints stop the job afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SavepointKind {
    Standard,
    Suspend,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotType {
    Checkpoint,
    Savepoint {
        kind: SavepointKind,
        format: SavepointFormat,
    },
}

impl SnapshotType {
    pub fn is_savepoint(&self) -> bool {
        matches!(self, Self::Savepoint { .. })
    }

    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            Self::Savepoint {
                kind: SavepointKind::Suspend | SavepointKind::Terminate,
                ..
            }
        )
    }
}

/// What happens to regular checkpoints when the job terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointRetentionPolicy {
    #[default]
    NeverRetainAfterTermination,
    RetainOnFailure,
    RetainOnCancellation,
}

impl FromStr for CheckpointRetentionPolicy {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NEVER_RETAIN_AFTER_TERMINATION" => Ok(Self::NeverRetainAfterTermination),
            "RETAIN_ON_FAILURE" => Ok(Self::RetainOnFailure),
            "RETAIN_ON_CANCELLATION" => Ok(Self::RetainOnCancellation),
            _ => Err(CheckpointError::UnknownPolicy(s.to_string())),
        }
    }
}

/// How a restored snapshot is owned by the new job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryClaimMode {
    /// The job takes ownership and may subsume/discard the snapshot.
    #[default]
    Claim,
    /// The snapshot stays owned by whoever created it.
    NoClaim,
}

impl FromStr for RecoveryClaimMode {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CLAIM" => Ok(Self::Claim),
            "NO_CLAIM" => Ok(Self::NoClaim),
            _ => Err(CheckpointError::InvalidConfig(format!(
                "unknown recovery claim mode: {s}"
            ))),
        }
    }
}

/// Immutable descriptor of a snapshot's type and garbage collection policy.
///
/// Equality and hashing ignore `unclaimed`: two properties with identical
/// discard semantics compare equal whether or not they are unclaimed. Use
/// [`CheckpointProperties::is_unclaimed`] where that distinction matters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointProperties {
    snapshot_type: SnapshotType,
    /// Bypasses concurrency and min-pause limits; never subsumed while pending.
    forced: bool,
    discard_subsumed: bool,
    discard_finished: bool,
    discard_cancelled: bool,
    discard_failed: bool,
    discard_suspended: bool,
    unclaimed: bool,
}

const CHECKPOINT_NEVER_RETAINED: CheckpointProperties = CheckpointProperties {
    snapshot_type: SnapshotType::Checkpoint,
    forced: false,
    discard_subsumed: true,
    discard_finished: true,
    discard_cancelled: true,
    discard_failed: true,
    discard_suspended: true,
    unclaimed: false,
};

const CHECKPOINT_RETAINED_ON_FAILURE: CheckpointProperties = CheckpointProperties {
    discard_failed: false,
    ..CHECKPOINT_NEVER_RETAINED
};

const CHECKPOINT_RETAINED_ON_CANCELLATION: CheckpointProperties = CheckpointProperties {
    discard_cancelled: false,
    discard_failed: false,
    discard_suspended: false,
    ..CHECKPOINT_NEVER_RETAINED
};

impl CheckpointProperties {
    /// Properties of a periodic checkpoint under the given retention policy.
    pub const fn for_checkpoint(policy: CheckpointRetentionPolicy) -> Self {
        match policy {
            CheckpointRetentionPolicy::NeverRetainAfterTermination => CHECKPOINT_NEVER_RETAINED,
            CheckpointRetentionPolicy::RetainOnFailure => CHECKPOINT_RETAINED_ON_FAILURE,
            CheckpointRetentionPolicy::RetainOnCancellation => CHECKPOINT_RETAINED_ON_CANCELLATION,
        }
    }

    /// Like [`Self::for_checkpoint`], from a textual policy name.
    pub fn for_checkpoint_policy_name(name: &str) -> Result<Self, CheckpointError> {
        Ok(Self::for_checkpoint(name.parse()?))
    }

    /// A user-triggered savepoint. Never garbage collected automatically.
    pub const fn for_savepoint(forced: bool, format: SavepointFormat) -> Self {
        Self::savepoint(forced, SavepointKind::Standard, format, false)
    }

    /// A savepoint after which the job is stopped (`terminate`) or suspended.
    pub const fn for_sync_savepoint(forced: bool, terminate: bool, format: SavepointFormat) -> Self {
        let kind = if terminate {
            SavepointKind::Terminate
        } else {
            SavepointKind::Suspend
        };
        Self::savepoint(forced, kind, format, false)
    }

    /// Properties for a snapshot restored without claiming ownership.
    ///
    /// Only used when re-registering a restored snapshot, never to trigger.
    pub const fn for_unclaimed_snapshot() -> Self {
        Self::savepoint(
            false,
            SavepointKind::Standard,
            SavepointFormat::Canonical,
            true,
        )
    }

    const fn savepoint(
        forced: bool,
        kind: SavepointKind,
        format: SavepointFormat,
        unclaimed: bool,
    ) -> Self {
        Self {
            snapshot_type: SnapshotType::Savepoint { kind, format },
            forced,
            discard_subsumed: false,
            discard_finished: false,
            discard_cancelled: false,
            discard_failed: false,
            discard_suspended: false,
            unclaimed,
        }
    }

    pub fn snapshot_type(&self) -> SnapshotType {
        self.snapshot_type
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn is_unclaimed(&self) -> bool {
        self.unclaimed
    }

    pub fn is_savepoint(&self) -> bool {
        self.snapshot_type.is_savepoint()
    }

    pub fn is_synchronous(&self) -> bool {
        self.snapshot_type.is_synchronous()
    }

    pub fn discard_on_subsumed(&self) -> bool {
        self.discard_subsumed
    }

    pub fn discard_on_job_finished(&self) -> bool {
        self.discard_finished
    }

    pub fn discard_on_job_cancelled(&self) -> bool {
        self.discard_cancelled
    }

    pub fn discard_on_job_failed(&self) -> bool {
        self.discard_failed
    }

    pub fn discard_on_job_suspended(&self) -> bool {
        self.discard_suspended
    }

    /// Whether the snapshot's data goes away when the job ends in `status`.
    pub fn discard_on_job_status(&self, status: JobStatus) -> bool {
        match status {
            JobStatus::Finished => self.discard_finished,
            JobStatus::Canceled => self.discard_cancelled,
            JobStatus::Failed => self.discard_failed,
            JobStatus::Suspended => self.discard_suspended,
        }
    }
}

impl PartialEq for CheckpointProperties {
    fn eq(&self, other: &Self) -> bool {
        self.forced == other.forced
            && self.snapshot_type == other.snapshot_type
            && self.discard_subsumed == other.discard_subsumed
            && self.discard_finished == other.discard_finished
            && self.discard_cancelled == other.discard_cancelled
            && self.discard_failed == other.discard_failed
            && self.discard_suspended == other.discard_suspended
    }
}

impl Eq for CheckpointProperties {}

impl Hash for CheckpointProperties {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.forced.hash(state);
        self.snapshot_type.hash(state);
        self.discard_subsumed.hash(state);
        self.discard_finished.hash(state);
        self.discard_cancelled.hash(state);
        self.discard_failed.hash(state);
        self.discard_suspended.hash(state);
    }
}

impl std::fmt::Display for CheckpointProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CheckpointProperties{{forced={}, type={:?}, discard_subsumed={}, \
             discard_finished={}, discard_cancelled={}, discard_failed={}, \
             discard_suspended={}}}",
            self.forced,
            self.snapshot_type,
            self.discard_subsumed,
            self.discard_finished,
            self.discard_cancelled,
            self.discard_failed,
            self.discard_suspended
        )
    }
}

#[cfg(test)]
#[path = "tests/properties_tests.rs"]
mod tests;
