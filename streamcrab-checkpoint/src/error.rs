use std::sync::Arc;

use thiserror::Error;

use crate::types::{CheckpointId, ExecutionAttemptId};

/// Result type of the coordinator-facing API.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Why a trigger request was refused before any task was contacted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRejectReason {
    #[error("too many concurrent checkpoints")]
    TooManyConcurrentCheckpoints,
    #[error("minimum time between checkpoints not elapsed")]
    MinimumTimeBetweenCheckpoints,
    #[error("not all required tasks are currently running")]
    NotAllTasksRunning,
    #[error("no tasks registered")]
    NoTasks,
    #[error("coordinator is shut down")]
    CoordinatorShutdown,
}

#[derive(Error, Debug, Clone)]
pub enum CheckpointError {
    /// Recoverable; the caller may retry later.
    #[error("checkpoint trigger rejected: {0}")]
    TriggerRejected(TriggerRejectReason),

    /// Transient; the periodic scheduler will trigger a new attempt.
    #[error("checkpoint {0} expired before completing")]
    ExpiredBeforeCompletion(CheckpointId),

    /// A participating attempt left RUNNING before acknowledging.
    #[error("checkpoint {checkpoint_id} aborted: task {attempt} is no longer running")]
    TaskUnreachable {
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
    },

    #[error("checkpoint {checkpoint_id} declined by task {attempt}: {reason}")]
    DeclinedByTask {
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        reason: String,
    },

    #[error("checkpoint {checkpoint_id} subsumed by checkpoint {by}")]
    Subsumed {
        checkpoint_id: CheckpointId,
        by: CheckpointId,
    },

    #[error("checkpoint {0} aborted: coordinator shut down")]
    CoordinatorShutdown(CheckpointId),

    #[error("failed to discard checkpoint {checkpoint_id}: {message}")]
    StorageDiscardFailure {
        checkpoint_id: CheckpointId,
        message: String,
    },

    /// Every failed discard of one shutdown pass.
    #[error("{} checkpoint discard(s) failed", .0.len())]
    DiscardFailures(Vec<CheckpointError>),

    /// Programmer error: the policy name does not exist.
    #[error("unknown checkpoint retention policy: {0}")]
    UnknownPolicy(String),

    #[error("invalid checkpoint configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint {0} not found")]
    NotFound(CheckpointId),

    #[error("checkpoint {0} is not a savepoint")]
    NotASavepoint(CheckpointId),

    #[error("checkpoint {0} is already registered")]
    AlreadyRegistered(CheckpointId),

    /// Systemic failure of the metadata store or state storage.
    #[error("checkpoint storage failure: {0:#}")]
    Storage(Arc<anyhow::Error>),

    #[error("checkpoint coordinator service stopped")]
    ServiceStopped,
}

impl CheckpointError {
    /// Whether this failure counts against the tolerable failure budget.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Self::ExpiredBeforeCompletion(_)
                | Self::TaskUnreachable { .. }
                | Self::DeclinedByTask { .. }
                | Self::Storage(_)
        )
    }

    pub fn is_trigger_rejected(&self) -> bool {
        matches!(self, Self::TriggerRejected(_))
    }
}

impl From<anyhow::Error> for CheckpointError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(Arc::new(err))
    }
}
