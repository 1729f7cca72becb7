use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds since epoch.
pub type Timestamp = i64;

/// Identifier of one checkpoint attempt. Globally ordered, never reused.
pub type CheckpointId = u64;

/// Unique identifier for a JobVertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(pub u32);

impl VertexId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Identity of one run of one parallel subtask.
///
/// Format: `vertex_{vertex}_{subtask}#{attempt}`. A restarted subtask gets a
/// new attempt number, so acknowledgments from a previous run never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionAttemptId {
    pub vertex_id: VertexId,
    pub subtask_index: usize,
    pub attempt: u32,
}

impl ExecutionAttemptId {
    pub fn new(vertex_id: VertexId, subtask_index: usize, attempt: u32) -> Self {
        Self {
            vertex_id,
            subtask_index,
            attempt,
        }
    }

    /// The same subtask, one attempt later.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..*self
        }
    }
}

impl std::fmt::Display for ExecutionAttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vertex_{}_{}#{}",
            self.vertex_id.0, self.subtask_index, self.attempt
        )
    }
}

/// Execution state of a single task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Scheduled,
    Deploying,
    Initializing,
    Running,
    Finished,
    Canceling,
    Canceled,
    Failed,
}

impl ExecutionState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Scheduled => "SCHEDULED",
            Self::Deploying => "DEPLOYING",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Terminal status of a job, used to decide which completed snapshots to
/// discard when the job goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Finished,
    Canceled,
    Failed,
    Suspended,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Finished => "FINISHED",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Suspended => "SUSPENDED",
        };
        f.write_str(name)
    }
}

/// Opaque reference to the state a task persisted for one checkpoint.
///
/// The coordinator never looks inside; it only tracks presence and hands the
/// handle to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHandle {
    pub bytes: Vec<u8>,
}

impl StateHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl From<Vec<u8>> for StateHandle {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

pub fn current_unix_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;
