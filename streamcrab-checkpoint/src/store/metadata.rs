use super::*;

/// A finalized snapshot, as registered in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub properties: CheckpointProperties,
    pub trigger_timestamp: Timestamp,
    pub completion_timestamp: Timestamp,
    /// Per-task state, owned by the storage collaborator.
    pub state_handles: BTreeMap<ExecutionAttemptId, StateHandle>,
    /// Location of a savepoint, if the storage assigned one.
    pub external_pointer: Option<String>,
}

impl CompletedCheckpoint {
    pub fn info(&self) -> CompletedCheckpointInfo {
        CompletedCheckpointInfo {
            checkpoint_id: self.checkpoint_id,
            properties: self.properties,
            trigger_timestamp: self.trigger_timestamp,
            completion_timestamp: self.completion_timestamp,
            num_tasks: self.state_handles.len(),
            external_pointer: self.external_pointer.clone(),
        }
    }

    pub fn is_savepoint(&self) -> bool {
        self.properties.is_savepoint()
    }

    pub fn duration_ms(&self) -> i64 {
        self.completion_timestamp - self.trigger_timestamp
    }
}

/// Lightweight reference to a completed snapshot handed back to triggerers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedCheckpointInfo {
    pub checkpoint_id: CheckpointId,
    pub properties: CheckpointProperties,
    pub trigger_timestamp: Timestamp,
    pub completion_timestamp: Timestamp,
    pub num_tasks: usize,
    pub external_pointer: Option<String>,
}
