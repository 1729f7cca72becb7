//! In-flight checkpoint attempt tracked by the coordinator.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{CheckpointError, Result};
use crate::listener::CheckpointLifecycleListener;
use crate::properties::CheckpointProperties;
use crate::store::{CompletedCheckpoint, CompletedCheckpointInfo};
use crate::types::{CheckpointId, ExecutionAttemptId, StateHandle, Timestamp};

/// Lifecycle of a pending checkpoint. `Completed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    InProgress,
    Completed,
    Aborted,
}

/// Outcome of one task acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    /// Recorded; other tasks still owe an acknowledgment.
    Accepted,
    /// This attempt had acknowledged before. Nothing changed.
    AlreadyAcknowledged,
    /// Recorded, and it was the last one outstanding. Produced exactly once.
    Completes,
    /// The attempt is not expected, or the checkpoint is no longer in progress.
    UnknownTask,
}

/// Resolves once the attempt completes or fails.
pub type CompletionReceiver = oneshot::Receiver<Result<CompletedCheckpointInfo>>;
type CompletionSender = oneshot::Sender<Result<CompletedCheckpointInfo>>;

pub struct PendingCheckpoint {
    checkpoint_id: CheckpointId,
    properties: CheckpointProperties,
    trigger_timestamp: Timestamp,
    expected: HashSet<ExecutionAttemptId>,
    acknowledged: BTreeMap<ExecutionAttemptId, StateHandle>,
    state: PendingState,
    failure: Option<CheckpointError>,
    listeners: Vec<Arc<dyn CheckpointLifecycleListener>>,
    completion: Option<CompletionSender>,
}

impl PendingCheckpoint {
    pub fn new(
        checkpoint_id: CheckpointId,
        properties: CheckpointProperties,
        trigger_timestamp: Timestamp,
        expected: impl IntoIterator<Item = ExecutionAttemptId>,
    ) -> Self {
        Self {
            checkpoint_id,
            properties,
            trigger_timestamp,
            expected: expected.into_iter().collect(),
            acknowledged: BTreeMap::new(),
            state: PendingState::InProgress,
            failure: None,
            listeners: Vec::new(),
            completion: None,
        }
    }

    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn CheckpointLifecycleListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Create the future that resolves when this attempt reaches a terminal state.
    pub fn completion_future(&mut self) -> CompletionReceiver {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn properties(&self) -> &CheckpointProperties {
        &self.properties
    }

    pub fn trigger_timestamp(&self) -> Timestamp {
        self.trigger_timestamp
    }

    pub fn state(&self) -> PendingState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == PendingState::InProgress
    }

    pub fn failure(&self) -> Option<&CheckpointError> {
        self.failure.as_ref()
    }

    pub fn expected_tasks(&self) -> &HashSet<ExecutionAttemptId> {
        &self.expected
    }

    pub fn num_acknowledged(&self) -> usize {
        self.acknowledged.len()
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.acknowledged.len() == self.expected.len()
    }

    pub fn is_acknowledged_by(&self, attempt: &ExecutionAttemptId) -> bool {
        self.acknowledged.contains_key(attempt)
    }

    /// Whether `attempt` participates and has not acknowledged yet.
    pub fn is_awaiting(&self, attempt: &ExecutionAttemptId) -> bool {
        self.expected.contains(attempt) && !self.acknowledged.contains_key(attempt)
    }

    /// Participants that still owe an acknowledgment, in attempt order.
    pub fn not_yet_acknowledged(&self) -> Vec<ExecutionAttemptId> {
        let mut tasks: Vec<_> = self
            .expected
            .iter()
            .filter(|t| !self.acknowledged.contains_key(t))
            .copied()
            .collect();
        tasks.sort_unstable();
        tasks
    }

    pub fn acknowledge(&mut self, attempt: ExecutionAttemptId, handle: StateHandle) -> AckResult {
        if self.state != PendingState::InProgress || !self.expected.contains(&attempt) {
            return AckResult::UnknownTask;
        }
        if self.acknowledged.contains_key(&attempt) {
            return AckResult::AlreadyAcknowledged;
        }
        self.acknowledged.insert(attempt, handle);
        if self.is_fully_acknowledged() {
            AckResult::Completes
        } else {
            AckResult::Accepted
        }
    }

    /// Build the record this attempt finalizes into. Does not change state.
    pub fn to_completed(
        &self,
        completion_timestamp: Timestamp,
        external_pointer: Option<String>,
    ) -> CompletedCheckpoint {
        CompletedCheckpoint {
            checkpoint_id: self.checkpoint_id,
            properties: self.properties,
            trigger_timestamp: self.trigger_timestamp,
            completion_timestamp,
            state_handles: self.acknowledged.clone(),
            external_pointer,
        }
    }

    /// Transition to `Completed` once the record has been persisted.
    ///
    /// Returns false if the attempt was not fully acknowledged or already terminal.
    pub fn mark_completed(&mut self, info: CompletedCheckpointInfo) -> bool {
        if self.state != PendingState::InProgress || !self.is_fully_acknowledged() {
            return false;
        }
        self.state = PendingState::Completed;
        for listener in &self.listeners {
            listener.on_checkpoint_completed(
                self.checkpoint_id,
                self.trigger_timestamp,
                info.completion_timestamp,
            );
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(info));
        }
        true
    }

    /// Abort the attempt. Idempotent; a no-op once terminal.
    ///
    /// Returns true if this call performed the transition.
    pub fn abort(&mut self, reason: CheckpointError) -> bool {
        if self.state != PendingState::InProgress {
            return false;
        }
        self.state = PendingState::Aborted;
        // Collected handles are released with the attempt.
        self.acknowledged.clear();
        for listener in &self.listeners {
            listener.on_checkpoint_aborted(self.checkpoint_id, &reason);
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(reason.clone()));
        }
        self.failure = Some(reason);
        true
    }
}

impl std::fmt::Debug for PendingCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCheckpoint")
            .field("checkpoint_id", &self.checkpoint_id)
            .field("properties", &self.properties)
            .field("trigger_timestamp", &self.trigger_timestamp)
            .field("expected", &self.expected.len())
            .field("acknowledged", &self.acknowledged.len())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/pending_tests.rs"]
mod tests;
