//! Notification interfaces between the execution layer and the coordinator.

use std::sync::Arc;

use crate::error::CheckpointError;
use crate::types::{CheckpointId, ExecutionAttemptId, ExecutionState, Timestamp};

/// Called whenever a task attempt switches to a new execution state.
pub trait ExecutionStateUpdateListener: Send + Sync {
    fn on_state_update(
        &self,
        attempt: ExecutionAttemptId,
        previous: ExecutionState,
        new: ExecutionState,
    );
}

/// Fans one state update out to several listeners, in registration order.
///
/// Consumers must not rely on that order.
#[derive(Clone, Default)]
pub struct CombinedListener {
    listeners: Vec<Arc<dyn ExecutionStateUpdateListener>>,
}

impl CombinedListener {
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl ExecutionStateUpdateListener for CombinedListener {
    fn on_state_update(
        &self,
        attempt: ExecutionAttemptId,
        previous: ExecutionState,
        new: ExecutionState,
    ) {
        for listener in &self.listeners {
            listener.on_state_update(attempt, previous, new);
        }
    }
}

/// Compose several listeners into one.
pub fn combine(
    listeners: impl IntoIterator<Item = Arc<dyn ExecutionStateUpdateListener>>,
) -> CombinedListener {
    CombinedListener {
        listeners: listeners.into_iter().collect(),
    }
}

/// Observer of pending checkpoint lifecycle transitions.
///
/// Each callback fires exactly once per checkpoint attempt.
pub trait CheckpointLifecycleListener: Send + Sync {
    fn on_checkpoint_triggered(&self, _checkpoint_id: CheckpointId, _timestamp: Timestamp) {}

    fn on_checkpoint_completed(
        &self,
        checkpoint_id: CheckpointId,
        trigger_timestamp: Timestamp,
        completion_timestamp: Timestamp,
    );

    fn on_checkpoint_aborted(&self, checkpoint_id: CheckpointId, reason: &CheckpointError);
}

#[cfg(test)]
#[path = "tests/listener_tests.rs"]
mod tests;
