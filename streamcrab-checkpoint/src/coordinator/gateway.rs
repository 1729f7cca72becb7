use super::*;

/// Coordinator → task messages. Best effort and fire-and-forget: delivery
/// failures surface later as missing acks, timeouts or state updates.
pub trait TaskGateway: Send + Sync {
    fn trigger_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        timestamp: Timestamp,
        properties: &CheckpointProperties,
    );

    fn abort_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: &CheckpointError,
    );

    fn notify_checkpoint_complete(&self, attempt: ExecutionAttemptId, checkpoint_id: CheckpointId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Trigger {
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
    },
    Abort {
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
    },
    NotifyComplete {
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
    },
}

/// Gateway that only records what it was asked to deliver.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn triggered(&self, checkpoint_id: CheckpointId) -> Vec<ExecutionAttemptId> {
        self.collect(|call| match call {
            GatewayCall::Trigger {
                attempt,
                checkpoint_id: id,
            } if *id == checkpoint_id => Some(*attempt),
            _ => None,
        })
    }

    pub fn aborted(&self, checkpoint_id: CheckpointId) -> Vec<ExecutionAttemptId> {
        self.collect(|call| match call {
            GatewayCall::Abort {
                attempt,
                checkpoint_id: id,
            } if *id == checkpoint_id => Some(*attempt),
            _ => None,
        })
    }

    pub fn notified_complete(&self, checkpoint_id: CheckpointId) -> Vec<ExecutionAttemptId> {
        self.collect(|call| match call {
            GatewayCall::NotifyComplete {
                attempt,
                checkpoint_id: id,
            } if *id == checkpoint_id => Some(*attempt),
            _ => None,
        })
    }

    fn collect(
        &self,
        f: impl Fn(&GatewayCall) -> Option<ExecutionAttemptId>,
    ) -> Vec<ExecutionAttemptId> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(f)
            .collect()
    }

    fn record(&self, call: GatewayCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl TaskGateway for RecordingGateway {
    fn trigger_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        _timestamp: Timestamp,
        _properties: &CheckpointProperties,
    ) {
        self.record(GatewayCall::Trigger {
            attempt,
            checkpoint_id,
        });
    }

    fn abort_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        _reason: &CheckpointError,
    ) {
        self.record(GatewayCall::Abort {
            attempt,
            checkpoint_id,
        });
    }

    fn notify_checkpoint_complete(&self, attempt: ExecutionAttemptId, checkpoint_id: CheckpointId) {
        self.record(GatewayCall::NotifyComplete {
            attempt,
            checkpoint_id,
        });
    }
}
