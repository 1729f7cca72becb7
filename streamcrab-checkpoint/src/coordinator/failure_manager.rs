use super::*;

/// Invoked when checkpoint failures exceed what the job tolerates.
pub trait JobFailureHandler: Send + Sync {
    fn fail_job(&self, reason: &CheckpointError, consecutive_failures: u32);
}

/// Counts consecutive failed checkpoint attempts.
///
/// Only expirations, declines, unreachable tasks and storage failures count.
/// Subsumption and coordinator shutdown do not. A completed checkpoint resets
/// the counter. The handler fires once per breach.
pub struct CheckpointFailureManager {
    tolerable_failures: Option<u32>,
    consecutive_failures: u32,
    breached: bool,
    handler: Option<Arc<dyn JobFailureHandler>>,
}

impl CheckpointFailureManager {
    /// `None` tolerates any number of failures.
    pub fn new(tolerable_failures: Option<u32>) -> Self {
        Self {
            tolerable_failures,
            consecutive_failures: 0,
            breached: false,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobFailureHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn on_failure(&mut self, checkpoint_id: CheckpointId, reason: &CheckpointError) {
        if !reason.counts_as_failure() {
            return;
        }
        self.consecutive_failures += 1;
        let Some(tolerable) = self.tolerable_failures else {
            return;
        };
        if self.consecutive_failures <= tolerable || self.breached {
            return;
        }
        self.breached = true;
        tracing::error!(
            "checkpoint {} failed, exceeding the tolerable failure threshold of {} ({} consecutive): {}",
            checkpoint_id,
            tolerable,
            self.consecutive_failures,
            reason
        );
        if let Some(handler) = &self.handler {
            handler.fail_job(reason, self.consecutive_failures);
        }
    }

    pub fn on_success(&mut self, _checkpoint_id: CheckpointId) {
        self.consecutive_failures = 0;
        self.breached = false;
    }
}
