use super::*;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    pub triggered: u64,
    pub completed: u64,
    pub aborted: u64,
    pub latest_completed_id: Option<CheckpointId>,
    pub latest_completed_duration_ms: Option<i64>,
    pub latest_failure: Option<String>,
}

impl CheckpointStats {
    pub fn in_progress(&self) -> u64 {
        self.triggered.saturating_sub(self.completed + self.aborted)
    }
}

/// Lifecycle listener keeping running checkpoint counters.
#[derive(Debug, Default)]
pub struct CheckpointStatsTracker {
    stats: Mutex<CheckpointStats>,
}

impl CheckpointStatsTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> CheckpointStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut CheckpointStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *stats);
    }
}

impl CheckpointLifecycleListener for CheckpointStatsTracker {
    fn on_checkpoint_triggered(&self, _checkpoint_id: CheckpointId, _timestamp: Timestamp) {
        self.update(|stats| stats.triggered += 1);
    }

    fn on_checkpoint_completed(
        &self,
        checkpoint_id: CheckpointId,
        trigger_timestamp: Timestamp,
        completion_timestamp: Timestamp,
    ) {
        self.update(|stats| {
            stats.completed += 1;
            stats.latest_completed_id = Some(checkpoint_id);
            stats.latest_completed_duration_ms = Some(completion_timestamp - trigger_timestamp);
        });
    }

    fn on_checkpoint_aborted(&self, _checkpoint_id: CheckpointId, reason: &CheckpointError) {
        self.update(|stats| {
            stats.aborted += 1;
            stats.latest_failure = Some(reason.to_string());
        });
    }
}
