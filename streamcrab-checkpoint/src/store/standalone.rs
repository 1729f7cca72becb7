use super::*;

/// In-memory completed checkpoint store for single-process deployments.
pub struct StandaloneCompletedCheckpointStore {
    inner: RetainedCheckpoints,
}

impl StandaloneCompletedCheckpointStore {
    /// `max_retained` is raised to at least one.
    pub fn new(max_retained: usize, discarder: Arc<dyn CheckpointDiscarder>) -> Self {
        Self {
            inner: RetainedCheckpoints::new(max_retained, discarder),
        }
    }

    /// Subsumed records whose discard failed and awaits retry.
    pub fn pending_discards(&self) -> usize {
        self.inner.backlog_len()
    }
}

impl CompletedCheckpointStore for StandaloneCompletedCheckpointStore {
    fn add(&mut self, checkpoint: CompletedCheckpoint) -> Result<Vec<CheckpointId>> {
        self.inner.insert(checkpoint)?;
        Ok(self
            .inner
            .subsume()
            .into_iter()
            .map(|s| s.checkpoint_id)
            .collect())
    }

    fn latest(&self) -> Option<CompletedCheckpoint> {
        self.inner.latest().cloned()
    }

    fn list_all(&self) -> Vec<CompletedCheckpoint> {
        self.inner.iter().cloned().collect()
    }

    fn override_properties(
        &mut self,
        checkpoint_id: CheckpointId,
        properties: CheckpointProperties,
    ) -> Result<Option<CompletedCheckpoint>> {
        Ok(self.inner.set_properties(checkpoint_id, properties))
    }

    fn remove(&mut self, checkpoint_id: CheckpointId) -> Result<Option<CompletedCheckpoint>> {
        Ok(self.inner.remove(checkpoint_id))
    }

    fn shutdown(&mut self, status: JobStatus) -> Result<()> {
        self.inner.shutdown(status).into_result()
    }

    fn num_retained(&self) -> usize {
        self.inner.len()
    }

    fn max_retained(&self) -> usize {
        self.inner.max_retained()
    }
}
