use super::*;

/// Retention bookkeeping shared by the store implementations.
pub(crate) struct RetainedCheckpoints {
    max_retained: usize,
    /// Ascending checkpoint id.
    checkpoints: VecDeque<CompletedCheckpoint>,
    /// Subsumed records whose discard failed; retried on shutdown.
    discard_backlog: Vec<CompletedCheckpoint>,
    discarder: Arc<dyn CheckpointDiscarder>,
}

pub(crate) struct Subsumed {
    pub checkpoint_id: CheckpointId,
    pub discarded: bool,
}

#[derive(Default)]
pub(crate) struct ShutdownOutcome {
    pub discarded: Vec<CheckpointId>,
    pub failures: Vec<CheckpointError>,
}

impl RetainedCheckpoints {
    pub fn new(max_retained: usize, discarder: Arc<dyn CheckpointDiscarder>) -> Self {
        Self {
            max_retained: max_retained.max(1),
            checkpoints: VecDeque::new(),
            discard_backlog: Vec::new(),
            discarder,
        }
    }

    pub fn max_retained(&self) -> usize {
        self.max_retained
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn latest(&self) -> Option<&CompletedCheckpoint> {
        self.checkpoints.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompletedCheckpoint> {
        self.checkpoints.iter()
    }

    pub fn backlog_len(&self) -> usize {
        self.discard_backlog.len()
    }

    pub fn ensure_absent(&self, checkpoint_id: CheckpointId) -> Result<()> {
        if self.checkpoints.iter().any(|c| c.checkpoint_id == checkpoint_id) {
            return Err(CheckpointError::AlreadyRegistered(checkpoint_id));
        }
        Ok(())
    }

    /// Insert keeping id order. Does not apply retention.
    pub fn insert(&mut self, checkpoint: CompletedCheckpoint) -> Result<()> {
        let id = checkpoint.checkpoint_id;
        self.ensure_absent(id)?;
        let pos = self
            .checkpoints
            .iter()
            .position(|c| c.checkpoint_id > id)
            .unwrap_or(self.checkpoints.len());
        self.checkpoints.insert(pos, checkpoint);
        Ok(())
    }

    /// Swap the properties of a registered record in place.
    pub fn set_properties(
        &mut self,
        checkpoint_id: CheckpointId,
        properties: CheckpointProperties,
    ) -> Option<CompletedCheckpoint> {
        let checkpoint = self
            .checkpoints
            .iter_mut()
            .find(|c| c.checkpoint_id == checkpoint_id)?;
        checkpoint.properties = properties;
        Some(checkpoint.clone())
    }

    pub fn remove(&mut self, checkpoint_id: CheckpointId) -> Option<CompletedCheckpoint> {
        let pos = self
            .checkpoints
            .iter()
            .position(|c| c.checkpoint_id == checkpoint_id)?;
        self.checkpoints.remove(pos)
    }

    /// Drop the oldest subsumable checkpoints until at most `max_retained`
    /// non-savepoint records remain, where possible.
    ///
    /// Savepoints never count and are never touched. Records whose properties
    /// do not allow discard-on-subsume stay, so the cap may be exceeded. The
    /// newest record is never subsumed.
    pub fn subsume(&mut self) -> Vec<Subsumed> {
        let retained = self
            .checkpoints
            .iter()
            .filter(|c| !c.is_savepoint())
            .count();
        if retained <= self.max_retained {
            return Vec::new();
        }
        let mut excess = retained - self.max_retained;
        let latest_id = self.checkpoints.back().map(|c| c.checkpoint_id);

        let mut victims = Vec::new();
        let mut kept = VecDeque::with_capacity(self.checkpoints.len());
        for checkpoint in self.checkpoints.drain(..) {
            let eligible = excess > 0
                && !checkpoint.is_savepoint()
                && checkpoint.properties.discard_on_subsumed()
                && Some(checkpoint.checkpoint_id) != latest_id;
            if eligible {
                excess -= 1;
                victims.push(checkpoint);
            } else {
                kept.push_back(checkpoint);
            }
        }
        self.checkpoints = kept;

        let mut subsumed = Vec::with_capacity(victims.len());
        for checkpoint in victims {
            let checkpoint_id = checkpoint.checkpoint_id;
            let discarded = match self.discarder.discard(&checkpoint) {
                Ok(()) => {
                    tracing::debug!("discarded subsumed checkpoint {}", checkpoint_id);
                    true
                }
                Err(err) => {
                    tracing::error!(
                        "failed to discard subsumed checkpoint {}: {:#}",
                        checkpoint_id,
                        err
                    );
                    self.discard_backlog.push(checkpoint);
                    false
                }
            };
            subsumed.push(Subsumed {
                checkpoint_id,
                discarded,
            });
        }
        subsumed
    }

    pub fn shutdown(&mut self, status: JobStatus) -> ShutdownOutcome {
        let mut outcome = ShutdownOutcome::default();

        let backlog = std::mem::take(&mut self.discard_backlog);
        for checkpoint in backlog {
            match self.discarder.discard(&checkpoint) {
                Ok(()) => outcome.discarded.push(checkpoint.checkpoint_id),
                Err(err) => {
                    outcome.failures.push(discard_failure(&checkpoint, &err));
                    self.discard_backlog.push(checkpoint);
                }
            }
        }

        let mut kept = VecDeque::with_capacity(self.checkpoints.len());
        for checkpoint in self.checkpoints.drain(..) {
            if !checkpoint.properties.discard_on_job_status(status) {
                kept.push_back(checkpoint);
                continue;
            }
            match self.discarder.discard(&checkpoint) {
                Ok(()) => outcome.discarded.push(checkpoint.checkpoint_id),
                Err(err) => {
                    outcome.failures.push(discard_failure(&checkpoint, &err));
                    kept.push_back(checkpoint);
                }
            }
        }
        self.checkpoints = kept;

        for failure in &outcome.failures {
            tracing::error!("{}", failure);
        }
        tracing::info!(
            "checkpoint store shut down with job status {}: discarded={:?} retained={}",
            status,
            outcome.discarded,
            self.checkpoints.len()
        );
        outcome
    }
}

fn discard_failure(checkpoint: &CompletedCheckpoint, err: &anyhow::Error) -> CheckpointError {
    CheckpointError::StorageDiscardFailure {
        checkpoint_id: checkpoint.checkpoint_id,
        message: format!("{err:#}"),
    }
}

impl ShutdownOutcome {
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(CheckpointError::DiscardFailures(self.failures))
        }
    }
}
