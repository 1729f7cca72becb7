use super::*;

/// Removes a completed snapshot's data. Invoked on subsumption and shutdown.
pub trait CheckpointDiscarder: Send + Sync {
    fn discard(&self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()>;
}

/// Storage collaborator holding per-task state bytes.
///
/// The coordinator never interprets the handles; it persists them when a
/// checkpoint finalizes and asks for their removal when it is discarded.
pub trait CheckpointStorage: Send + Sync {
    fn persist_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        handle: &StateHandle,
    ) -> anyhow::Result<()>;

    fn load_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
    ) -> anyhow::Result<StateHandle>;

    fn discard_checkpoint(&self, checkpoint_id: CheckpointId) -> anyhow::Result<()>;

    /// Externally addressable location of a savepoint.
    fn external_pointer(
        &self,
        checkpoint_id: CheckpointId,
        properties: &CheckpointProperties,
    ) -> Option<String>;
}

/// In-memory checkpoint storage for tests and local single-process execution.
#[derive(Default)]
pub struct InMemoryCheckpointStorage {
    task_states: Mutex<HashMap<(CheckpointId, ExecutionAttemptId), StateHandle>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_checkpoints(&self) -> anyhow::Result<Vec<CheckpointId>> {
        let mut ids: Vec<_> = self
            .task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?
            .keys()
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

impl CheckpointStorage for InMemoryCheckpointStorage {
    fn persist_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        handle: &StateHandle,
    ) -> anyhow::Result<()> {
        self.task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?
            .insert((checkpoint_id, attempt), handle.clone());
        Ok(())
    }

    fn load_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
    ) -> anyhow::Result<StateHandle> {
        self.task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?
            .get(&(checkpoint_id, attempt))
            .cloned()
            .ok_or_else(|| anyhow!("task state not found for checkpoint {}", checkpoint_id))
    }

    fn discard_checkpoint(&self, checkpoint_id: CheckpointId) -> anyhow::Result<()> {
        self.task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?
            .retain(|(id, _), _| *id != checkpoint_id);
        Ok(())
    }

    fn external_pointer(
        &self,
        checkpoint_id: CheckpointId,
        properties: &CheckpointProperties,
    ) -> Option<String> {
        properties
            .is_savepoint()
            .then(|| format!("memory://savepoint-{checkpoint_id}"))
    }
}

impl CheckpointDiscarder for InMemoryCheckpointStorage {
    fn discard(&self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()> {
        self.discard_checkpoint(checkpoint.checkpoint_id)
    }
}

/// File-system checkpoint storage.
///
/// Layout: `<base>/chk-<id>/task-<attempt>.bin` for checkpoints and
/// `<base>/savepoint-<id>/...` for savepoints.
pub struct FsCheckpointStorage {
    base_path: PathBuf,
}

impl FsCheckpointStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).with_context(|| {
            format!(
                "failed to create checkpoint storage directory {}",
                base_path.display()
            )
        })?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn checkpoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        checkpoint_dir(&self.base_path, checkpoint_id)
    }

    fn savepoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.base_path.join(format!("savepoint-{checkpoint_id}"))
    }

    /// Savepoint data lives in its own directory so it survives checkpoint GC.
    fn data_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        let savepoint_dir = self.savepoint_dir(checkpoint_id);
        if savepoint_dir.exists() {
            savepoint_dir
        } else {
            self.checkpoint_dir(checkpoint_id)
        }
    }

    fn task_state_file(attempt: ExecutionAttemptId) -> String {
        format!(
            "task-{}-{}-{}.bin",
            attempt.vertex_id.0, attempt.subtask_index, attempt.attempt
        )
    }
}

impl CheckpointStorage for FsCheckpointStorage {
    fn persist_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        handle: &StateHandle,
    ) -> anyhow::Result<()> {
        let dir = self.data_dir(checkpoint_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        fs::write(dir.join(Self::task_state_file(attempt)), &handle.bytes)
            .context("write checkpoint task state failed")
    }

    fn load_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
    ) -> anyhow::Result<StateHandle> {
        let path = self
            .data_dir(checkpoint_id)
            .join(Self::task_state_file(attempt));
        let bytes = fs::read(&path)
            .with_context(|| format!("read checkpoint task state {} failed", path.display()))?;
        Ok(StateHandle::new(bytes))
    }

    fn discard_checkpoint(&self, checkpoint_id: CheckpointId) -> anyhow::Result<()> {
        for dir in [
            self.checkpoint_dir(checkpoint_id),
            self.savepoint_dir(checkpoint_id),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
        }
        Ok(())
    }

    fn external_pointer(
        &self,
        checkpoint_id: CheckpointId,
        properties: &CheckpointProperties,
    ) -> Option<String> {
        if !properties.is_savepoint() {
            return None;
        }
        let dir = self.savepoint_dir(checkpoint_id);
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::warn!("failed to create savepoint dir {}: {}", dir.display(), err);
            return None;
        }
        Some(dir.display().to_string())
    }
}

impl CheckpointDiscarder for FsCheckpointStorage {
    fn discard(&self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()> {
        self.discard_checkpoint(checkpoint.checkpoint_id)
    }
}

pub(crate) fn checkpoint_dir(base_path: &Path, checkpoint_id: CheckpointId) -> PathBuf {
    base_path.join(format!("chk-{checkpoint_id}"))
}
