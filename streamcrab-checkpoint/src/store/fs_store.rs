use super::storage::checkpoint_dir;
use super::*;

const METADATA_FILE: &str = "_metadata";

/// Completed checkpoint store persisted on the local file system.
///
/// Each record lives in `<base>/chk-<id>/_metadata` (bincode). Opening the
/// store recovers every record found under `base`, so a restarted
/// coordinator sees the snapshots of the previous run.
pub struct FsCompletedCheckpointStore {
    base_path: PathBuf,
    inner: RetainedCheckpoints,
}

impl FsCompletedCheckpointStore {
    pub fn open(
        base_path: impl Into<PathBuf>,
        max_retained: usize,
        discarder: Arc<dyn CheckpointDiscarder>,
    ) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).with_context(|| {
            format!(
                "failed to create checkpoint store directory {}",
                base_path.display()
            )
        })?;

        let mut inner = RetainedCheckpoints::new(max_retained, discarder);
        for checkpoint in read_all_metadata(&base_path)? {
            inner.insert(checkpoint).map_err(|e| anyhow!("{e}"))?;
        }
        tracing::info!(
            "recovered {} completed checkpoint(s) from {}",
            inner.len(),
            base_path.display()
        );
        Ok(Self { base_path, inner })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn metadata_path(&self, checkpoint_id: CheckpointId) -> PathBuf {
        checkpoint_dir(&self.base_path, checkpoint_id).join(METADATA_FILE)
    }

    fn write_metadata(&self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()> {
        let dir = checkpoint_dir(&self.base_path, checkpoint.checkpoint_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        let bytes =
            bincode::serialize(checkpoint).context("serialize checkpoint metadata failed")?;
        // Write-then-rename so a crash never leaves a truncated record behind.
        let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
        fs::write(&tmp, bytes).context("write checkpoint metadata failed")?;
        fs::rename(&tmp, self.metadata_path(checkpoint.checkpoint_id))
            .context("publish checkpoint metadata failed")
    }

    fn delete_metadata(&self, checkpoint_id: CheckpointId) -> anyhow::Result<()> {
        let path = self.metadata_path(checkpoint_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        let dir = checkpoint_dir(&self.base_path, checkpoint_id);
        // Removes the directory only if the storage left nothing else in it.
        if dir.exists() && fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir).with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    fn delete_metadata_logged(&self, checkpoint_id: CheckpointId) {
        if let Err(err) = self.delete_metadata(checkpoint_id) {
            tracing::warn!(
                "failed to delete metadata of checkpoint {}: {:#}",
                checkpoint_id,
                err
            );
        }
    }
}

impl CompletedCheckpointStore for FsCompletedCheckpointStore {
    fn add(&mut self, checkpoint: CompletedCheckpoint) -> Result<Vec<CheckpointId>> {
        // The registered record owns chk-<id>/_metadata; never overwrite it.
        self.inner.ensure_absent(checkpoint.checkpoint_id)?;
        self.write_metadata(&checkpoint)?;
        self.inner.insert(checkpoint)?;
        let subsumed = self.inner.subsume();
        for s in &subsumed {
            // A failed discard keeps its metadata so the next run can retry.
            if s.discarded {
                self.delete_metadata_logged(s.checkpoint_id);
            }
        }
        Ok(subsumed.into_iter().map(|s| s.checkpoint_id).collect())
    }

    fn latest(&self) -> Option<CompletedCheckpoint> {
        self.inner.latest().cloned()
    }

    fn list_all(&self) -> Vec<CompletedCheckpoint> {
        self.inner.iter().cloned().collect()
    }

    /// Only the in-memory record changes; `_metadata` on disk is left as is.
    fn override_properties(
        &mut self,
        checkpoint_id: CheckpointId,
        properties: CheckpointProperties,
    ) -> Result<Option<CompletedCheckpoint>> {
        Ok(self.inner.set_properties(checkpoint_id, properties))
    }

    fn remove(&mut self, checkpoint_id: CheckpointId) -> Result<Option<CompletedCheckpoint>> {
        let removed = self.inner.remove(checkpoint_id);
        if removed.is_some() {
            self.delete_metadata(checkpoint_id)?;
        }
        Ok(removed)
    }

    fn shutdown(&mut self, status: JobStatus) -> Result<()> {
        let outcome = self.inner.shutdown(status);
        for checkpoint_id in &outcome.discarded {
            self.delete_metadata_logged(*checkpoint_id);
        }
        outcome.into_result()
    }

    fn num_retained(&self) -> usize {
        self.inner.len()
    }

    fn max_retained(&self) -> usize {
        self.inner.max_retained()
    }
}

/// Read every `chk-*/_metadata` record under `base_path`, ascending by id.
pub fn read_all_metadata(base_path: &Path) -> anyhow::Result<Vec<CompletedCheckpoint>> {
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(base_path)
        .with_context(|| format!("read_dir failed for {}", base_path.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(id_part) = name.strip_prefix("chk-") else {
            continue;
        };
        if id_part.parse::<CheckpointId>().is_err() {
            continue;
        }
        let path = entry.path().join(METADATA_FILE);
        if !path.exists() {
            // Directory of an attempt that never completed.
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("read checkpoint metadata {} failed", path.display()))?;
        let checkpoint: CompletedCheckpoint = bincode::deserialize(&bytes)
            .with_context(|| format!("deserialize checkpoint metadata {} failed", path.display()))?;
        checkpoints.push(checkpoint);
    }
    checkpoints.sort_by_key(|c| c.checkpoint_id);
    Ok(checkpoints)
}
