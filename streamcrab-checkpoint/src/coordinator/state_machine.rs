use super::*;

type SubtaskKey = (VertexId, usize);

/// Checkpoint coordinator state machine.
///
/// Plain `&mut self` API with explicit timestamps; it never blocks and never
/// spawns. [`CoordinatorService`] owns one instance and feeds it every input
/// in channel order.
pub struct CheckpointCoordinator {
    config: CheckpointCoordinatorConfig,
    next_checkpoint_id: CheckpointId,
    /// In-progress attempts only. Terminal attempts are removed.
    pending: BTreeMap<CheckpointId, PendingCheckpoint>,
    store: Box<dyn CompletedCheckpointStore>,
    storage: Arc<dyn CheckpointStorage>,
    gateway: Arc<dyn TaskGateway>,
    /// Current attempt of every registered subtask.
    tasks: BTreeMap<SubtaskKey, (ExecutionAttemptId, ExecutionState)>,
    last_trigger_start: Option<Timestamp>,
    lifecycle_listeners: Vec<Arc<dyn CheckpointLifecycleListener>>,
    failure_manager: CheckpointFailureManager,
    shut_down: bool,
}

impl CheckpointCoordinator {
    pub fn new(
        config: CheckpointCoordinatorConfig,
        store: Box<dyn CompletedCheckpointStore>,
        storage: Arc<dyn CheckpointStorage>,
        gateway: Arc<dyn TaskGateway>,
    ) -> Self {
        let failure_manager = CheckpointFailureManager::new(config.tolerable_failed_checkpoints);
        // Ids already in the store belong to earlier runs and are never reused.
        let next_checkpoint_id = store.latest().map_or(1, |c| c.checkpoint_id + 1);
        Self {
            config,
            next_checkpoint_id,
            pending: BTreeMap::new(),
            store,
            storage,
            gateway,
            tasks: BTreeMap::new(),
            last_trigger_start: None,
            lifecycle_listeners: Vec::new(),
            failure_manager,
            shut_down: false,
        }
    }

    pub fn with_lifecycle_listener(mut self, listener: Arc<dyn CheckpointLifecycleListener>) -> Self {
        self.lifecycle_listeners.push(listener);
        self
    }

    pub fn with_failure_handler(mut self, handler: Arc<dyn JobFailureHandler>) -> Self {
        self.failure_manager = self.failure_manager.with_handler(handler);
        self
    }

    pub fn config(&self) -> &CheckpointCoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn CompletedCheckpointStore {
        self.store.as_ref()
    }

    pub fn failure_manager(&self) -> &CheckpointFailureManager {
        &self.failure_manager
    }

    pub fn next_checkpoint_id(&self) -> CheckpointId {
        self.next_checkpoint_id
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_checkpoint_ids(&self) -> Vec<CheckpointId> {
        self.pending.keys().copied().collect()
    }

    pub fn pending_checkpoint(&self, checkpoint_id: CheckpointId) -> Option<&PendingCheckpoint> {
        self.pending.get(&checkpoint_id)
    }

    /// Current attempt and state of every registered subtask.
    pub fn tasks(&self) -> Vec<(ExecutionAttemptId, ExecutionState)> {
        self.tasks.values().copied().collect()
    }

    /// Register a subtask attempt. A newer attempt of the same subtask
    /// replaces the older one.
    pub fn register_task(&mut self, attempt: ExecutionAttemptId, state: ExecutionState) {
        let key = (attempt.vertex_id, attempt.subtask_index);
        match self.tasks.get(&key) {
            Some((current, _)) if current.attempt > attempt.attempt => {
                tracing::debug!("ignoring state of stale attempt {}", attempt);
            }
            _ => {
                self.tasks.insert(key, (attempt, state));
            }
        }
    }

    pub fn trigger_checkpoint(
        &mut self,
        properties: CheckpointProperties,
        now: Timestamp,
    ) -> Result<(CheckpointId, CompletionReceiver)> {
        if let Err(reason) = self.check_trigger(&properties, now) {
            tracing::debug!("checkpoint trigger rejected: {}", reason);
            return Err(CheckpointError::TriggerRejected(reason));
        }

        let checkpoint_id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        let expected: Vec<ExecutionAttemptId> =
            self.tasks.values().map(|(attempt, _)| *attempt).collect();

        let mut pending = PendingCheckpoint::new(checkpoint_id, properties, now, expected.clone())
            .with_listeners(self.lifecycle_listeners.clone());
        let completion = pending.completion_future();
        self.pending.insert(checkpoint_id, pending);
        self.last_trigger_start = Some(now);

        for listener in &self.lifecycle_listeners {
            listener.on_checkpoint_triggered(checkpoint_id, now);
        }
        for attempt in expected {
            self.gateway
                .trigger_checkpoint(attempt, checkpoint_id, now, &properties);
        }
        tracing::info!(
            "triggered {} {} at {} (forced={})",
            if properties.is_savepoint() {
                "savepoint"
            } else {
                "checkpoint"
            },
            checkpoint_id,
            now,
            properties.is_forced()
        );
        Ok((checkpoint_id, completion))
    }

    /// Trigger a periodic checkpoint with the configured retention policy.
    pub fn trigger_periodic(&mut self, now: Timestamp) -> Result<(CheckpointId, CompletionReceiver)> {
        self.trigger_checkpoint(self.config.checkpoint_properties(), now)
    }

    /// Trigger a standard savepoint. Savepoints are always forced.
    pub fn trigger_savepoint(
        &mut self,
        format: SavepointFormat,
        now: Timestamp,
    ) -> Result<(CheckpointId, CompletionReceiver)> {
        self.trigger_checkpoint(CheckpointProperties::for_savepoint(true, format), now)
    }

    fn check_trigger(
        &self,
        properties: &CheckpointProperties,
        now: Timestamp,
    ) -> std::result::Result<(), TriggerRejectReason> {
        if self.shut_down {
            return Err(TriggerRejectReason::CoordinatorShutdown);
        }
        if self.tasks.is_empty() {
            return Err(TriggerRejectReason::NoTasks);
        }
        if !self.tasks.values().all(|(_, state)| state.is_running()) {
            return Err(TriggerRejectReason::NotAllTasksRunning);
        }
        if properties.is_forced() {
            return Ok(());
        }
        if self.pending.len() >= self.config.max_concurrent_checkpoints {
            return Err(TriggerRejectReason::TooManyConcurrentCheckpoints);
        }
        if let Some(last) = self.last_trigger_start {
            let min_pause = self.config.min_pause_between_checkpoints.as_millis() as i64;
            if now - last < min_pause {
                return Err(TriggerRejectReason::MinimumTimeBetweenCheckpoints);
            }
        }
        Ok(())
    }

    /// Record one task acknowledgment.
    ///
    /// Acks for unknown or no longer pending checkpoints return
    /// [`AckResult::UnknownTask`]. Only a failure to persist the completed
    /// checkpoint is returned as an error; the attempt is aborted in that case.
    pub fn receive_ack(
        &mut self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        state: StateHandle,
        now: Timestamp,
    ) -> Result<AckResult> {
        let Some(pending) = self.pending.get_mut(&checkpoint_id) else {
            tracing::debug!(
                "received late ack from {} for checkpoint {}",
                attempt,
                checkpoint_id
            );
            return Ok(AckResult::UnknownTask);
        };
        let result = pending.acknowledge(attempt, state);
        match result {
            AckResult::Completes => self.complete_pending(checkpoint_id, now)?,
            AckResult::UnknownTask => tracing::debug!(
                "ack from {} does not belong to checkpoint {}",
                attempt,
                checkpoint_id
            ),
            AckResult::Accepted | AckResult::AlreadyAcknowledged => {}
        }
        Ok(result)
    }

    fn complete_pending(&mut self, checkpoint_id: CheckpointId, now: Timestamp) -> Result<()> {
        let mut pending = self
            .pending
            .remove(&checkpoint_id)
            .ok_or(CheckpointError::NotFound(checkpoint_id))?;

        let info = match self.finalize(&mut pending, now) {
            Ok(info) => info,
            Err(err) => {
                tracing::error!("failed to finalize checkpoint {}: {}", checkpoint_id, err);
                if let Err(discard_err) = self.storage.discard_checkpoint(checkpoint_id) {
                    tracing::warn!(
                        "failed to clean up checkpoint {}: {:#}",
                        checkpoint_id,
                        discard_err
                    );
                }
                pending.abort(err.clone());
                for attempt in pending.expected_tasks() {
                    self.gateway.abort_checkpoint(*attempt, checkpoint_id, &err);
                }
                self.failure_manager.on_failure(checkpoint_id, &err);
                return Err(err);
            }
        };

        // Forced attempts are left to finish on their own.
        let subsumed: Vec<CheckpointId> = self
            .pending
            .range(..checkpoint_id)
            .filter(|(_, p)| !p.properties().is_forced())
            .map(|(id, _)| *id)
            .collect();
        for id in subsumed {
            self.abort_pending(
                id,
                CheckpointError::Subsumed {
                    checkpoint_id: id,
                    by: checkpoint_id,
                },
            );
        }

        let mut participants: Vec<_> = pending.expected_tasks().iter().copied().collect();
        participants.sort_unstable();
        for attempt in participants {
            self.gateway.notify_checkpoint_complete(attempt, checkpoint_id);
        }
        self.failure_manager.on_success(checkpoint_id);
        tracing::info!(
            "completed checkpoint {} ({} tasks, {} ms)",
            checkpoint_id,
            info.num_tasks,
            info.completion_timestamp - info.trigger_timestamp
        );
        Ok(())
    }

    fn finalize(
        &mut self,
        pending: &mut PendingCheckpoint,
        now: Timestamp,
    ) -> Result<CompletedCheckpointInfo> {
        let checkpoint_id = pending.checkpoint_id();
        let external_pointer = self
            .storage
            .external_pointer(checkpoint_id, pending.properties());
        let completed = pending.to_completed(now, external_pointer);
        for (attempt, handle) in &completed.state_handles {
            self.storage
                .persist_task_state(checkpoint_id, *attempt, handle)?;
        }
        let info = completed.info();
        let subsumed = self.store.add(completed)?;
        if !subsumed.is_empty() {
            tracing::debug!(
                "checkpoint {} subsumed completed checkpoints {:?}",
                checkpoint_id,
                subsumed
            );
        }
        pending.mark_completed(info.clone());
        Ok(info)
    }

    /// A task refused to take part in a checkpoint. Returns whether an
    /// attempt was aborted.
    pub fn decline(
        &mut self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        reason: impl Into<String>,
    ) -> bool {
        let participates = self
            .pending
            .get(&checkpoint_id)
            .is_some_and(|p| p.expected_tasks().contains(&attempt));
        if !participates {
            tracing::debug!(
                "ignoring decline from {} for checkpoint {}",
                attempt,
                checkpoint_id
            );
            return false;
        }
        self.abort_pending(
            checkpoint_id,
            CheckpointError::DeclinedByTask {
                checkpoint_id,
                attempt,
                reason: reason.into(),
            },
        )
    }

    /// Apply a task state transition. Attempts leaving RUNNING abort every
    /// pending checkpoint still waiting on them.
    pub fn on_state_update(
        &mut self,
        attempt: ExecutionAttemptId,
        previous: ExecutionState,
        new: ExecutionState,
    ) {
        tracing::debug!("task {} switched from {} to {}", attempt, previous, new);
        self.register_task(attempt, new);
        if new.is_running() {
            return;
        }
        let affected: Vec<CheckpointId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.is_awaiting(&attempt))
            .map(|(id, _)| *id)
            .collect();
        for checkpoint_id in affected {
            self.abort_pending(
                checkpoint_id,
                CheckpointError::TaskUnreachable {
                    checkpoint_id,
                    attempt,
                },
            );
        }
    }

    /// Timeout of one attempt. A no-op if it already left the pending set.
    pub fn expire(&mut self, checkpoint_id: CheckpointId) -> bool {
        self.abort_pending(
            checkpoint_id,
            CheckpointError::ExpiredBeforeCompletion(checkpoint_id),
        )
    }

    fn abort_pending(&mut self, checkpoint_id: CheckpointId, reason: CheckpointError) -> bool {
        let Some(mut pending) = self.pending.remove(&checkpoint_id) else {
            return false;
        };
        let awaiting = pending.not_yet_acknowledged();
        if !pending.abort(reason.clone()) {
            return false;
        }
        for attempt in awaiting {
            self.gateway.abort_checkpoint(attempt, checkpoint_id, &reason);
        }
        match &reason {
            CheckpointError::Subsumed { .. } | CheckpointError::CoordinatorShutdown(_) => {
                tracing::info!("{}", reason)
            }
            _ => tracing::warn!("{}", reason),
        }
        self.failure_manager.on_failure(checkpoint_id, &reason);
        true
    }

    /// Select the snapshot to restore from: always the latest one.
    ///
    /// With [`RecoveryClaimMode::NoClaim`] the record is treated as an
    /// unclaimed snapshot for the rest of this run, so this job never discards
    /// it. The durable record keeps its properties. The id counter is moved
    /// past the restored id.
    pub fn restore_latest(
        &mut self,
        claim_mode: RecoveryClaimMode,
    ) -> Result<Option<CompletedCheckpoint>> {
        let Some(latest) = self.store.latest() else {
            tracing::info!("no completed checkpoint to restore from");
            return Ok(None);
        };
        let checkpoint_id = latest.checkpoint_id;
        let restored = match claim_mode {
            RecoveryClaimMode::Claim => latest,
            RecoveryClaimMode::NoClaim if latest.properties.is_unclaimed() => latest,
            RecoveryClaimMode::NoClaim => self
                .store
                .override_properties(checkpoint_id, CheckpointProperties::for_unclaimed_snapshot())?
                .ok_or(CheckpointError::NotFound(checkpoint_id))?,
        };
        self.next_checkpoint_id = self.next_checkpoint_id.max(checkpoint_id + 1);
        tracing::info!(
            "restoring from checkpoint {} ({:?}), next checkpoint id {}",
            checkpoint_id,
            claim_mode,
            self.next_checkpoint_id
        );
        Ok(Some(restored))
    }

    /// Explicit user deletion of a savepoint: unregister it and discard its data.
    pub fn dispose_savepoint(&mut self, checkpoint_id: CheckpointId) -> Result<CompletedCheckpoint> {
        let record = self
            .store
            .list_all()
            .into_iter()
            .find(|c| c.checkpoint_id == checkpoint_id)
            .ok_or(CheckpointError::NotFound(checkpoint_id))?;
        if !record.is_savepoint() {
            return Err(CheckpointError::NotASavepoint(checkpoint_id));
        }
        self.store.remove(checkpoint_id)?;
        self.storage.discard_checkpoint(checkpoint_id)?;
        tracing::info!("disposed savepoint {}", checkpoint_id);
        Ok(record)
    }

    /// Abort every pending attempt, reject later triggers and shut the store
    /// down for `job_status`. Repeated calls are no-ops.
    pub fn shutdown(&mut self, job_status: JobStatus) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let pending: Vec<CheckpointId> = self.pending.keys().copied().collect();
        for checkpoint_id in pending {
            self.abort_pending(
                checkpoint_id,
                CheckpointError::CoordinatorShutdown(checkpoint_id),
            );
        }
        tracing::info!("checkpoint coordinator shut down with job status {}", job_status);
        self.store.shutdown(job_status)
    }
}
