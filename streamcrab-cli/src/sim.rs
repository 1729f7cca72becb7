//! Simulated job: parallel subtasks that count records, take part in
//! checkpoints and fail according to a [`FailureStrategy`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use streamcrab_checkpoint::config::CheckpointCoordinatorConfig;
use streamcrab_checkpoint::coordinator::{
    CheckpointCoordinator, CheckpointStats, CheckpointStatsTracker, CoordinatorHandle,
    CoordinatorService, JobFailureHandler, TaskGateway,
};
use streamcrab_checkpoint::error::CheckpointError;
use streamcrab_checkpoint::listener::{ExecutionStateUpdateListener, combine};
use streamcrab_checkpoint::properties::{CheckpointProperties, RecoveryClaimMode};
use streamcrab_checkpoint::store::{
    CompletedCheckpoint, CompletedCheckpointInfo, FsCheckpointStorage, FsCompletedCheckpointStore,
};
use streamcrab_checkpoint::strategy::{
    FailureDecision, FailureKind, FailureStrategy, FailureTracker, RestartStrategy,
};
use streamcrab_checkpoint::types::{
    CheckpointId, ExecutionAttemptId, ExecutionState, JobStatus, StateHandle, Timestamp, VertexId,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

const SIM_VERTEX: VertexId = VertexId(1);

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub base_path: PathBuf,
    pub parallelism: usize,
    /// Stop once this many checkpoints completed.
    pub target_checkpoints: u64,
    pub record_interval: Duration,
    /// Subtask 0 throws on the n-th checkpoint trigger it sees.
    pub fail_after: Option<u32>,
    /// The last subtask declines the n-th checkpoint trigger it sees.
    pub decline_after: Option<u32>,
    pub restart: RestartStrategy,
    pub max_runtime: Duration,
    pub coordinator: CheckpointCoordinatorConfig,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub job_status: JobStatus,
    pub restored_from: Option<CheckpointId>,
    pub restarts: u32,
    pub stats: CheckpointStats,
    pub completed: Vec<CompletedCheckpointInfo>,
}

#[derive(Debug)]
enum TaskCommand {
    Trigger(CheckpointId),
    Abort(CheckpointId),
    Complete(CheckpointId),
}

type SubtaskKey = (VertexId, usize);

/// Routes coordinator messages to the current attempt of each subtask.
/// Messages for superseded attempts are dropped.
#[derive(Default)]
struct SimGateway {
    tasks: Mutex<HashMap<SubtaskKey, (ExecutionAttemptId, mpsc::UnboundedSender<TaskCommand>)>>,
}

impl SimGateway {
    fn register(&self, attempt: ExecutionAttemptId, tx: mpsc::UnboundedSender<TaskCommand>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((attempt.vertex_id, attempt.subtask_index), (attempt, tx));
    }

    fn deliver(&self, attempt: ExecutionAttemptId, command: TaskCommand) {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(&(attempt.vertex_id, attempt.subtask_index)) {
            Some((current, tx)) if *current == attempt => {
                let _ = tx.send(command);
            }
            _ => tracing::debug!("dropping {:?} for stale attempt {}", command, attempt),
        }
    }
}

impl TaskGateway for SimGateway {
    fn trigger_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        _timestamp: Timestamp,
        _properties: &CheckpointProperties,
    ) {
        self.deliver(attempt, TaskCommand::Trigger(checkpoint_id));
    }

    fn abort_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        _reason: &CheckpointError,
    ) {
        self.deliver(attempt, TaskCommand::Abort(checkpoint_id));
    }

    fn notify_checkpoint_complete(&self, attempt: ExecutionAttemptId, checkpoint_id: CheckpointId) {
        self.deliver(attempt, TaskCommand::Complete(checkpoint_id));
    }
}

struct LoggingStateListener;

impl ExecutionStateUpdateListener for LoggingStateListener {
    fn on_state_update(
        &self,
        attempt: ExecutionAttemptId,
        previous: ExecutionState,
        new: ExecutionState,
    ) {
        tracing::info!("task {} switched from {} to {}", attempt, previous, new);
    }
}

/// Publishes the job failure so the runner can stop the job.
struct WatchFailureHandler {
    tx: watch::Sender<Option<String>>,
}

impl JobFailureHandler for WatchFailureHandler {
    fn fail_job(&self, reason: &CheckpointError, consecutive_failures: u32) {
        let _ = self.tx.send(Some(format!(
            "{reason} ({consecutive_failures} consecutive checkpoint failures)"
        )));
    }
}

enum TaskResult {
    Finished,
    Failed(FailureKind),
}

struct TaskOutcome {
    attempt: ExecutionAttemptId,
    strategy: FailureStrategy,
    result: TaskResult,
}

struct SimTask {
    attempt: ExecutionAttemptId,
    records: u64,
    record_interval: Duration,
    strategy: FailureStrategy,
    commands: mpsc::UnboundedReceiver<TaskCommand>,
    coordinator: CoordinatorHandle,
    listener: Arc<dyn ExecutionStateUpdateListener>,
    stop: watch::Receiver<bool>,
}

impl SimTask {
    async fn run(mut self) -> TaskOutcome {
        let attempt = self.attempt;
        self.listener
            .on_state_update(attempt, ExecutionState::Created, ExecutionState::Deploying);
        self.listener
            .on_state_update(attempt, ExecutionState::Deploying, ExecutionState::Running);
        let mut ticker = tokio::time::interval(self.record_interval);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => self.records += 1,
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break TaskResult::Finished;
                    }
                }
                command = self.commands.recv() => match command {
                    None => break TaskResult::Finished,
                    Some(TaskCommand::Trigger(checkpoint_id)) => {
                        if let Some(kind) = self.on_trigger(checkpoint_id) {
                            break TaskResult::Failed(kind);
                        }
                    }
                    Some(TaskCommand::Abort(checkpoint_id)) => {
                        tracing::debug!("task {} dropped checkpoint {}", attempt, checkpoint_id);
                    }
                    Some(TaskCommand::Complete(checkpoint_id)) => {
                        tracing::debug!("task {} confirmed checkpoint {}", attempt, checkpoint_id);
                    }
                },
            }
        };

        let final_state = match result {
            TaskResult::Finished => ExecutionState::Finished,
            TaskResult::Failed(_) => ExecutionState::Failed,
        };
        self.listener
            .on_state_update(attempt, ExecutionState::Running, final_state);
        TaskOutcome {
            attempt,
            strategy: self.strategy,
            result,
        }
    }

    /// Returns the failure that kills this task, if any.
    fn on_trigger(&mut self, checkpoint_id: CheckpointId) -> Option<FailureKind> {
        let attempt = self.attempt;
        match self.strategy.decide(attempt.subtask_index) {
            FailureDecision::Continue => {
                let state = StateHandle::new(self.records.to_le_bytes().to_vec());
                if let Err(err) = self.coordinator.acknowledge_nowait(checkpoint_id, attempt, state) {
                    tracing::warn!("task {} could not acknowledge: {}", attempt, err);
                }
                None
            }
            FailureDecision::Fail(FailureKind::DeclineCheckpoint) => {
                tracing::warn!("task {} declines checkpoint {}", attempt, checkpoint_id);
                let _ = self
                    .coordinator
                    .decline(checkpoint_id, attempt, "alignment buffer overflow");
                None
            }
            FailureDecision::Fail(kind) => {
                tracing::warn!(
                    "task {} fails with {} during checkpoint {}",
                    attempt,
                    kind,
                    checkpoint_id
                );
                Some(kind)
            }
        }
    }
}

/// Record count a subtask persisted in `checkpoint`, whatever its attempt.
fn restored_records(checkpoint: Option<&CompletedCheckpoint>, subtask_index: usize) -> u64 {
    checkpoint
        .and_then(|c| {
            c.state_handles
                .iter()
                .find(|(a, _)| a.vertex_id == SIM_VERTEX && a.subtask_index == subtask_index)
        })
        .and_then(|(_, handle)| handle.bytes.as_slice().try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

fn failure_strategy(
    config: &SimulationConfig,
    subtask_index: usize,
    tracker: &Arc<FailureTracker>,
) -> FailureStrategy {
    let mut members = Vec::new();
    if let Some(n) = config.fail_after.filter(|_| subtask_index == 0) {
        members.push(FailureStrategy::once(FailureStrategy::after_calls(
            n,
            FailureKind::UserException,
        )));
    }
    if let Some(n) = config
        .decline_after
        .filter(|_| subtask_index + 1 == config.parallelism)
    {
        members.push(FailureStrategy::after_calls(n, FailureKind::DeclineCheckpoint));
    }
    if members.is_empty() {
        return FailureStrategy::Never;
    }
    FailureStrategy::tracked(FailureStrategy::any_of(members), tracker.clone())
}

struct Runner {
    config: SimulationConfig,
    handle: CoordinatorHandle,
    gateway: Arc<SimGateway>,
    listener: Arc<dyn ExecutionStateUpdateListener>,
    stop: watch::Receiver<bool>,
    tasks: JoinSet<TaskOutcome>,
}

impl Runner {
    fn spawn_task(&mut self, attempt: ExecutionAttemptId, records: u64, strategy: FailureStrategy) {
        let (tx, commands) = mpsc::unbounded_channel();
        self.gateway.register(attempt, tx);
        let task = SimTask {
            attempt,
            records,
            record_interval: self.config.record_interval,
            strategy,
            commands,
            coordinator: self.handle.clone(),
            listener: self.listener.clone(),
            stop: self.stop.clone(),
        };
        tracing::info!("deploying {} with {} restored records", attempt, records);
        self.tasks.spawn(task.run());
    }
}

pub async fn run(config: SimulationConfig) -> Result<SimulationReport> {
    config
        .coordinator
        .validate()
        .context("invalid coordinator configuration")?;

    let storage = Arc::new(FsCheckpointStorage::new(&config.base_path)?);
    let store = FsCompletedCheckpointStore::open(
        &config.base_path,
        config.coordinator.max_retained_checkpoints,
        storage.clone(),
    )?;
    let gateway = Arc::new(SimGateway::default());
    let stats = CheckpointStatsTracker::new();
    let (failure_tx, mut failure_rx) = watch::channel(None);
    let coordinator = CheckpointCoordinator::new(
        config.coordinator.clone(),
        Box::new(store),
        storage,
        gateway.clone(),
    )
    .with_lifecycle_listener(stats.clone())
    .with_failure_handler(Arc::new(WatchFailureHandler { tx: failure_tx }));
    let (service, handle) = CoordinatorService::new(coordinator);
    let service_join = service.spawn();

    let restored = handle
        .restore_latest(config.coordinator.claim_mode)
        .await?;
    let restored_from = restored.as_ref().map(|c| c.checkpoint_id);

    let listener = Arc::new(combine([
        Arc::new(handle.clone()) as Arc<dyn ExecutionStateUpdateListener>,
        Arc::new(LoggingStateListener) as Arc<dyn ExecutionStateUpdateListener>,
    ]));
    let (stop_tx, stop_rx) = watch::channel(false);
    let tracker = FailureTracker::new();
    let mut runner = Runner {
        config: config.clone(),
        handle: handle.clone(),
        gateway,
        listener,
        stop: stop_rx,
        tasks: JoinSet::new(),
    };
    for subtask in 0..config.parallelism {
        let attempt = ExecutionAttemptId::new(SIM_VERTEX, subtask, 0);
        let records = restored_records(restored.as_ref(), subtask);
        runner.spawn_task(attempt, records, failure_strategy(&config, subtask, &tracker));
    }

    let mut backoff = config.restart.backoff();
    let deadline = tokio::time::sleep(config.max_runtime);
    tokio::pin!(deadline);
    let mut progress = tokio::time::interval(Duration::from_millis(20));

    let job_status = loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!("simulation ran out of time, cancelling the job");
                break JobStatus::Canceled;
            }
            Ok(()) = failure_rx.changed() => {
                let reason = failure_rx.borrow().clone().unwrap_or_default();
                tracing::error!("failing job: {}", reason);
                break JobStatus::Failed;
            }
            _ = progress.tick() => {
                if stats.snapshot().completed >= config.target_checkpoints {
                    break JobStatus::Finished;
                }
            }
            Some(joined) = runner.tasks.join_next() => {
                let outcome = joined.context("simulated task panicked")?;
                let TaskResult::Failed(kind) = outcome.result else {
                    continue;
                };
                let Some(delay) = backoff.next_delay() else {
                    tracing::error!(
                        "task {} failed with {} and no restart attempts remain",
                        outcome.attempt,
                        kind
                    );
                    break JobStatus::Failed;
                };
                tokio::time::sleep(delay).await;
                // Checkpoints taken by this run belong to it.
                let latest = handle.restore_latest(RecoveryClaimMode::Claim).await?;
                let subtask = outcome.attempt.subtask_index;
                runner.spawn_task(
                    outcome.attempt.next_attempt(),
                    restored_records(latest.as_ref(), subtask),
                    outcome.strategy,
                );
            }
        }
    };

    let _ = stop_tx.send(true);
    while let Some(joined) = runner.tasks.join_next().await {
        joined.context("simulated task panicked")?;
    }

    let completed = handle.completed_checkpoints().await?;
    let stats = stats.snapshot();
    if let Err(err) = handle.shutdown(job_status).await {
        tracing::error!("coordinator shutdown reported: {}", err);
    }
    service_join
        .await
        .context("coordinator service panicked")?;

    Ok(SimulationReport {
        job_status,
        restored_from,
        restarts: backoff.attempts(),
        stats,
        completed,
    })
}

#[cfg(test)]
#[path = "tests/sim_tests.rs"]
mod tests;
