use super::*;
use crate::properties::CheckpointRetentionPolicy;
use crate::store::{
    FsCheckpointStorage, FsCompletedCheckpointStore, InMemoryCheckpointStorage,
    StandaloneCompletedCheckpointStore, read_all_metadata,
};
use anyhow::anyhow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct Harness {
    coordinator: CheckpointCoordinator,
    gateway: Arc<RecordingGateway>,
    storage: Arc<InMemoryCheckpointStorage>,
    stats: Arc<CheckpointStatsTracker>,
}

fn attempt(subtask: usize) -> ExecutionAttemptId {
    ExecutionAttemptId::new(VertexId::new(1), subtask, 0)
}

fn checkpoint_props() -> CheckpointProperties {
    CheckpointProperties::for_checkpoint(CheckpointRetentionPolicy::NeverRetainAfterTermination)
}

fn forced_savepoint() -> CheckpointProperties {
    CheckpointProperties::for_savepoint(true, SavepointFormat::Canonical)
}

fn harness_with_store(
    config: CheckpointCoordinatorConfig,
    num_tasks: usize,
    store: StandaloneCompletedCheckpointStore,
    storage: Arc<InMemoryCheckpointStorage>,
) -> Harness {
    let gateway = RecordingGateway::new();
    let stats = CheckpointStatsTracker::new();
    let mut coordinator =
        CheckpointCoordinator::new(config, Box::new(store), storage.clone(), gateway.clone())
            .with_lifecycle_listener(stats.clone());
    for subtask in 0..num_tasks {
        coordinator.register_task(attempt(subtask), ExecutionState::Running);
    }
    Harness {
        coordinator,
        gateway,
        storage,
        stats,
    }
}

fn harness(config: CheckpointCoordinatorConfig, num_tasks: usize) -> Harness {
    let storage = Arc::new(InMemoryCheckpointStorage::new());
    let store =
        StandaloneCompletedCheckpointStore::new(config.max_retained_checkpoints, storage.clone());
    harness_with_store(config, num_tasks, store, storage)
}

fn ack_all(
    coordinator: &mut CheckpointCoordinator,
    checkpoint_id: CheckpointId,
    num_tasks: usize,
    now: Timestamp,
) -> AckResult {
    let mut last = AckResult::UnknownTask;
    for subtask in 0..num_tasks {
        last = coordinator
            .receive_ack(
                checkpoint_id,
                attempt(subtask),
                StateHandle::new(vec![subtask as u8]),
                now,
            )
            .unwrap();
    }
    last
}

fn completed_ids(coordinator: &CheckpointCoordinator) -> Vec<CheckpointId> {
    coordinator
        .store()
        .list_all()
        .iter()
        .map(|c| c.checkpoint_id)
        .collect()
}

#[derive(Default)]
struct RecordingFailureHandler {
    calls: Mutex<Vec<u32>>,
}

impl JobFailureHandler for RecordingFailureHandler {
    fn fail_job(&self, _reason: &CheckpointError, consecutive_failures: u32) {
        self.calls.lock().unwrap().push(consecutive_failures);
    }
}

/// Storage whose task-state writes can be switched to fail.
#[derive(Default)]
struct FlakyStorage {
    inner: InMemoryCheckpointStorage,
    failing: AtomicBool,
}

impl CheckpointStorage for FlakyStorage {
    fn persist_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        handle: &StateHandle,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.persist_task_state(checkpoint_id, attempt, handle)
    }

    fn load_task_state(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
    ) -> anyhow::Result<StateHandle> {
        self.inner.load_task_state(checkpoint_id, attempt)
    }

    fn discard_checkpoint(&self, checkpoint_id: CheckpointId) -> anyhow::Result<()> {
        self.inner.discard_checkpoint(checkpoint_id)
    }

    fn external_pointer(
        &self,
        checkpoint_id: CheckpointId,
        properties: &CheckpointProperties,
    ) -> Option<String> {
        self.inner.external_pointer(checkpoint_id, properties)
    }
}

#[test]
fn test_trigger_reaches_every_running_task() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 3);
    let (checkpoint_id, _completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 100).unwrap();

    assert_eq!(checkpoint_id, 1);
    assert_eq!(
        h.gateway.triggered(checkpoint_id),
        vec![attempt(0), attempt(1), attempt(2)]
    );
    assert_eq!(h.coordinator.pending_checkpoint_ids(), vec![1]);
    assert_eq!(h.stats.snapshot().triggered, 1);
}

#[test]
fn test_full_ack_completes_checkpoint() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 3);
    let (checkpoint_id, mut completion) =
        h.coordinator.trigger_checkpoint(checkpoint_props(), 100).unwrap();

    let first = h
        .coordinator
        .receive_ack(checkpoint_id, attempt(2), StateHandle::new(vec![2]), 110)
        .unwrap();
    let second = h
        .coordinator
        .receive_ack(checkpoint_id, attempt(0), StateHandle::new(vec![0]), 120)
        .unwrap();
    let last = h
        .coordinator
        .receive_ack(checkpoint_id, attempt(1), StateHandle::new(vec![1]), 130)
        .unwrap();
    assert_eq!(
        [first, second, last],
        [AckResult::Accepted, AckResult::Accepted, AckResult::Completes]
    );

    let info = completion.try_recv().unwrap().unwrap();
    assert_eq!(info.checkpoint_id, checkpoint_id);
    assert_eq!(info.num_tasks, 3);
    assert_eq!(info.completion_timestamp - info.trigger_timestamp, 30);

    assert_eq!(h.coordinator.num_pending(), 0);
    assert_eq!(completed_ids(&h.coordinator), vec![1]);
    assert_eq!(h.storage.load_task_state(1, attempt(1)).unwrap().bytes, vec![1]);
    assert_eq!(
        h.gateway.notified_complete(checkpoint_id),
        vec![attempt(0), attempt(1), attempt(2)]
    );

    let stats = h.stats.snapshot();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.latest_completed_id, Some(1));
    assert_eq!(stats.latest_completed_duration_ms, Some(30));
}

#[test]
fn test_duplicate_ack_is_already_acknowledged() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 2);
    let (checkpoint_id, _completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();

    let first = h
        .coordinator
        .receive_ack(checkpoint_id, attempt(0), StateHandle::empty(), 1)
        .unwrap();
    let second = h
        .coordinator
        .receive_ack(checkpoint_id, attempt(0), StateHandle::empty(), 2)
        .unwrap();
    assert_eq!(first, AckResult::Accepted);
    assert_eq!(second, AckResult::AlreadyAcknowledged);
    assert!(h.coordinator.pending_checkpoint(checkpoint_id).unwrap().is_in_progress());
}

#[test]
fn test_ack_from_unknown_attempt_or_checkpoint() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 1);
    let (checkpoint_id, _completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();

    let stranger = ExecutionAttemptId::new(VertexId::new(9), 0, 0);
    assert_eq!(
        h.coordinator
            .receive_ack(checkpoint_id, stranger, StateHandle::empty(), 1)
            .unwrap(),
        AckResult::UnknownTask
    );
    assert_eq!(
        h.coordinator
            .receive_ack(42, attempt(0), StateHandle::empty(), 1)
            .unwrap(),
        AckResult::UnknownTask
    );
}

#[test]
fn test_concurrency_limit_rejects_second_trigger() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 2);
    h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();

    let err = h
        .coordinator
        .trigger_checkpoint(checkpoint_props(), 10_000)
        .unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::TriggerRejected(TriggerRejectReason::TooManyConcurrentCheckpoints)
    ));
    assert!(err.is_trigger_rejected());
    // A rejected trigger does not consume an id.
    assert_eq!(h.coordinator.next_checkpoint_id(), 2);
}

#[test]
fn test_min_pause_between_trigger_starts() {
    let config = CheckpointCoordinatorConfig::default()
        .with_min_pause_between_checkpoints(Duration::from_millis(1000));
    let mut h = harness(config, 1);
    let (first, _c1) = h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
    ack_all(&mut h.coordinator, first, 1, 100);

    let err = h
        .coordinator
        .trigger_checkpoint(checkpoint_props(), 999)
        .unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::TriggerRejected(TriggerRejectReason::MinimumTimeBetweenCheckpoints)
    ));

    let (second, _c2) = h.coordinator.trigger_checkpoint(checkpoint_props(), 1000).unwrap();
    assert_eq!(second, 2);
}

#[test]
fn test_forced_trigger_bypasses_limits() {
    let config = CheckpointCoordinatorConfig::default()
        .with_min_pause_between_checkpoints(Duration::from_secs(60));
    let mut h = harness(config, 1);
    h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();

    let (savepoint_id, _completion) = h.coordinator.trigger_checkpoint(forced_savepoint(), 1).unwrap();
    assert_eq!(savepoint_id, 2);
    assert_eq!(h.coordinator.num_pending(), 2);
}

#[test]
fn test_completion_subsumes_older_pending_checkpoints() {
    let config = CheckpointCoordinatorConfig::default().with_max_concurrent_checkpoints(2);
    let mut h = harness(config, 2);
    let (older, mut older_completion) =
        h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
    let (newer, _newer_completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 10).unwrap();
    h.coordinator
        .receive_ack(older, attempt(0), StateHandle::empty(), 11)
        .unwrap();

    assert_eq!(ack_all(&mut h.coordinator, newer, 2, 20), AckResult::Completes);

    assert!(h.coordinator.pending_checkpoint(older).is_none());
    let err = older_completion.try_recv().unwrap().unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::Subsumed { checkpoint_id: 1, by: 2 }
    ));
    // Only the task that still owed an ack is told to abort.
    assert_eq!(h.gateway.aborted(older), vec![attempt(1)]);
    assert_eq!(h.coordinator.failure_manager().consecutive_failures(), 0);
    // Late acks for the subsumed attempt are ignored.
    assert_eq!(
        h.coordinator
            .receive_ack(older, attempt(1), StateHandle::empty(), 30)
            .unwrap(),
        AckResult::UnknownTask
    );
}

#[test]
fn test_forced_pending_checkpoint_is_not_subsumed() {
    let config = CheckpointCoordinatorConfig::default().with_max_concurrent_checkpoints(2);
    let mut h = harness(config, 2);
    let (forced, _forced_completion) = h.coordinator.trigger_checkpoint(forced_savepoint(), 0).unwrap();
    let (regular, _completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 5).unwrap();

    assert_eq!(ack_all(&mut h.coordinator, regular, 2, 10), AckResult::Completes);

    let pending = h.coordinator.pending_checkpoint(forced).unwrap();
    assert!(pending.is_in_progress());
    assert!(h.gateway.aborted(forced).is_empty());

    assert_eq!(ack_all(&mut h.coordinator, forced, 2, 20), AckResult::Completes);
    assert_eq!(completed_ids(&h.coordinator), vec![forced, regular]);
}

#[test]
fn test_task_leaving_running_aborts_owed_checkpoints() {
    let config = CheckpointCoordinatorConfig::default().with_max_concurrent_checkpoints(5);
    let mut h = harness(config, 2);
    for now in 0..4 {
        h.coordinator.trigger_checkpoint(checkpoint_props(), now).unwrap();
    }
    let (owed, mut completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 4).unwrap();
    assert_eq!(owed, 5);
    // Subtask 1 already acknowledged checkpoint 4.
    h.coordinator
        .receive_ack(4, attempt(1), StateHandle::empty(), 5)
        .unwrap();

    h.coordinator
        .on_state_update(attempt(1), ExecutionState::Running, ExecutionState::Failed);

    let err = completion.try_recv().unwrap().unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::TaskUnreachable { checkpoint_id: 5, attempt: a } if a == attempt(1)
    ));
    assert_eq!(h.coordinator.pending_checkpoint_ids(), vec![4]);
    assert_eq!(
        h.coordinator
            .receive_ack(owed, attempt(0), StateHandle::empty(), 6)
            .unwrap(),
        AckResult::UnknownTask
    );
    // A late ack from the failed attempt itself is ignored as well.
    assert_eq!(
        h.coordinator
            .receive_ack(owed, attempt(1), StateHandle::empty(), 6)
            .unwrap(),
        AckResult::UnknownTask
    );
    assert_eq!(h.coordinator.pending_checkpoint_ids(), vec![4]);
    assert_eq!(h.coordinator.failure_manager().consecutive_failures(), 4);
}

#[test]
fn test_finished_task_that_acknowledged_is_not_a_failure() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 2);
    let (checkpoint_id, _completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
    h.coordinator
        .receive_ack(checkpoint_id, attempt(0), StateHandle::empty(), 1)
        .unwrap();

    h.coordinator
        .on_state_update(attempt(0), ExecutionState::Running, ExecutionState::Finished);

    assert!(h.coordinator.pending_checkpoint(checkpoint_id).unwrap().is_in_progress());
    assert_eq!(ack_all(&mut h.coordinator, checkpoint_id, 2, 2), AckResult::Completes);
}

#[test]
fn test_expiration_aborts_and_notifies_unacknowledged_tasks() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 3);
    let (checkpoint_id, mut completion) =
        h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
    h.coordinator
        .receive_ack(checkpoint_id, attempt(0), StateHandle::empty(), 1)
        .unwrap();

    assert!(h.coordinator.expire(checkpoint_id));
    assert!(!h.coordinator.expire(checkpoint_id));

    assert_eq!(h.gateway.aborted(checkpoint_id), vec![attempt(1), attempt(2)]);
    assert!(matches!(
        completion.try_recv().unwrap(),
        Err(CheckpointError::ExpiredBeforeCompletion(1))
    ));
    let stats = h.stats.snapshot();
    assert_eq!(stats.aborted, 1);
    assert!(stats.latest_failure.unwrap().contains("expired"));
}

#[test]
fn test_decline_aborts_checkpoint() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 2);
    let (checkpoint_id, mut completion) =
        h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();

    assert!(!h.coordinator.decline(checkpoint_id, ExecutionAttemptId::new(VertexId::new(7), 0, 0), "x"));
    assert!(h.coordinator.decline(checkpoint_id, attempt(1), "alignment buffer full"));

    match completion.try_recv().unwrap() {
        Err(CheckpointError::DeclinedByTask { reason, .. }) => {
            assert_eq!(reason, "alignment buffer full")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.coordinator.num_pending(), 0);
}

#[test]
fn test_trigger_requires_all_tasks_running() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 2);
    h.coordinator
        .register_task(attempt(2), ExecutionState::Deploying);
    let err = h
        .coordinator
        .trigger_checkpoint(checkpoint_props(), 0)
        .unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::TriggerRejected(TriggerRejectReason::NotAllTasksRunning)
    ));

    h.coordinator
        .on_state_update(attempt(2), ExecutionState::Deploying, ExecutionState::Running);
    h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
}

#[test]
fn test_trigger_without_tasks_is_rejected() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 0);
    assert!(matches!(
        h.coordinator.trigger_checkpoint(checkpoint_props(), 0),
        Err(CheckpointError::TriggerRejected(TriggerRejectReason::NoTasks))
    ));
}

#[test]
fn test_restarted_attempt_replaces_failed_one() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 2);
    h.coordinator
        .on_state_update(attempt(1), ExecutionState::Running, ExecutionState::Failed);
    assert!(h.coordinator.trigger_checkpoint(checkpoint_props(), 0).is_err());

    let restarted = attempt(1).next_attempt();
    h.coordinator
        .on_state_update(restarted, ExecutionState::Created, ExecutionState::Running);
    // A late update of the old attempt does not override the new one.
    h.coordinator
        .on_state_update(attempt(1), ExecutionState::Failed, ExecutionState::Canceled);

    let (checkpoint_id, _completion) = h.coordinator.trigger_checkpoint(checkpoint_props(), 1).unwrap();
    assert_eq!(
        h.gateway.triggered(checkpoint_id),
        vec![attempt(0), restarted]
    );
}

#[test]
fn test_retention_discards_subsumed_state() {
    let config = CheckpointCoordinatorConfig::default().with_retained_checkpoints(2);
    let mut h = harness(config, 1);
    for now in [0, 10, 20] {
        let (checkpoint_id, _c) = h.coordinator.trigger_checkpoint(checkpoint_props(), now).unwrap();
        ack_all(&mut h.coordinator, checkpoint_id, 1, now + 1);
    }
    assert_eq!(completed_ids(&h.coordinator), vec![2, 3]);
    assert_eq!(h.storage.stored_checkpoints().unwrap(), vec![2, 3]);
}

#[test]
fn test_restore_from_empty_store_is_none() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 1);
    assert!(h.coordinator.restore_latest(RecoveryClaimMode::Claim).unwrap().is_none());
    assert!(h.coordinator.restore_latest(RecoveryClaimMode::NoClaim).unwrap().is_none());
    assert_eq!(h.coordinator.next_checkpoint_id(), 1);
}

fn store_with_record(
    checkpoint_id: CheckpointId,
    max_retained: usize,
) -> (StandaloneCompletedCheckpointStore, Arc<InMemoryCheckpointStorage>) {
    let storage = Arc::new(InMemoryCheckpointStorage::new());
    storage
        .persist_task_state(checkpoint_id, attempt(0), &StateHandle::new(vec![7]))
        .unwrap();
    let mut store = StandaloneCompletedCheckpointStore::new(max_retained, storage.clone());
    let mut state_handles = BTreeMap::new();
    state_handles.insert(attempt(0), StateHandle::new(vec![7]));
    store
        .add(CompletedCheckpoint {
            checkpoint_id,
            properties: checkpoint_props(),
            trigger_timestamp: 0,
            completion_timestamp: 1,
            state_handles,
            external_pointer: None,
        })
        .unwrap();
    (store, storage)
}

#[test]
fn test_restore_claim_advances_checkpoint_id() {
    let (store, storage) = store_with_record(7, 3);
    let mut h = harness_with_store(CheckpointCoordinatorConfig::default(), 1, store, storage);

    let restored = h
        .coordinator
        .restore_latest(RecoveryClaimMode::Claim)
        .unwrap()
        .unwrap();
    assert_eq!(restored.checkpoint_id, 7);
    assert!(!restored.properties.is_unclaimed());

    let (checkpoint_id, _c) = h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
    assert_eq!(checkpoint_id, 8);

    // Claimed records are subsumed like any other checkpoint.
    ack_all(&mut h.coordinator, checkpoint_id, 1, 1);
    let (next, _c) = h.coordinator.trigger_checkpoint(checkpoint_props(), 2).unwrap();
    ack_all(&mut h.coordinator, next, 1, 3);
    let (last, _c) = h.coordinator.trigger_checkpoint(checkpoint_props(), 4).unwrap();
    ack_all(&mut h.coordinator, last, 1, 5);
    assert_eq!(completed_ids(&h.coordinator), vec![8, 9, 10]);
    assert!(!h.storage.stored_checkpoints().unwrap().contains(&7));
}

#[test]
fn test_no_claim_restore_is_never_discarded() {
    let (store, storage) = store_with_record(5, 1);
    let mut h = harness_with_store(CheckpointCoordinatorConfig::default(), 1, store, storage);

    let restored = h
        .coordinator
        .restore_latest(RecoveryClaimMode::NoClaim)
        .unwrap()
        .unwrap();
    assert!(restored.properties.is_unclaimed());
    assert_eq!(restored.state_handles.len(), 1);

    for now in [10, 20, 30] {
        let (checkpoint_id, _c) = h.coordinator.trigger_checkpoint(checkpoint_props(), now).unwrap();
        ack_all(&mut h.coordinator, checkpoint_id, 1, now + 1);
    }
    assert_eq!(completed_ids(&h.coordinator), vec![5, 8]);

    h.coordinator.shutdown(JobStatus::Finished).unwrap();
    assert_eq!(completed_ids(&h.coordinator), vec![5]);
    assert_eq!(h.storage.stored_checkpoints().unwrap(), vec![5]);
}

#[test]
fn test_shutdown_aborts_pending_and_rejects_triggers() {
    let config = CheckpointCoordinatorConfig::default().with_max_concurrent_checkpoints(2);
    let mut h = harness(config, 1);
    let (first, mut c1) = h.coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
    let (_second, mut c2) = h.coordinator.trigger_checkpoint(checkpoint_props(), 1).unwrap();

    h.coordinator.shutdown(JobStatus::Canceled).unwrap();

    assert!(matches!(
        c1.try_recv().unwrap(),
        Err(CheckpointError::CoordinatorShutdown(id)) if id == first
    ));
    assert!(c2.try_recv().unwrap().is_err());
    assert_eq!(h.coordinator.failure_manager().consecutive_failures(), 0);
    assert!(matches!(
        h.coordinator.trigger_checkpoint(forced_savepoint(), 2),
        Err(CheckpointError::TriggerRejected(TriggerRejectReason::CoordinatorShutdown))
    ));
    // Shutting down twice is harmless.
    h.coordinator.shutdown(JobStatus::Canceled).unwrap();
}

#[test]
fn test_failure_handler_fires_once_per_breach() {
    let handler = Arc::new(RecordingFailureHandler::default());
    let config = CheckpointCoordinatorConfig::default().with_tolerable_failed_checkpoints(1);
    let mut h = harness(config, 1);
    h.coordinator = h.coordinator.with_failure_handler(handler.clone());

    let expire_one = |coordinator: &mut CheckpointCoordinator, now| {
        let (id, _c) = coordinator.trigger_checkpoint(checkpoint_props(), now).unwrap();
        coordinator.expire(id);
    };
    expire_one(&mut h.coordinator, 0);
    assert!(handler.calls.lock().unwrap().is_empty());
    expire_one(&mut h.coordinator, 1);
    expire_one(&mut h.coordinator, 2);
    assert_eq!(*handler.calls.lock().unwrap(), vec![2]);

    let (id, _c) = h.coordinator.trigger_checkpoint(checkpoint_props(), 3).unwrap();
    ack_all(&mut h.coordinator, id, 1, 4);
    assert_eq!(h.coordinator.failure_manager().consecutive_failures(), 0);

    expire_one(&mut h.coordinator, 5);
    expire_one(&mut h.coordinator, 6);
    assert_eq!(*handler.calls.lock().unwrap(), vec![2, 2]);
}

#[test]
fn test_storage_failure_aborts_checkpoint() {
    let storage = Arc::new(FlakyStorage::default());
    let store = StandaloneCompletedCheckpointStore::new(3, Arc::new(InMemoryCheckpointStorage::new()));
    let gateway = RecordingGateway::new();
    let mut coordinator = CheckpointCoordinator::new(
        CheckpointCoordinatorConfig::default(),
        Box::new(store),
        storage.clone(),
        gateway.clone(),
    );
    coordinator.register_task(attempt(0), ExecutionState::Running);
    storage.failing.store(true, Ordering::SeqCst);

    let (checkpoint_id, mut completion) =
        coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
    let err = coordinator
        .receive_ack(checkpoint_id, attempt(0), StateHandle::empty(), 1)
        .unwrap_err();
    assert!(matches!(&err, CheckpointError::Storage(source) if source.to_string() == "disk full"));
    assert!(completion.try_recv().unwrap().is_err());
    assert_eq!(coordinator.num_pending(), 0);
    assert_eq!(coordinator.store().num_retained(), 0);
    assert_eq!(gateway.aborted(checkpoint_id), vec![attempt(0)]);
    assert_eq!(coordinator.failure_manager().consecutive_failures(), 1);

    storage.failing.store(false, Ordering::SeqCst);
    let (next, _c) = coordinator.trigger_checkpoint(checkpoint_props(), 2).unwrap();
    assert_eq!(
        coordinator
            .receive_ack(next, attempt(0), StateHandle::empty(), 3)
            .unwrap(),
        AckResult::Completes
    );
}

#[test]
fn test_dispose_savepoint() {
    let mut h = harness(CheckpointCoordinatorConfig::default(), 1);
    let (savepoint_id, mut completion) = h
        .coordinator
        .trigger_savepoint(SavepointFormat::Canonical, 0)
        .unwrap();
    ack_all(&mut h.coordinator, savepoint_id, 1, 1);
    let info = completion.try_recv().unwrap().unwrap();
    assert_eq!(info.external_pointer.as_deref(), Some("memory://savepoint-1"));

    let (checkpoint_id, _c) = h.coordinator.trigger_checkpoint(checkpoint_props(), 2).unwrap();
    ack_all(&mut h.coordinator, checkpoint_id, 1, 3);

    assert!(matches!(
        h.coordinator.dispose_savepoint(checkpoint_id),
        Err(CheckpointError::NotASavepoint(2))
    ));
    assert!(matches!(
        h.coordinator.dispose_savepoint(99),
        Err(CheckpointError::NotFound(99))
    ));

    let disposed = h.coordinator.dispose_savepoint(savepoint_id).unwrap();
    assert_eq!(disposed.checkpoint_id, savepoint_id);
    assert_eq!(completed_ids(&h.coordinator), vec![checkpoint_id]);
    assert_eq!(h.storage.stored_checkpoints().unwrap(), vec![checkpoint_id]);
}

fn fs_coordinator(dir: &Path, max_retained: usize) -> (CheckpointCoordinator, Arc<FsCheckpointStorage>) {
    let storage = Arc::new(FsCheckpointStorage::new(dir).unwrap());
    let store = FsCompletedCheckpointStore::open(dir, max_retained, storage.clone()).unwrap();
    let mut coordinator = CheckpointCoordinator::new(
        CheckpointCoordinatorConfig::default().with_retained_checkpoints(max_retained),
        Box::new(store),
        storage.clone(),
        RecordingGateway::new(),
    );
    coordinator.register_task(attempt(0), ExecutionState::Running);
    (coordinator, storage)
}

fn on_disk_ids(dir: &Path) -> Vec<CheckpointId> {
    read_all_metadata(dir)
        .unwrap()
        .iter()
        .map(|c| c.checkpoint_id)
        .collect()
}

#[test]
fn test_new_coordinator_continues_after_stored_ids() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (mut coordinator, _storage) = fs_coordinator(dir.path(), 3);
        let (checkpoint_id, _c) = coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
        coordinator
            .receive_ack(checkpoint_id, attempt(0), StateHandle::new(vec![1]), 1)
            .unwrap();
        assert_eq!(checkpoint_id, 1);
    }

    // Triggering before any restore must not reuse id 1.
    let (mut coordinator, storage) = fs_coordinator(dir.path(), 3);
    assert_eq!(coordinator.next_checkpoint_id(), 2);
    let (checkpoint_id, _c) = coordinator.trigger_checkpoint(checkpoint_props(), 10).unwrap();
    assert_eq!(checkpoint_id, 2);
    assert_eq!(
        coordinator
            .receive_ack(checkpoint_id, attempt(0), StateHandle::new(vec![2]), 11)
            .unwrap(),
        AckResult::Completes
    );

    assert_eq!(on_disk_ids(dir.path()), vec![1, 2]);
    assert_eq!(storage.load_task_state(1, attempt(0)).unwrap().bytes, vec![1]);
}

#[test]
fn test_no_claim_restore_leaves_durable_record_untouched() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (mut coordinator, _storage) = fs_coordinator(dir.path(), 1);
        let (checkpoint_id, _c) = coordinator.trigger_checkpoint(checkpoint_props(), 0).unwrap();
        ack_all(&mut coordinator, checkpoint_id, 1, 1);
    }

    {
        let (mut coordinator, _storage) = fs_coordinator(dir.path(), 1);
        let restored = coordinator
            .restore_latest(RecoveryClaimMode::NoClaim)
            .unwrap()
            .unwrap();
        assert!(restored.properties.is_unclaimed());
        coordinator.shutdown(JobStatus::Finished).unwrap();
    }
    let on_disk = read_all_metadata(dir.path()).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].properties, checkpoint_props());
    assert!(!on_disk[0].properties.is_unclaimed());

    // A later run that claims the snapshot owns it again.
    let (mut coordinator, _storage) = fs_coordinator(dir.path(), 1);
    let restored = coordinator
        .restore_latest(RecoveryClaimMode::Claim)
        .unwrap()
        .unwrap();
    assert!(!restored.properties.is_unclaimed());
    assert_eq!(restored.properties, checkpoint_props());
    coordinator.shutdown(JobStatus::Finished).unwrap();
    assert!(on_disk_ids(dir.path()).is_empty());
}
