use super::*;
use std::collections::HashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Every input of the coordinator. Channel order is the total order in which
/// they are applied.
pub enum CoordinatorMessage {
    Trigger {
        properties: CheckpointProperties,
        reply: oneshot::Sender<Result<(CheckpointId, CompletionReceiver)>>,
    },
    Acknowledge {
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        state: StateHandle,
        reply: Option<oneshot::Sender<Result<AckResult>>>,
    },
    Decline {
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        reason: String,
    },
    StateUpdate {
        attempt: ExecutionAttemptId,
        previous: ExecutionState,
        new: ExecutionState,
    },
    Expire(CheckpointId),
    Restore {
        claim_mode: RecoveryClaimMode,
        reply: oneshot::Sender<Result<Option<CompletedCheckpoint>>>,
    },
    DisposeSavepoint {
        checkpoint_id: CheckpointId,
        reply: oneshot::Sender<Result<CompletedCheckpoint>>,
    },
    ListCompleted {
        reply: oneshot::Sender<Vec<CompletedCheckpointInfo>>,
    },
    ListPending {
        reply: oneshot::Sender<Vec<CheckpointId>>,
    },
    Shutdown {
        status: JobStatus,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Owns a [`CheckpointCoordinator`] and applies messages to it one at a time.
pub struct CoordinatorService {
    coordinator: CheckpointCoordinator,
    rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
    /// Used by expiration timers; does not keep the loop alive.
    timer_tx: mpsc::WeakUnboundedSender<CoordinatorMessage>,
    /// Expiration timers of attempts that are still pending.
    timers: HashMap<CheckpointId, AbortHandle>,
    periodic: bool,
    /// Every timestamp handed to the coordinator derives from the tokio clock,
    /// anchored to the wall clock once at construction.
    started: Instant,
    started_at: Timestamp,
}

impl CoordinatorService {
    pub fn new(coordinator: CheckpointCoordinator) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            coordinator,
            rx,
            timer_tx: tx.downgrade(),
            timers: HashMap::new(),
            periodic: true,
            started: Instant::now(),
            started_at: current_unix_millis(),
        };
        (service, CoordinatorHandle { tx })
    }

    /// Disable the periodic checkpoint trigger; only explicit triggers run.
    pub fn without_periodic_trigger(mut self) -> Self {
        self.periodic = false;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<CheckpointCoordinator> {
        tokio::spawn(self.run())
    }

    /// Run until shut down or every handle is dropped. Returns the coordinator
    /// for inspection.
    pub async fn run(mut self) -> CheckpointCoordinator {
        let period = self
            .coordinator
            .config()
            .interval
            .max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the first checkpoint waits one interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        tracing::debug!("all coordinator handles dropped, stopping");
                        break;
                    };
                    if !self.handle(msg) {
                        break;
                    }
                }
                _ = ticker.tick(), if self.periodic => {
                    self.on_tick();
                }
            }
            self.cancel_settled_timers();
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.coordinator
    }

    fn now(&self) -> Timestamp {
        self.started_at + self.started.elapsed().as_millis() as Timestamp
    }

    fn on_tick(&mut self) {
        match self.coordinator.trigger_periodic(self.now()) {
            // Nobody waits on periodic checkpoints.
            Ok((checkpoint_id, _completion)) => self.schedule_expiration(checkpoint_id),
            Err(err) => tracing::debug!("periodic checkpoint skipped: {}", err),
        }
    }

    /// Returns false once the loop must stop.
    pub(super) fn handle(&mut self, msg: CoordinatorMessage) -> bool {
        let now = self.now();
        match msg {
            CoordinatorMessage::Trigger { properties, reply } => {
                let result = self.coordinator.trigger_checkpoint(properties, now);
                if let Ok((checkpoint_id, _)) = &result {
                    self.schedule_expiration(*checkpoint_id);
                }
                let _ = reply.send(result);
            }
            CoordinatorMessage::Acknowledge {
                checkpoint_id,
                attempt,
                state,
                reply,
            } => {
                let result = self
                    .coordinator
                    .receive_ack(checkpoint_id, attempt, state, now);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            CoordinatorMessage::Decline {
                checkpoint_id,
                attempt,
                reason,
            } => {
                self.coordinator.decline(checkpoint_id, attempt, reason);
            }
            CoordinatorMessage::StateUpdate {
                attempt,
                previous,
                new,
            } => self.coordinator.on_state_update(attempt, previous, new),
            CoordinatorMessage::Expire(checkpoint_id) => {
                self.coordinator.expire(checkpoint_id);
            }
            CoordinatorMessage::Restore { claim_mode, reply } => {
                let _ = reply.send(self.coordinator.restore_latest(claim_mode));
            }
            CoordinatorMessage::DisposeSavepoint {
                checkpoint_id,
                reply,
            } => {
                let _ = reply.send(self.coordinator.dispose_savepoint(checkpoint_id));
            }
            CoordinatorMessage::ListCompleted { reply } => {
                let infos = self
                    .coordinator
                    .store()
                    .list_all()
                    .iter()
                    .map(CompletedCheckpoint::info)
                    .collect();
                let _ = reply.send(infos);
            }
            CoordinatorMessage::ListPending { reply } => {
                let _ = reply.send(self.coordinator.pending_checkpoint_ids());
            }
            CoordinatorMessage::Shutdown { status, reply } => {
                let _ = reply.send(self.coordinator.shutdown(status));
                return false;
            }
        }
        true
    }

    fn schedule_expiration(&mut self, checkpoint_id: CheckpointId) {
        let timer_tx = self.timer_tx.clone();
        let timeout = self.coordinator.config().checkpoint_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = timer_tx.upgrade() {
                let _ = tx.send(CoordinatorMessage::Expire(checkpoint_id));
            }
        });
        self.timers.insert(checkpoint_id, timer.abort_handle());
    }

    /// Abort the timers of attempts that completed, failed or expired.
    pub(super) fn cancel_settled_timers(&mut self) {
        let coordinator = &self.coordinator;
        self.timers.retain(|checkpoint_id, timer| {
            let pending = coordinator.pending_checkpoint(*checkpoint_id).is_some();
            if !pending {
                timer.abort();
            }
            pending
        });
    }

    pub(super) fn num_expiration_timers(&self) -> usize {
        self.timers.len()
    }
}

/// Cloneable entry point to a running [`CoordinatorService`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    fn send(&self, msg: CoordinatorMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| CheckpointError::ServiceStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CoordinatorMessage,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| CheckpointError::ServiceStopped)
    }

    /// Start an attempt and return its id with a future for its outcome.
    pub async fn start_checkpoint(
        &self,
        properties: CheckpointProperties,
    ) -> Result<(CheckpointId, CompletionReceiver)> {
        self.request(|reply| CoordinatorMessage::Trigger { properties, reply })
            .await?
    }

    /// Trigger an attempt and wait until it completes or fails.
    pub async fn trigger_checkpoint(
        &self,
        properties: CheckpointProperties,
    ) -> Result<CompletedCheckpointInfo> {
        let (_, completion) = self.start_checkpoint(properties).await?;
        completion
            .await
            .map_err(|_| CheckpointError::ServiceStopped)?
    }

    pub async fn trigger_savepoint(&self, format: SavepointFormat) -> Result<CompletedCheckpointInfo> {
        self.trigger_checkpoint(CheckpointProperties::for_savepoint(true, format))
            .await
    }

    pub async fn acknowledge(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        state: StateHandle,
    ) -> Result<AckResult> {
        self.request(|reply| CoordinatorMessage::Acknowledge {
            checkpoint_id,
            attempt,
            state,
            reply: Some(reply),
        })
        .await?
    }

    /// Like [`Self::acknowledge`] without waiting for the outcome.
    pub fn acknowledge_nowait(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        state: StateHandle,
    ) -> Result<()> {
        self.send(CoordinatorMessage::Acknowledge {
            checkpoint_id,
            attempt,
            state,
            reply: None,
        })
    }

    pub fn decline(
        &self,
        checkpoint_id: CheckpointId,
        attempt: ExecutionAttemptId,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.send(CoordinatorMessage::Decline {
            checkpoint_id,
            attempt,
            reason: reason.into(),
        })
    }

    pub fn expire(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.send(CoordinatorMessage::Expire(checkpoint_id))
    }

    pub async fn restore_latest(
        &self,
        claim_mode: RecoveryClaimMode,
    ) -> Result<Option<CompletedCheckpoint>> {
        self.request(|reply| CoordinatorMessage::Restore { claim_mode, reply })
            .await?
    }

    pub async fn dispose_savepoint(&self, checkpoint_id: CheckpointId) -> Result<CompletedCheckpoint> {
        self.request(|reply| CoordinatorMessage::DisposeSavepoint {
            checkpoint_id,
            reply,
        })
        .await?
    }

    pub async fn completed_checkpoints(&self) -> Result<Vec<CompletedCheckpointInfo>> {
        self.request(|reply| CoordinatorMessage::ListCompleted { reply })
            .await
    }

    pub async fn pending_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        self.request(|reply| CoordinatorMessage::ListPending { reply })
            .await
    }

    /// Shut the coordinator down. The service loop exits afterwards.
    pub async fn shutdown(&self, status: JobStatus) -> Result<()> {
        self.request(|reply| CoordinatorMessage::Shutdown { status, reply })
            .await?
    }
}

impl ExecutionStateUpdateListener for CoordinatorHandle {
    fn on_state_update(
        &self,
        attempt: ExecutionAttemptId,
        previous: ExecutionState,
        new: ExecutionState,
    ) {
        if self
            .send(CoordinatorMessage::StateUpdate {
                attempt,
                previous,
                new,
            })
            .is_err()
        {
            tracing::debug!(
                "coordinator stopped, dropping state update of {} to {}",
                attempt,
                new
            );
        }
    }
}
