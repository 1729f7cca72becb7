//! Checkpoint coordination: the single-writer state machine and the service
//! loop that serializes every input into it.

use crate::config::CheckpointCoordinatorConfig;
use crate::error::{CheckpointError, Result, TriggerRejectReason};
use crate::listener::{CheckpointLifecycleListener, ExecutionStateUpdateListener};
use crate::pending::{AckResult, CompletionReceiver, PendingCheckpoint};
use crate::properties::{CheckpointProperties, RecoveryClaimMode, SavepointFormat};
use crate::store::{
    CheckpointStorage, CompletedCheckpoint, CompletedCheckpointInfo, CompletedCheckpointStore,
};
use crate::types::{
    CheckpointId, ExecutionAttemptId, ExecutionState, JobStatus, StateHandle, Timestamp,
    VertexId, current_unix_millis,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

mod failure_manager;
mod gateway;
mod service;
mod state_machine;
mod stats;

pub use failure_manager::*;
pub use gateway::*;
pub use service::*;
pub use state_machine::*;
pub use stats::*;

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod service_tests;
