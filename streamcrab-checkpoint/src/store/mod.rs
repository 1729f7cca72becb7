//! Registry of completed snapshots and the storage collaborator interface.

use crate::error::{CheckpointError, Result};
use crate::properties::CheckpointProperties;
use crate::types::{CheckpointId, ExecutionAttemptId, JobStatus, StateHandle, Timestamp};
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

mod fs_store;
mod metadata;
mod retained;
mod standalone;
mod storage;

pub use fs_store::*;
pub use metadata::*;
pub use standalone::*;
pub use storage::*;

use retained::RetainedCheckpoints;

/// Durable registry of completed snapshots.
///
/// Mutated only by the coordinator's serialization point; read by recovery
/// before the coordinator starts.
pub trait CompletedCheckpointStore: Send {
    /// Register a completed snapshot and enforce retention.
    ///
    /// Returns the ids of snapshots subsumed by this addition.
    fn add(&mut self, checkpoint: CompletedCheckpoint) -> Result<Vec<CheckpointId>>;

    /// The snapshot with the greatest id, the only automatic restore candidate.
    fn latest(&self) -> Option<CompletedCheckpoint>;

    /// All retained snapshots in ascending id order.
    fn list_all(&self) -> Vec<CompletedCheckpoint>;

    /// Give a registered snapshot new properties for the lifetime of this
    /// store instance. Durable records keep their original properties, so
    /// the next run sees the snapshot as it was written.
    ///
    /// Returns the updated record, `None` if the id is not registered.
    fn override_properties(
        &mut self,
        checkpoint_id: CheckpointId,
        properties: CheckpointProperties,
    ) -> Result<Option<CompletedCheckpoint>>;

    /// Unregister a snapshot without discarding its data.
    fn remove(&mut self, checkpoint_id: CheckpointId) -> Result<Option<CompletedCheckpoint>>;

    /// Discard every snapshot whose properties flag `status`.
    ///
    /// Every discard is attempted; failures are collected into
    /// [`CheckpointError::DiscardFailures`] and the affected records are kept.
    fn shutdown(&mut self, status: JobStatus) -> Result<()>;

    fn num_retained(&self) -> usize;

    fn max_retained(&self) -> usize;
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
