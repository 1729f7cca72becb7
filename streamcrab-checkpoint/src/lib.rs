//! # StreamCrab Checkpoint
//!
//! Checkpoint coordination for the StreamCrab stream processing engine: when
//! a globally consistent snapshot is taken, which tasks take part, when it is
//! complete, which snapshots are retained, and which one recovery restores.
//!
//! - [`properties`]: [`CheckpointProperties`](properties::CheckpointProperties):
//!   snapshot kind and garbage collection policy.
//! - [`pending`]: [`PendingCheckpoint`](pending::PendingCheckpoint): acknowledgment
//!   tracking of one in-flight attempt.
//! - [`store`]: the [`CompletedCheckpointStore`](store::CompletedCheckpointStore)
//!   trait with in-memory and file-system implementations, plus checkpoint storage.
//! - [`coordinator`]: the [`CheckpointCoordinator`](coordinator::CheckpointCoordinator)
//!   state machine and the [`CoordinatorService`](coordinator::CoordinatorService)
//!   loop that drives it.
//! - [`listener`]: execution state and checkpoint lifecycle notifications.
//! - [`strategy`]: restart backoff and failure-injection strategies.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod pending;
pub mod properties;
pub mod store;
pub mod strategy;
pub mod types;
