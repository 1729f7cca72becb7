//! Failure handling around checkpointing: restart backoff and composable
//! failure-injection decisions used by simulated tasks.

use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

mod failure;
mod restart;

pub use failure::*;
pub use restart::*;

#[cfg(test)]
#[path = "tests/strategy_tests.rs"]
mod tests;
