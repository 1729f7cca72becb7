use super::*;

static NEXT_STRATEGY_ID: AtomicU64 = AtomicU64::new(1);

fn next_strategy_id() -> u64 {
    NEXT_STRATEGY_ID.fetch_add(1, Ordering::Relaxed)
}

/// How an injected failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The user function errors; the task fails and is restarted.
    UserException,
    /// The task declines the current checkpoint but keeps running.
    DeclineCheckpoint,
    /// The whole process hosting the task goes away.
    TaskExecutorLoss,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UserException => "UserException",
            Self::DeclineCheckpoint => "DeclineCheckpoint",
            Self::TaskExecutorLoss => "TaskExecutorLoss",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Continue,
    Fail(FailureKind),
}

impl FailureDecision {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail(_))
    }
}

/// Remembers which tracked strategies already fired for which subtask, so a
/// restarted subtask does not fail for the same reason again.
#[derive(Debug, Default)]
pub struct FailureTracker {
    fired: Mutex<HashMap<usize, HashSet<u64>>>,
}

impl FailureTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn has_fired(&self, tracking_index: usize, strategy_id: u64) -> bool {
        self.fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tracking_index)
            .is_some_and(|ids| ids.contains(&strategy_id))
    }

    fn record(&self, tracking_index: usize, strategy_id: u64) {
        self.fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tracking_index)
            .or_default()
            .insert(strategy_id);
    }

    /// Number of distinct tracked strategies that fired for `tracking_index`.
    pub fn failures_at(&self, tracking_index: usize) -> usize {
        self.fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tracking_index)
            .map_or(0, HashSet::len)
    }
}

/// Decides, call by call, whether a task should fail.
///
/// Strategies compose: `AnyOf` fails when the first member fails, `Once`
/// stops after its inner strategy fired, and `Tracked` records firings in a
/// [`FailureTracker`] shared across task restarts.
#[derive(Debug)]
pub enum FailureStrategy {
    Never,
    /// Fails exactly on the `fail_after`-th call.
    AfterCalls {
        fail_after: u32,
        kind: FailureKind,
        calls: u32,
    },
    AnyOf(Vec<FailureStrategy>),
    Once {
        inner: Box<FailureStrategy>,
        fired: bool,
    },
    Tracked {
        id: u64,
        inner: Box<FailureStrategy>,
        tracker: Arc<FailureTracker>,
    },
}

impl FailureStrategy {
    pub fn after_calls(fail_after: u32, kind: FailureKind) -> Self {
        Self::AfterCalls {
            fail_after,
            kind,
            calls: 0,
        }
    }

    pub fn any_of(strategies: impl IntoIterator<Item = FailureStrategy>) -> Self {
        Self::AnyOf(strategies.into_iter().collect())
    }

    pub fn once(inner: FailureStrategy) -> Self {
        Self::Once {
            inner: Box::new(inner),
            fired: false,
        }
    }

    pub fn tracked(inner: FailureStrategy, tracker: Arc<FailureTracker>) -> Self {
        Self::Tracked {
            id: next_strategy_id(),
            inner: Box::new(inner),
            tracker,
        }
    }

    pub fn decide(&mut self, tracking_index: usize) -> FailureDecision {
        match self {
            Self::Never => FailureDecision::Continue,
            Self::AfterCalls {
                fail_after,
                kind,
                calls,
            } => {
                *calls = calls.saturating_add(1);
                if *calls == *fail_after {
                    FailureDecision::Fail(*kind)
                } else {
                    FailureDecision::Continue
                }
            }
            Self::AnyOf(strategies) => strategies
                .iter_mut()
                .map(|s| s.decide(tracking_index))
                .find(FailureDecision::is_failure)
                .unwrap_or(FailureDecision::Continue),
            Self::Once { inner, fired } => {
                if *fired {
                    return FailureDecision::Continue;
                }
                let decision = inner.decide(tracking_index);
                *fired = decision.is_failure();
                decision
            }
            Self::Tracked { id, inner, tracker } => {
                if tracker.has_fired(tracking_index, *id) {
                    return FailureDecision::Continue;
                }
                let decision = inner.decide(tracking_index);
                if decision.is_failure() {
                    tracker.record(tracking_index, *id);
                }
                decision
            }
        }
    }
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::AfterCalls {
                fail_after, kind, ..
            } => write!(f, "{kind} (fail after {fail_after} calls)"),
            Self::AnyOf(strategies) => {
                for (i, strategy) in strategies.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" or ")?;
                    }
                    write!(f, "{strategy}")?;
                }
                Ok(())
            }
            Self::Once { inner, .. } => write!(f, "FailingOnce{{{inner}}}"),
            Self::Tracked { inner, .. } => write!(f, "Tracked{{{inner}}}"),
        }
    }
}
