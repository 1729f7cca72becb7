use super::*;

/// How a failed task is brought back.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RestartStrategy {
    #[default]
    NoRestart,
    FixedDelay {
        max_attempts: u32,
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    /// `initial * multiplier^n`, capped at `max`.
    ExponentialDelay {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
        multiplier: f64,
        max_attempts: u32,
    },
}

impl RestartStrategy {
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self::FixedDelay {
            max_attempts,
            delay,
        }
    }

    pub fn exponential_delay(
        initial: Duration,
        max: Duration,
        multiplier: f64,
        max_attempts: u32,
    ) -> Self {
        Self::ExponentialDelay {
            initial,
            max,
            multiplier,
            max_attempts,
        }
    }

    fn max_attempts(&self) -> u32 {
        match self {
            Self::NoRestart => 0,
            Self::FixedDelay { max_attempts, .. } | Self::ExponentialDelay { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    pub fn backoff(&self) -> RestartBackoff {
        RestartBackoff::new(self.clone())
    }
}

/// Tracks restarts consumed under one [`RestartStrategy`].
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    strategy: RestartStrategy,
    attempts: u32,
}

impl RestartBackoff {
    pub fn new(strategy: RestartStrategy) -> Self {
        Self {
            strategy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.strategy.max_attempts().saturating_sub(self.attempts)
    }

    /// Consume one restart. `None` once the strategy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_remaining() == 0 {
            return None;
        }
        let delay = match &self.strategy {
            RestartStrategy::NoRestart => return None,
            RestartStrategy::FixedDelay { delay, .. } => *delay,
            RestartStrategy::ExponentialDelay {
                initial,
                max,
                multiplier,
                ..
            } => {
                let factor = multiplier.max(1.0).powi(self.attempts as i32);
                let millis = (initial.as_millis() as f64 * factor).round();
                let max_millis = max.as_millis() as f64;
                Duration::from_millis(millis.min(max_millis) as u64)
            }
        };
        self.attempts += 1;
        Some(delay)
    }

    /// Forget consumed restarts, e.g. after a checkpoint completed.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
