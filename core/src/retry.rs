use std::time::Duration;

use backon::BackoffBuilder;

use crate::error::ExecError;

/// How many times to attempt a command and how long to wait in between.
///
/// Waits grow linearly: `attempt * backoff_unit` after the `attempt`-th failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,
    /// Wait unit multiplied by the attempt index.
    pub backoff_unit: Duration,
    /// Upper bound on any single backend call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(20),
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Same policy with a different attempt budget.
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self { max_attempts: max_attempts.max(1), ..self }
    }

    /// Wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    /// Whether a failed attempt may be followed by another one.
    pub fn is_retryable(err: &ExecError) -> bool {
        !matches!(err, ExecError::DeviceNotFound { .. })
    }

    /// Longest an execution can legitimately take: every attempt spending a
    /// full timeout on each of its three backend calls, plus every wait.
    pub fn execution_budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let calls = self.call_timeout.saturating_mul(3 * attempts);
        let waits = (1..attempts).map(|a| self.delay_for(a)).sum::<Duration>();
        calls + waits
    }

    pub(crate) fn backoff(&self) -> LinearBuilder {
        LinearBuilder { unit: self.backoff_unit, retries: self.max_attempts.max(1) - 1 }
    }
}

/// `backon` builder yielding `unit, 2*unit, 3*unit, …` for `retries` waits.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LinearBuilder {
    unit: Duration,
    retries: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LinearBackoff {
    unit: Duration,
    retries: u32,
    done: u32,
}

impl BackoffBuilder for LinearBuilder {
    type Backoff = LinearBackoff;

    fn build(self) -> Self::Backoff {
        LinearBackoff { unit: self.unit, retries: self.retries, done: 0 }
    }
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.done >= self.retries {
            return None;
        }
        self.done += 1;
        Some(self.unit.saturating_mul(self.done))
    }
}
