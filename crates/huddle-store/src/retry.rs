use std::time::Duration;

use huddle_core::HuddleSettings;

/// Bounded linear backoff for reconnect attempts.
///
/// Delay before retry `n` (1-based) is `min(n * step, cap)`; once `n`
/// exceeds `max_attempts` no further retry is scheduled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_millis(100),
            cap: Duration::from_millis(3_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &HuddleSettings) -> Self {
        Self {
            max_attempts: settings.max_retries,
            step: settings.retry_step(),
            cap: settings.retry_cap(),
        }
    }

    /// Delay before retry number `attempt`, or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        Some(self.step.saturating_mul(attempt).min(self.cap))
    }
}

/// Consecutive failed connect attempts since the last success.
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    attempts: u32,
}

impl RetryState {
    /// Count a failed attempt and return the new total.
    pub(crate) fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings_defaults() {
        assert_eq!(
            RetryPolicy::default(),
            RetryPolicy::from_settings(&HuddleSettings::default())
        );
    }

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_millis(500)));
    }

    #[test]
    fn budget_exhausted_after_max() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(5).is_some());
        assert_eq!(policy.delay_for(6), None);
    }

    #[test]
    fn delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(30), Some(Duration::from_millis(3_000)));
        assert_eq!(policy.delay_for(100), Some(Duration::from_millis(3_000)));
    }

    #[test]
    fn zero_budget_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), None);
    }

    #[test]
    fn state_counts_and_resets() {
        let mut state = RetryState::default();
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        assert_eq!(state.attempts(), 2);
        state.reset();
        assert_eq!(state.attempts(), 0);
    }
}
