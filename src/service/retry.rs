//! Per-provider exponential backoff retry supervision.

use std::time::Duration;

/// `delay(attempt) = min(base * multiplier^attempt, cap)`.
///
/// Defaults to `base=30s`, `multiplier=2`, no cap. Attempts beyond ~5
/// reach multi-hour delays on the defaults, which is the intended
/// "stays effectively flat" behavior without an artificial ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            multiplier: 2,
            cap: None,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        let delay = self.base.saturating_mul(factor);
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Tracks the retry state for one provider. Cancelled on `stopProvider`.
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempt: u32,
    pub task: Option<tokio::task::JoinHandle<()>>,
}

impl RetryState {
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.attempt = 0;
    }

    pub fn clear_on_success(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt_with_no_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30 * 32));
    }

    #[test]
    fn delay_respects_an_explicit_cap() {
        let policy = RetryPolicy {
            base: Duration::from_secs(30),
            multiplier: 2,
            cap: Some(Duration::from_secs(300)),
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(300));
    }

    #[test]
    fn retry_state_cancel_resets_attempt_counter() {
        let mut state = RetryState { attempt: 4, task: None };
        state.cancel();
        assert_eq!(state.attempt, 0);
    }
}
