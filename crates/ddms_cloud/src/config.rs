//! Retry configuration for cloud sync.

use ddms_core::{GeneralError, StoreResult};
use std::time::Duration;

/// Retry and backoff settings of the sync manager.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts a sync request may use in total.
    pub max_times: u32,
    /// Attempts a client triggered change may use.
    pub client_max_times: u32,
    /// Base delay after an ordinary transient failure.
    pub retry_interval: Duration,
    /// Base delay while another process holds the cloud lock.
    pub locked_interval: Duration,
    /// Base delay after local contention.
    pub busy_interval: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound of any computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_times: 6,
            client_max_times: 3,
            retry_interval: Duration::from_secs(10),
            locked_interval: Duration::from_secs(30),
            busy_interval: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total attempt budget.
    #[must_use]
    pub fn with_max_times(mut self, times: u32) -> Self {
        self.max_times = times;
        self
    }

    /// Sets the attempt budget of client triggered changes.
    #[must_use]
    pub fn with_client_max_times(mut self, times: u32) -> Self {
        self.client_max_times = times;
        self
    }

    /// Sets the default retry interval.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the interval used while the cloud lock is held elsewhere.
    #[must_use]
    pub fn with_locked_interval(mut self, interval: Duration) -> Self {
        self.locked_interval = interval;
        self
    }

    /// Sets the interval used after local contention.
    #[must_use]
    pub fn with_busy_interval(mut self, interval: Duration) -> Self {
        self.busy_interval = interval;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// First attempt number of a client triggered change.
    ///
    /// Client changes start further into the budget so they give up sooner.
    pub fn client_start_attempt(&self) -> u32 {
        self.max_times.saturating_sub(self.client_max_times)
    }

    /// Base interval for a sync that ended with `status`.
    pub fn interval(&self, status: StoreResult<()>) -> Duration {
        match status {
            Err(GeneralError::LockedByOthers) => self.locked_interval,
            Err(GeneralError::Busy) => self.busy_interval,
            _ => self.retry_interval,
        }
    }

    /// Delay before retrying the failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, status: StoreResult<()>, attempt: u32) -> Duration {
        let base = self.interval(status).as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = base * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_by_error_kind() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.interval(Err(GeneralError::LockedByOthers)),
            policy.locked_interval
        );
        assert_eq!(policy.interval(Err(GeneralError::Busy)), policy.busy_interval);
        assert_eq!(policy.interval(Ok(())), policy.retry_interval);
        assert_eq!(
            policy.interval(Err(GeneralError::NetworkError)),
            policy.retry_interval
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_retry_interval(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        let status = Err(GeneralError::NetworkError);
        assert_eq!(policy.delay_for_attempt(status, 1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(status, 2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(status, 3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(status, 4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(status, 40), Duration::from_secs(5));
    }

    #[test]
    fn client_budget_is_reduced() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.client_start_attempt(), 3);
        let policy = policy.with_client_max_times(10);
        assert_eq!(policy.client_start_attempt(), 0);
    }

    #[test]
    fn builder() {
        let policy = RetryPolicy::new()
            .with_max_times(2)
            .with_busy_interval(Duration::from_millis(5))
            .with_locked_interval(Duration::from_millis(7))
            .with_backoff_multiplier(1.0);
        assert_eq!(policy.max_times, 2);
        assert_eq!(
            policy.delay_for_attempt(Err(GeneralError::LockedByOthers), 3),
            Duration::from_millis(7)
        );
        assert_eq!(
            policy.delay_for_attempt(Err(GeneralError::Busy), 1),
            Duration::from_millis(5)
        );
    }
}
