//! Retry policies with exponential backoff and jitter
//!
//! A [`RetryPolicy`] can be attached to individual nodes or set as the
//! graph-wide default. The runner consults it when a task fails:
//!
//! ```text
//! delay = initial_interval × backoff_factor ^ attempt
//! delay = min(delay, max_interval)
//! if jitter: delay *= random(1.0..1.25)
//! ```
//!
//! Interrupts, invalid updates, validation errors and cancellation are never
//! retried, whatever the policy says. Use [`RetryPolicy::with_retry_on`] to
//! narrow retries further.
//!
//! ```rust
//! use pregel_core::RetryPolicy;
//!
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval(1.0)
//!     .with_backoff_factor(3.0)
//!     .with_max_interval(60.0)
//!     .with_jitter(false);
//!
//! assert_eq!(policy.calculate_delay(0).as_secs_f64(), 1.0);
//! assert_eq!(policy.calculate_delay(2).as_secs_f64(), 9.0);
//! ```

use crate::error::GraphError;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type RetryPredicate = Arc<dyn Fn(&GraphError) -> bool + Send + Sync>;

/// How often, and how patiently, a failing task is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,

    /// Delay before the first retry, in seconds
    pub initial_interval: f64,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,

    /// Upper bound for any delay, in seconds
    pub max_interval: f64,

    pub jitter: bool,

    retry_on: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
            retry_on: None,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Only retry errors for which `predicate` returns true.
    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&GraphError) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Delay before retry number `attempt + 1` (`attempt` is zero-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped_delay = base_delay.min(self.max_interval).max(0.0);

        let final_delay = if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(1.0..=1.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Whether a task that failed with `error` on its `attempts`-th try
    /// should run again.
    pub fn should_retry(&self, attempts: usize, error: &GraphError) -> bool {
        if attempts >= self.max_attempts || error.is_permanent() {
            return false;
        }
        self.retry_on.as_ref().map_or(true, |predicate| predicate(error))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_interval", &self.max_interval)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "<function>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.max_interval, 128.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(100.0)
            .with_jitter(false);

        let delays: Vec<f64> = (0..4).map(|a| policy.calculate_delay(a).as_secs_f64()).collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(10.0)
            .with_max_interval(50.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(5).as_secs_f64(), 50.0);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5).with_initial_interval(1.0);
        for _ in 0..20 {
            let delay = policy.calculate_delay(2).as_secs_f64();
            assert!((4.0..=5.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_should_retry_respects_attempts_and_error_kind() {
        let policy = RetryPolicy::new(3);
        let transient = GraphError::custom("connection reset");
        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));

        assert!(!policy.should_retry(1, &GraphError::Interrupt(vec![])));
        assert!(!policy.should_retry(1, &GraphError::invalid_update("bad")));
    }

    #[test]
    fn test_retry_on_predicate() {
        let policy = RetryPolicy::new(5)
            .with_retry_on(|err| matches!(err, GraphError::Timeout { .. }));
        assert!(!policy.should_retry(1, &GraphError::custom("boom")));
        let timeout = GraphError::Timeout {
            operation: "fetch".into(),
            duration_ms: 10,
        };
        assert!(policy.should_retry(1, &timeout));
    }
}
