use std::time::Duration;

use weave_core::config::{BackoffStrategy, RuntimeConfig};
use weave_core::error::WeaveError;

/// Backoff policy evaluation, independent of what is being retried.
#[derive(Debug, Clone)]
pub struct RetryController {
    strategy: BackoffStrategy,
    base: f64,
    multiplier: f64,
    max_retries: u32,
    jitter: bool,
}

impl RetryController {
    pub fn new(strategy: BackoffStrategy, base_secs: f64, multiplier: f64, max_retries: u32) -> Self {
        Self {
            strategy,
            base: base_secs.max(0.0),
            multiplier,
            max_retries,
            jitter: false,
        }
    }

    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self::new(
            runtime.retry_backoff,
            runtime.retry_delay,
            runtime.retry_backoff_multiplier,
            runtime.max_retries,
        )
        .with_jitter(runtime.retry_jitter)
    }

    /// Scale each delay by a random 0.8x to 1.2x factor.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Deterministic delay in seconds before retry `attempt` (0-based).
    pub fn delay_secs(&self, attempt: u32) -> f64 {
        let i = attempt as f64;
        let d = self.base;
        let m = self.multiplier;
        let secs = match self.strategy {
            BackoffStrategy::Exponential => d * m.powf(i),
            BackoffStrategy::Linear => d + i * d * (m - 1.0),
            BackoffStrategy::Constant => d,
        };
        if secs.is_finite() {
            secs.max(0.0)
        } else {
            f64::MAX
        }
    }

    /// Delay before retry `attempt`, jittered if enabled and capped by
    /// whatever remains of the workflow deadline.
    pub fn delay(&self, attempt: u32, remaining: Option<Duration>) -> Duration {
        let mut secs = self.delay_secs(attempt);
        if self.jitter {
            secs *= 0.8 + rand::random::<f64>() * 0.4;
        }
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match remaining {
            Some(left) => delay.min(left),
            None => delay,
        }
    }

    /// Whether another attempt is allowed after `attempts_made` invocations.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made <= self.max_retries
    }

    /// Terminal error once retries are used up.
    pub fn exhausted(&self, unit: &str, attempts: u32, last: WeaveError) -> WeaveError {
        WeaveError::RetryExhausted {
            unit: unit.to_string(),
            attempts,
            last: Box::new(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delays(c: &RetryController) -> Vec<f64> {
        (0..4).map(|i| c.delay_secs(i)).collect()
    }

    #[test]
    fn exponential_doubles() {
        let c = RetryController::new(BackoffStrategy::Exponential, 1.0, 2.0, 4);
        assert_eq!(delays(&c), vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn linear_adds_step() {
        let c = RetryController::new(BackoffStrategy::Linear, 1.0, 2.0, 4);
        assert_eq!(delays(&c), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn constant_is_flat() {
        let c = RetryController::new(BackoffStrategy::Constant, 2.0, 2.0, 4);
        assert_eq!(delays(&c), vec![2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn delay_capped_by_deadline() {
        let c = RetryController::new(BackoffStrategy::Exponential, 1.0, 2.0, 4);
        assert_eq!(c.delay(3, None), Duration::from_secs(8));
        assert_eq!(
            c.delay(3, Some(Duration::from_millis(1500))),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn jitter_stays_in_band() {
        let c = RetryController::new(BackoffStrategy::Constant, 10.0, 1.0, 1).with_jitter(true);
        for _ in 0..50 {
            let d = c.delay(0, None).as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn retry_budget() {
        let c = RetryController::new(BackoffStrategy::Constant, 0.0, 1.0, 2);
        assert!(c.should_retry(1));
        assert!(c.should_retry(2));
        assert!(!c.should_retry(3));
    }

    #[test]
    fn from_runtime_defaults() {
        let c = RetryController::from_runtime(&RuntimeConfig::default());
        assert_eq!(c.max_retries(), 3);
        assert_eq!(c.delay_secs(2), 4.0);
    }
}
