use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use weave_core::config::RuntimeConfig;

/// Token-bucket admission control shared by all concurrently running units.
///
/// Two buckets: one request per admission, and a token budget debited
/// after each response via [`RateLimiter::record_tokens`]. Admission needs
/// a whole request credit and a positive token balance.
pub struct RateLimiter {
    state: Mutex<Buckets>,
    requests_per_sec: f64,
    tokens_per_sec: f64,
    request_capacity: f64,
    token_capacity: f64,
}

struct Buckets {
    requests: f64,
    tokens: f64,
    refreshed: Instant,
}

impl Buckets {
    fn refill(&mut self, now: Instant, limiter: &RateLimiter) {
        let elapsed = now.saturating_duration_since(self.refreshed).as_secs_f64();
        self.requests = (self.requests + elapsed * limiter.requests_per_sec)
            .min(limiter.request_capacity);
        self.tokens = (self.tokens + elapsed * limiter.tokens_per_sec).min(limiter.token_capacity);
        self.refreshed = now;
    }
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        let request_capacity = requests_per_minute.max(1) as f64;
        let token_capacity = tokens_per_minute.max(1) as f64;
        Self {
            state: Mutex::new(Buckets {
                requests: request_capacity,
                tokens: token_capacity,
                refreshed: Instant::now(),
            }),
            requests_per_sec: request_capacity / 60.0,
            tokens_per_sec: token_capacity / 60.0,
            request_capacity,
            token_capacity,
        }
    }

    /// `None` when rate limiting is disabled.
    pub fn from_runtime(runtime: &RuntimeConfig) -> Option<Self> {
        runtime
            .enable_rate_limiting
            .then(|| Self::new(runtime.requests_per_minute, runtime.tokens_per_minute))
    }

    /// Try to take one request credit. Returns how long to wait otherwise.
    fn try_admit(&self) -> std::result::Result<(), Duration> {
        let mut buckets = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets.refill(Instant::now(), self);

        let request_wait = if buckets.requests >= 1.0 {
            0.0
        } else {
            (1.0 - buckets.requests) / self.requests_per_sec
        };
        let token_wait = if buckets.tokens > 0.0 {
            0.0
        } else {
            // Wait until the balance is back above zero.
            (1.0 - buckets.tokens) / self.tokens_per_sec
        };

        let wait = request_wait.max(token_wait);
        if wait <= 0.0 {
            buckets.requests -= 1.0;
            Ok(())
        } else {
            Err(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
        }
    }

    /// Wait until a call is admitted.
    pub async fn acquire(&self) {
        loop {
            match self.try_admit() {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, delaying");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Debit tokens reported by a completed call. The balance may go negative.
    pub fn record_tokens(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let mut buckets = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets.refill(Instant::now(), self);
        buckets.tokens -= tokens as f64;
    }
}
