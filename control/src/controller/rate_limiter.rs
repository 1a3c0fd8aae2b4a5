//! Work queue rate limiting
//!
//! The delay for a failed item is the larger of:
//! - per-item exponential backoff: `5ms * 2^failures`, capped at 1000s
//! - an overall token bucket: 10 items/sec, burst 100
//!
//! The bucket hands out reservations: when it is empty the caller is told how
//! long to wait for its token instead of being rejected.

use crate::sync::safe_lock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
const DEFAULT_QPS: f64 = 10.0;
const DEFAULT_BURST: u64 = 100;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with reservation semantics
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (burst capacity)
    capacity: f64,
    /// Refill rate (tokens per second)
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket refilling at `rate` tokens per second
    pub fn new(rate: f64, burst: u64) -> Self {
        let capacity = burst as f64;
        Self {
            capacity,
            refill_rate: rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, returning how long the caller must wait for it
    pub fn reserve(&self) -> Duration {
        let mut state = safe_lock(&self.state);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        state.tokens -= 1.0;
        if state.tokens >= 0.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.refill_rate)
        }
    }
}

/// Per-item exponential backoff combined with an overall token bucket
#[derive(Debug)]
pub struct RateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base_delay: Duration,
    max_delay: Duration,
    bucket: TokenBucket,
}

impl<T: Eq + Hash + Clone> Default for RateLimiter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
    }
}

impl<T: Eq + Hash + Clone> RateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration, qps: f64, burst: u64) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
            bucket: TokenBucket::new(qps, burst),
        }
    }

    /// Delay before `item` may be retried; records one more failure
    pub fn when(&self, item: &T) -> Duration {
        let exponential = {
            let mut failures = safe_lock(&self.failures);
            let count = failures.entry(item.clone()).or_insert(0);
            let delay = self.exponential(*count);
            *count = count.saturating_add(1);
            delay
        };
        exponential.max(self.bucket.reserve())
    }

    fn exponential(&self, failures: u32) -> Duration {
        let factor = 2f64.powi(failures.min(64) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Clear the failure history of `item`
    pub fn forget(&self, item: &T) {
        safe_lock(&self.failures).remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        safe_lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}
