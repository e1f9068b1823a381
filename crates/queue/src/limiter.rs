//! Retry delay policies for [`crate::WorkQueue::add_rate_limited`].

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be re-added; records one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Clear failure history for `item`.
    fn forget(&self, item: &T);
    /// Failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> usize;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailure<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T> ItemExponentialFailure<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialFailure<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(item.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        if exp >= 32 {
            return self.max;
        }
        self.base.checked_mul(1u32 << exp).map(|d| d.min(self.max)).unwrap_or(self.max)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(item).copied().unwrap_or(0) as usize
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Upper bound on a single token-bucket reservation.
pub const MAX_BUCKET_DELAY: Duration = Duration::from_secs(1000);

/// Overall token bucket shared by every item: `qps` refill, `burst` capacity.
/// Reservations may drive the bucket negative; the deficit becomes the delay.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: usize) -> Self {
        let burst = burst.max(1) as f64;
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, state: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    fn reserve(&self) -> Duration {
        let mut b = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst);
        b.last = now;
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-b.tokens / self.qps).map_or(MAX_BUCKET_DELAY, |d| d.min(MAX_BUCKET_DELAY))
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration { self.reserve() }
    fn forget(&self, _item: &T) {}
    fn num_requeues(&self, _item: &T) -> usize { 0 }
}

/// Combines limiters by taking the worst delay and the highest requeue count.
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters { l.forget(item); }
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// 5ms..1000s per-item backoff combined with a 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOf::new(vec![
        Box::new(ItemExponentialFailure::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(TokenBucket::new(10.0, 100)),
    ])
}
