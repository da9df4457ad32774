//! Back-off policies for requeued work items
//!
//! A [`RateLimiter`] decides how long a failed item waits before it becomes
//! eligible again. The controller combines a per-item exponential policy with
//! a global token bucket and takes the larger of the two delays, so a single
//! hot item backs off on its own while the bucket bounds aggregate retry
//! throughput across all items.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Computes requeue delays for failing items
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again. Counts as one failure.
    fn when(&self, item: &K) -> Duration;

    /// Stop tracking `item`, clearing any accumulated back-off
    fn forget(&self, item: &K);

    /// Number of consecutive failures recorded for `item`
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item exponential back-off: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: DashMap<K, u32>,
}

impl<K: Eq + Hash> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter starting at `base_delay` and never exceeding `max_delay`
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: DashMap::new(),
        }
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        let exp = {
            let mut entry = self.failures.entry(item.clone()).or_insert(0);
            let exp = *entry;
            *entry = entry.saturating_add(1);
            exp
        };

        // 2^exp overflows u32 long before the cap matters
        let backoff = 2u32
            .checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor));
        match backoff {
            Some(delay) if delay <= self.max_delay => delay,
            _ => self.max_delay,
        }
    }

    fn forget(&self, item: &K) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.get(item).map(|f| *f).unwrap_or(0)
    }
}

/// Global token bucket shared by all items
///
/// Each call to [`RateLimiter::when`] reserves one token. When the bucket is
/// empty the reservation goes into debt and the returned delay is the time
/// until that token will have been refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second, holding at most `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay any of them asks for
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        // Every limiter must observe the failure, so no short-circuiting
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Tuning for [`default_controller_rate_limiter`]
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// First per-item retry delay
    pub base_delay: Duration,
    /// Per-item delay ceiling
    pub max_delay: Duration,
    /// Global retry refill rate (tokens per second)
    pub qps: f64,
    /// Global retry burst size
    pub burst: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 50.0,
            burst: 300,
        }
    }
}

/// Per-item exponential back-off combined with a global token bucket
pub fn default_controller_rate_limiter<K>(config: &BackoffConfig) -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_per_failure() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));

        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&"a"), 3);

        // other items are tracked independently
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_caps_at_max_delay() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        for _ in 0..100 {
            limiter.when(&"a");
        }
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
    }

    #[test]
    fn exponential_forget_resets_backoff() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");

        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn bucket_admits_burst_then_delays() {
        let limiter = BucketRateLimiter::new(10.0, 3);
        for _ in 0..3 {
            assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        }
        let delay = RateLimiter::<&str>::when(&limiter, &"b");
        assert!(delay > Duration::ZERO);
        assert!(delay <= Duration::from_millis(100));

        // debt accumulates for each further reservation
        let next = RateLimiter::<&str>::when(&limiter, &"c");
        assert!(next > delay);
    }

    #[test]
    fn max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(10),
            )),
            Box::new(BucketRateLimiter::new(1.0, 1)),
        ]);

        // bucket admits the first, exponential says 5ms
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        // bucket is now in debt by roughly one second, which dominates
        let delay = limiter.when(&"a");
        assert!(delay > Duration::from_millis(900));
        assert_eq!(limiter.num_requeues(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    #[test]
    fn default_limiter_starts_small() {
        let limiter = default_controller_rate_limiter::<String>(&BackoffConfig::default());
        assert_eq!(limiter.when(&"x".to_string()), Duration::from_millis(5));
    }
}
