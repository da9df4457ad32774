//! Deduplicating, rate-limited work queue
//!
//! The queue holds identities, not objects. It guarantees:
//! - at most one pending entry per identity, however many times it is added
//! - at most one worker holds an identity between [`RetryQueue::get`] and
//!   [`RetryQueue::done`]; adds that arrive meanwhile are deferred until `done`
//! - failed identities are re-delivered after a back-off, never dropped
//!
//! Delayed re-adds run on the tokio runtime, so the queue must be used from
//! within one.

pub mod rate_limiter;

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub use rate_limiter::{
    default_controller_rate_limiter, BackoffConfig, BucketRateLimiter,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};

struct QueueState<K> {
    /// Items eligible for `get`, in arrival order
    queue: VecDeque<K>,
    /// Items that need processing, whether queued or waiting on an in-flight copy
    dirty: HashSet<K>,
    /// Items currently checked out by a worker
    processing: HashSet<K>,
}

/// Work queue with coalescing, single-flight delivery and back-off
pub struct RetryQueue<K> {
    state: Mutex<QueueState<K>>,
    /// Wakes blocked `get` calls
    item_ready: Notify,
    /// Wakes `shut_down_with_drain` when an in-flight item finishes
    item_done: Notify,
    shutdown: CancellationToken,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

impl<K> RetryQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue using the given back-off policy for `add_rate_limited`
    pub fn new(rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
            }),
            item_ready: Notify::new(),
            item_done: Notify::new(),
            shutdown: CancellationToken::new(),
            rate_limiter: Box::new(rate_limiter),
        }
    }

    /// Mark `item` as needing processing. Idempotent while it is pending.
    ///
    /// If the item is currently checked out, it is re-delivered once the
    /// holder calls [`RetryQueue::done`].
    pub fn add(&self, item: K) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut state = self.state.lock();
        if state.dirty.contains(&item) {
            trace!(?item, "item already pending");
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(?item, "item in flight, deferring");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.item_ready.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    ///
    /// Pending delayed adds are abandoned when the queue shuts down.
    pub fn add_after(self: &Arc<Self>, item: K, delay: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Re-add `item` after the back-off the rate limiter assigns it
    pub fn add_rate_limited(self: &Arc<Self>, item: K) {
        let delay = self.rate_limiter.when(&item);
        trace!(?item, delay_ms = delay.as_millis() as u64, "requeueing with back-off");
        self.add_after(item, delay);
    }

    /// Clear accumulated back-off for `item`. Call after a successful attempt.
    pub fn forget(&self, item: &K) {
        self.rate_limiter.forget(item);
    }

    /// Number of consecutive failures recorded for `item`
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item and check it out.
    ///
    /// Returns `None` once the queue is shutting down. Dropping the returned
    /// future before it completes leaves the queue untouched.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Finish processing `item`, releasing it for re-delivery
    pub fn done(&self, item: &K) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        let requeue = state.dirty.contains(item);
        if requeue {
            state.queue.push_back(item.clone());
        }
        drop(state);

        if requeue {
            self.item_ready.notify_one();
        }
        self.item_done.notify_waiters();
    }

    /// Number of items eligible for `get`
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no items are eligible for `get`
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`RetryQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting work and release every blocked `get` with `None`
    pub fn shut_down(&self) {
        self.shutdown.cancel();
    }

    /// Shut down, then wait until every checked-out item has been `done`
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.item_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<RetryQueue<String>> {
        Arc::new(RetryQueue::new(default_controller_rate_limiter(
            &BackoffConfig::default(),
        )))
    }

    #[tokio::test]
    async fn add_coalesces_pending_items() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        q.add("a".to_string());

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_item_is_deferred_until_done() {
        let q = queue();
        q.add("a".to_string());
        let item = q.get().await.unwrap();

        // many notifications while in flight collapse into one re-delivery
        for _ in 0..5 {
            q.add("a".to_string());
        }
        assert_eq!(q.len(), 0);

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let q = queue();
        q.add("a".to_string());
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_blocks_until_item_added() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        q.add("a".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shut_down_releases_blocked_getters() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn shut_down_stops_delivery_and_ignores_adds() {
        let q = queue();
        q.add("a".to_string());
        q.shut_down();
        q.add("b".to_string());

        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_rate_limited_redelivers_after_backoff() {
        let q = queue();
        q.add_rate_limited("a".to_string());
        assert!(q.is_empty());
        assert_eq!(q.num_requeues(&"a".to_string()), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_forgotten() {
        let q = queue();
        let key = "a".to_string();
        q.add_rate_limited(key.clone()); // 5ms
        q.add_rate_limited(key.clone()); // 10ms
        q.add_rate_limited(key.clone()); // 20ms
        assert_eq!(q.num_requeues(&key), 3);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        // three delayed adds, one pending entry
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_adds_are_abandoned_on_shutdown() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_secs(5));
        q.shut_down();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_items() {
        let q = queue();
        q.add("a".to_string());
        let item = q.get().await.unwrap();

        let drain = {
            let q = q.clone();
            tokio::spawn(async move { q.shut_down_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        q.done(&item);
        drain.await.unwrap();
    }
}
