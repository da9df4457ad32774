//! Worker pool driving Foo reconciliation
//!
//! Workers pull identities from the retry queue, reconcile them and report
//! the outcome back to the queue. A queue identity is only ever held by one
//! worker, so reconciles of the same Foo never overlap.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::foo::{reconcile, Context};
use crate::cache::{CacheSync, ObjectName};
use crate::queue::RetryQueue;
use crate::Error;

/// Default time allowed for the informer caches to complete their initial list
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs reconcile workers against a shared queue
pub struct Controller {
    queue: Arc<RetryQueue<ObjectName>>,
    ctx: Arc<Context>,
    caches: Vec<Arc<dyn CacheSync>>,
    cache_sync_timeout: Duration,
}

impl Controller {
    /// Create a controller consuming `queue`
    ///
    /// Workers don't start until every cache in `caches` reports synced.
    pub fn new(
        queue: Arc<RetryQueue<ObjectName>>,
        ctx: Arc<Context>,
        caches: Vec<Arc<dyn CacheSync>>,
    ) -> Self {
        Self {
            queue,
            ctx,
            caches,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
        }
    }

    /// Override how long `run` waits for cache sync
    pub fn with_cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    /// Wait for cache sync, then run `workers` workers until `cancel` fires
    ///
    /// Only a failed or timed out cache sync is an error. On cancellation the
    /// queue is shut down and in-flight reconciles are allowed to finish
    /// before this returns.
    pub async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<(), Error> {
        info!("Starting Foo controller");

        info!("Waiting for informer caches to sync");
        let synced = tokio::time::timeout(
            self.cache_sync_timeout,
            try_join_all(self.caches.iter().map(|cache| cache.wait_synced())),
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cancelled before caches synced");
                self.queue.shut_down();
                return Ok(());
            }
            result = synced => match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.queue.shut_down();
                    return Err(e);
                }
                Err(_) => {
                    self.queue.shut_down();
                    return Err(Error::cache_sync(format!(
                        "timed out after {:?}",
                        self.cache_sync_timeout
                    )));
                }
            },
        }

        info!(workers, "Starting workers");
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            tasks.spawn(run_worker(
                id,
                self.queue.clone(),
                self.ctx.clone(),
                cancel.clone(),
            ));
        }
        info!("Started workers");

        cancel.cancelled().await;
        info!("Shutting down workers");
        self.queue.shut_down_with_drain().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }
        info!("Workers stopped");
        Ok(())
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<RetryQueue<ObjectName>>,
    ctx: Arc<Context>,
    cancel: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };
        process_work_item(&queue, &ctx, key).await;
    }
    debug!(worker = id, "worker stopped");
}

/// Reconcile one checked-out identity and report the outcome to the queue
///
/// Success clears the identity's back-off. Retryable failures (including a
/// panicking reconcile) are requeued with back-off; anything else is logged
/// and dropped until the next change notification.
pub(crate) async fn process_work_item(queue: &Arc<RetryQueue<ObjectName>>, ctx: &Context, key: ObjectName) {
    let result = AssertUnwindSafe(reconcile(&key, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(Error::ReconcilePanic(panic_message(panic.as_ref()))));
    queue.done(&key);

    match result {
        Ok(()) => {
            queue.forget(&key);
            info!(foo = %key, "Successfully synced");
        }
        Err(e) if e.is_retryable() => {
            error!(
                foo = %key,
                error = %e,
                requeues = queue.num_requeues(&key),
                "Error syncing; requeuing for later retry"
            );
            queue.add_rate_limited(key);
        }
        Err(e) => {
            warn!(foo = %key, error = %e, "Error syncing; not retrying");
            queue.forget(&key);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
