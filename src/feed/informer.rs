//! Watch-to-cache bridge
//!
//! An [`Informer`] applies a kube watch stream to a reflector [`Writer`] and
//! hands each change to a callback as a [`FeedEvent`], always after the
//! cache reflects it. On top of the raw watch it adds:
//! - `Updated { old, new }` pairs, with `old` taken from the cache
//! - tombstones for objects that disappeared across a relist
//! - optional periodic resync re-delivering every cached object

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher;
use kube::Resource;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{FeedEvent, Observed};

/// Objects received during an in-progress relist
struct Relist<K: Resource>
where
    K::DynamicType: Eq + Hash + Clone,
{
    seen: HashSet<ObjectRef<K>>,
    pending: Vec<(Option<Arc<K>>, ObjectRef<K>)>,
}

/// Drives one resource type's cache and change notifications
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    resync_period: Option<Duration>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Create an informer writing into `writer`'s store
    pub fn new(writer: Writer<K>) -> Self {
        Self {
            writer,
            resync_period: None,
        }
    }

    /// Re-deliver every cached object as an update each `period`
    ///
    /// A zero period disables resync.
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync_period = (!period.is_zero()).then_some(period);
        self
    }

    /// Consume `events` until the stream ends or `cancel` fires
    ///
    /// Watch errors are logged and skipped; the stream is expected to
    /// recover on its own (e.g. through `WatchStreamExt::default_backoff`).
    pub async fn run<S, F>(mut self, events: S, cancel: CancellationToken, mut handler: F)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
        F: FnMut(FeedEvent<K>),
    {
        let reader = self.writer.as_reader();
        let mut relist: Option<Relist<K>> = None;
        let mut resync = self.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut events = std::pin::pin!(events);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = next_tick(&mut resync) => {
                    let cached = reader.state();
                    debug!(objects = cached.len(), "resyncing cache");
                    for obj in cached {
                        handler(FeedEvent::Updated { old: obj.clone(), new: obj });
                    }
                }
                event = events.next() => match event {
                    None => break,
                    Some(Err(e)) => warn!(error = %e, "watch error; waiting for the stream to recover"),
                    Some(Ok(event)) => {
                        self.apply(event, &reader, &mut relist, &mut handler);
                    }
                },
            }
        }
    }

    fn apply<F>(
        &mut self,
        event: watcher::Event<K>,
        reader: &Store<K>,
        relist: &mut Option<Relist<K>>,
        handler: &mut F,
    ) where
        F: FnMut(FeedEvent<K>),
    {
        match &event {
            watcher::Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let old = reader.get(&key);
                self.writer.apply_watcher_event(&event);
                if let Some(new) = reader.get(&key) {
                    handler(changed(old, new));
                }
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                handler(FeedEvent::Deleted(Observed::Live(Arc::new(obj.clone()))));
            }
            watcher::Event::Init => {
                *relist = Some(Relist {
                    seen: HashSet::new(),
                    pending: Vec::new(),
                });
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectRef::from_obj(obj);
                // The store keeps serving the previous listing until InitDone
                let old = reader.get(&key);
                if let Some(state) = relist.as_mut() {
                    state.seen.insert(key.clone());
                    state.pending.push((old, key));
                }
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                let before = reader.state();
                self.writer.apply_watcher_event(&event);
                let Some(state) = relist.take() else {
                    return;
                };

                for (old, key) in state.pending {
                    if let Some(new) = reader.get(&key) {
                        handler(changed(old, new));
                    }
                }
                for obj in before {
                    if !state.seen.contains(&ObjectRef::from_obj(obj.as_ref())) {
                        handler(FeedEvent::Deleted(Observed::Tombstone(obj)));
                    }
                }
            }
        }
    }
}

fn changed<K>(old: Option<Arc<K>>, new: Arc<K>) -> FeedEvent<K> {
    match old {
        Some(old) => FeedEvent::Updated { old, new },
        None => FeedEvent::Added(new),
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector;

    fn deployment(name: &str, resource_version: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Flattened view of a feed event for assertions
    #[derive(Debug, PartialEq)]
    enum Seen {
        Added(String),
        Updated(String, String),
        Deleted(String),
        Tombstone(String),
    }

    fn describe(event: FeedEvent<Deployment>) -> Seen {
        let rv = |d: &Deployment| d.metadata.resource_version.clone().unwrap_or_default();
        let name = |d: &Deployment| d.metadata.name.clone().unwrap_or_default();
        match event {
            FeedEvent::Added(d) => Seen::Added(name(&d)),
            FeedEvent::Updated { old, new } => Seen::Updated(rv(&old), rv(&new)),
            FeedEvent::Deleted(Observed::Live(d)) => Seen::Deleted(name(&d)),
            FeedEvent::Deleted(Observed::Tombstone(d)) => Seen::Tombstone(name(&d)),
        }
    }

    async fn run_events(
        informer: Informer<Deployment>,
        events: Vec<watcher::Event<Deployment>>,
    ) -> Vec<Seen> {
        let mut seen = Vec::new();
        informer
            .run(
                stream::iter(events.into_iter().map(Ok)),
                CancellationToken::new(),
                |event| seen.push(describe(event)),
            )
            .await;
        seen
    }

    #[tokio::test]
    async fn initial_list_is_delivered_after_cache_swap() {
        let (store, writer) = reflector::store();
        let seen = run_events(
            Informer::new(writer),
            vec![
                watcher::Event::Init,
                watcher::Event::InitApply(deployment("a", "1")),
                watcher::Event::InitApply(deployment("b", "1")),
                watcher::Event::InitDone,
            ],
        )
        .await;

        assert_eq!(
            seen,
            vec![Seen::Added("a".to_string()), Seen::Added("b".to_string())]
        );
        assert_eq!(store.state().len(), 2);
    }

    #[tokio::test]
    async fn apply_of_cached_object_is_an_update_with_old_state() {
        let (_store, writer) = reflector::store();
        let seen = run_events(
            Informer::new(writer),
            vec![
                watcher::Event::Apply(deployment("a", "1")),
                watcher::Event::Apply(deployment("a", "2")),
                watcher::Event::Delete(deployment("a", "3")),
            ],
        )
        .await;

        assert_eq!(
            seen,
            vec![
                Seen::Added("a".to_string()),
                Seen::Updated("1".to_string(), "2".to_string()),
                Seen::Deleted("a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn objects_missing_from_relist_become_tombstones() {
        let (store, writer) = reflector::store();
        let seen = run_events(
            Informer::new(writer),
            vec![
                watcher::Event::Init,
                watcher::Event::InitApply(deployment("a", "1")),
                watcher::Event::InitApply(deployment("b", "1")),
                watcher::Event::InitDone,
                // watch restarted; b was deleted while disconnected
                watcher::Event::Init,
                watcher::Event::InitApply(deployment("a", "1")),
                watcher::Event::InitDone,
            ],
        )
        .await;

        assert_eq!(
            seen,
            vec![
                Seen::Added("a".to_string()),
                Seen::Added("b".to_string()),
                Seen::Updated("1".to_string(), "1".to_string()),
                Seen::Tombstone("b".to_string()),
            ]
        );
        assert_eq!(store.state().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_redelivers_cached_objects() {
        let (_store, writer) = reflector::store();
        let informer = Informer::new(writer).with_resync(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let events = stream::iter(vec![Ok(watcher::Event::Apply(deployment("a", "5")))])
            .chain(stream::pending());

        let mut seen = Vec::new();
        let stopper = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(75)).await;
                cancel.cancel();
            }
        };
        tokio::join!(
            informer.run(events, cancel, |event| seen.push(describe(event))),
            stopper
        );

        assert_eq!(
            seen,
            vec![
                Seen::Added("a".to_string()),
                Seen::Updated("5".to_string(), "5".to_string()),
                Seen::Updated("5".to_string(), "5".to_string()),
            ]
        );
    }

    #[test]
    fn zero_resync_period_disables_resync() {
        let (_store, writer) = reflector::store::<Deployment>();
        let informer = Informer::new(writer).with_resync(Duration::ZERO);
        assert!(informer.resync_period.is_none());
    }
}
