//! Change feed: turns cache notifications into work items
//!
//! [`informer`] converts watch streams into [`FeedEvent`]s after the cache has
//! been updated. [`EventHandler`] maps those events to Foo identities and
//! puts them on the retry queue. Foo changes enqueue the Foo itself;
//! Deployment changes enqueue the Foo that controls the Deployment.

pub mod informer;

use std::sync::Arc;

use kube::Resource;
use tracing::{debug, error};

use crate::cache::ObjectName;
use crate::crd::Foo;
use crate::owner::OwnerResolver;
use crate::queue::RetryQueue;

/// A deleted object as delivered by the change feed
#[derive(Debug)]
pub enum Observed<K> {
    /// The delete itself was observed; this is the object's final state
    Live(Arc<K>),
    /// The object vanished while the watch was disconnected; this is the
    /// last state the cache knew about, which may be stale
    Tombstone(Arc<K>),
}

impl<K> Observed<K> {
    /// The last known object, whichever way the delete was observed
    pub fn into_last_known(self) -> Arc<K> {
        match self {
            Observed::Live(obj) | Observed::Tombstone(obj) => obj,
        }
    }
}

/// A change notification for one cached object
#[derive(Debug)]
pub enum FeedEvent<K> {
    /// Object appeared in the cache
    Added(Arc<K>),
    /// Object was re-delivered; `old` and `new` are equal on periodic resync
    Updated {
        /// Cached state before this notification
        old: Arc<K>,
        /// Cached state after this notification
        new: Arc<K>,
    },
    /// Object left the cache
    Deleted(Observed<K>),
}

/// Maps change notifications onto the retry queue
#[derive(Clone)]
pub struct EventHandler {
    queue: Arc<RetryQueue<ObjectName>>,
    resolver: OwnerResolver,
}

impl EventHandler {
    /// Create a handler feeding `queue`, resolving owners through `resolver`
    pub fn new(queue: Arc<RetryQueue<ObjectName>>, resolver: OwnerResolver) -> Self {
        Self { queue, resolver }
    }

    /// Handle a Foo notification: adds and updates enqueue the Foo
    ///
    /// Deletes need no work; with the Foo gone there is nothing left to
    /// converge and garbage collection removes its Deployment.
    pub fn on_foo(&self, event: FeedEvent<Foo>) {
        match event {
            FeedEvent::Added(foo) | FeedEvent::Updated { new: foo, .. } => self.enqueue(foo.as_ref()),
            FeedEvent::Deleted(_) => {}
        }
    }

    /// Handle a notification for an object a Foo may control
    pub fn on_owned<K: Resource>(&self, event: FeedEvent<K>) {
        match event {
            FeedEvent::Added(obj) => self.handle_object(obj.as_ref()),
            FeedEvent::Updated { old, new } => {
                // Resyncs re-deliver unchanged objects; distinct versions always differ here
                if old.meta().resource_version == new.meta().resource_version {
                    return;
                }
                self.handle_object(new.as_ref());
            }
            FeedEvent::Deleted(observed) => {
                if let Observed::Tombstone(obj) = &observed {
                    debug!(
                        object = obj.meta().name.as_deref().unwrap_or_default(),
                        "recovered deleted object from tombstone"
                    );
                }
                self.handle_object(observed.into_last_known().as_ref());
            }
        }
    }

    fn enqueue<K: Resource>(&self, obj: &K) {
        match ObjectName::from_resource(obj) {
            Ok(key) => self.queue.add(key),
            Err(e) => error!(error = %e, "dropping notification for malformed object"),
        }
    }

    fn handle_object<K: Resource>(&self, obj: &K) {
        debug!(
            object = obj.meta().name.as_deref().unwrap_or_default(),
            namespace = obj.meta().namespace.as_deref().unwrap_or_default(),
            "processing object"
        );
        if let Some(key) = self.resolver.resolve(obj) {
            self.queue.add(key);
        }
    }
}
