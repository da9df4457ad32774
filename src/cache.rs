//! Read-only views over the informer caches
//!
//! The controller never mutates cached objects. Listers hand out `Arc`s that
//! are shared with the cache; anything that needs changing is cloned first
//! and written through a mutation client.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;

use crate::Error;

/// Namespace/name identity of a namespaced object
///
/// This is the work item carried by the retry queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectName {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectName {
    /// Create an identity from a namespace and a name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Extract the identity of a namespaced object
    ///
    /// Fails for objects without a name or namespace, which the change feed
    /// should never deliver for namespaced kinds.
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self, Error> {
        let meta = obj.meta();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::invalid_object("object has no name"))?;
        let namespace = meta
            .namespace
            .clone()
            .ok_or_else(|| Error::invalid_object(format!("object {name} has no namespace")))?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read capability over a locally cached resource type
pub trait Lister<K>: Send + Sync {
    /// Look up an object by identity, `None` if it isn't cached
    fn get(&self, key: &ObjectName) -> Option<Arc<K>>;
}

impl<K> Lister<K> for Store<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn get(&self, key: &ObjectName) -> Option<Arc<K>> {
        let obj_ref = ObjectRef::<K>::new(&key.name).within(&key.namespace);
        Store::get(self, &obj_ref)
    }
}

/// Readiness capability: resolves once the cache holds its initial listing
#[async_trait]
pub trait CacheSync: Send + Sync {
    /// Wait until the initial list has been applied to the cache
    async fn wait_synced(&self) -> Result<(), Error>;
}

#[async_trait]
impl<K> CacheSync for Store<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    async fn wait_synced(&self) -> Result<(), Error> {
        self.wait_until_ready()
            .await
            .map_err(|e| Error::cache_sync(e.to_string()))
    }
}
