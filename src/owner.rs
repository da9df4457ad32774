//! Owner resolution for generated objects
//!
//! Deployments created by the controller carry a controller owner reference
//! back to their Foo. When a Deployment changes, the reference tells us which
//! Foo has to be reconciled again.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use tracing::debug;

use crate::cache::{Lister, ObjectName};
use crate::crd::Foo;

/// The owner reference with `controller: true`, if any
///
/// An object has at most one controlling owner; the first flagged reference wins.
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether `obj` is controlled by this exact Foo (matched by UID)
pub fn is_controlled_by<K: Resource>(obj: &K, owner: &Foo) -> bool {
    match (controller_of(obj), owner.meta().uid.as_deref()) {
        (Some(owner_ref), Some(uid)) => owner_ref.uid == uid,
        _ => false,
    }
}

/// Maps objects back to the Foo that controls them
#[derive(Clone)]
pub struct OwnerResolver {
    foos: Arc<dyn Lister<Foo>>,
}

impl OwnerResolver {
    /// Create a resolver reading Foos from the given cache
    pub fn new(foos: Arc<dyn Lister<Foo>>) -> Self {
        Self { foos }
    }

    /// Identity of the Foo controlling `obj`, if it is still cached
    ///
    /// Objects with no controller, a controller of another kind, or a
    /// controller that no longer exists resolve to `None`.
    pub fn resolve<K: Resource>(&self, obj: &K) -> Option<ObjectName> {
        let owner_ref = controller_of(obj)?;
        if owner_ref.kind != Foo::kind(&()) {
            return None;
        }

        let namespace = obj.meta().namespace.as_deref()?;
        let key = ObjectName::new(namespace, owner_ref.name.as_str());
        if self.foos.get(&key).is_none() {
            debug!(
                object = obj.meta().name.as_deref().unwrap_or_default(),
                foo = %key,
                "ignoring orphaned object"
            );
            return None;
        }
        Some(key)
    }
}
