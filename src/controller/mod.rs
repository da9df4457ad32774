//! Foo controller
//!
//! [`foo`] holds the reconciliation logic for a single Foo. [`worker`] drives
//! it: waits for the caches, then runs a pool of workers pulling Foo
//! identities off the retry queue until cancelled.

mod foo;
mod worker;

pub use foo::{
    new_deployment, reconcile, Context, DeploymentClient, FooStatusClient, KubeDeploymentClient,
    KubeFooStatusClient,
};
pub use worker::Controller;
