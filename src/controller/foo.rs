//! Foo controller implementation
//!
//! Reconciles a Foo against the Deployment it names:
//! - Deployment absent: create it from the Foo spec, owned by the Foo
//! - Deployment present but not controlled by this Foo: report a conflict
//! - Deployment present and controlled: fix the replica count if it drifted
//!
//! Afterwards the Deployment's available replica count is copied into the
//! Foo status. Reconcile only reads from the caches and never retries on its
//! own; failures go back to the worker loop, which requeues with back-off.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::events::EventType;
use kube::runtime::reflector::Store;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::cache::{Lister, ObjectName};
use crate::crd::{Foo, FooStatus};
use crate::events::{
    actions, messages, reasons, EventPublisher, KubeEventPublisher, CONTROLLER_NAME,
};
use crate::owner::is_controlled_by;
use crate::Error;

/// Image run by generated Deployments
const DEPLOYMENT_IMAGE: &str = "nginx:latest";

/// Write capability for Deployments
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Create a Deployment, returning the stored object
    async fn create(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Replace a Deployment, returning the stored object
    async fn update(&self, deployment: &Deployment) -> Result<Deployment, Error>;
}

/// Write capability for the Foo status subresource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FooStatusClient: Send + Sync {
    /// Write `foo.status` through the status subresource
    ///
    /// Only the status is sent; the spec of the stored object is untouched.
    async fn update_status(&self, foo: &Foo) -> Result<Foo, Error>;
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(CONTROLLER_NAME.to_string()),
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String, Error> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::invalid_object(format!("{} has no namespace", obj.name_any())))
}

/// Real Deployment client
pub struct KubeDeploymentClient {
    client: Client,
}

impl KubeDeploymentClient {
    /// Create a client using the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeploymentClient for KubeDeploymentClient {
    async fn create(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace_of(deployment)?);
        Ok(api.create(&post_params(), deployment).await?)
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace_of(deployment)?);
        Ok(api
            .replace(&deployment.name_any(), &post_params(), deployment)
            .await?)
    }
}

/// Real Foo status client
pub struct KubeFooStatusClient {
    client: Client,
}

impl KubeFooStatusClient {
    /// Create a client using the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FooStatusClient for KubeFooStatusClient {
    async fn update_status(&self, foo: &Foo) -> Result<Foo, Error> {
        let api: Api<Foo> = Api::namespaced(self.client.clone(), &namespace_of(foo)?);

        Ok(api
            .patch_status(
                &foo.name_any(),
                &status_patch_params(),
                &Patch::Merge(&status_patch(foo)),
            )
            .await?)
    }
}

/// Merge patch body for a status write: `status` plus the read resourceVersion
///
/// The resourceVersion makes the write conditional on the version we read.
fn status_patch(foo: &Foo) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": foo.metadata.resource_version },
        "status": foo.status,
    })
}

fn status_patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..Default::default()
    }
}

/// Shared context for the Foo controller
pub struct Context {
    /// Cached Foos
    pub foos: Arc<dyn Lister<Foo>>,
    /// Cached Deployments
    pub deployments: Arc<dyn Lister<Deployment>>,
    /// Deployment writes
    pub deployment_client: Arc<dyn DeploymentClient>,
    /// Foo status writes
    pub foo_status: Arc<dyn FooStatusClient>,
    /// Event recording against Foos
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a context backed by the API server and the given informer stores
    pub fn new(client: Client, foos: Store<Foo>, deployments: Store<Deployment>) -> Self {
        Self {
            foos: Arc::new(foos),
            deployments: Arc::new(deployments),
            deployment_client: Arc::new(KubeDeploymentClient::new(client.clone())),
            foo_status: Arc::new(KubeFooStatusClient::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
        }
    }

    /// Create a context from individual capabilities
    pub fn from_parts(
        foos: Arc<dyn Lister<Foo>>,
        deployments: Arc<dyn Lister<Deployment>>,
        deployment_client: Arc<dyn DeploymentClient>,
        foo_status: Arc<dyn FooStatusClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            foos,
            deployments,
            deployment_client,
            foo_status,
            events,
        }
    }
}

/// Reconcile the Foo identified by `key`
///
/// Returns `Ok` when the item needs no further attention, including for
/// Foos that no longer exist and Foos that must be edited before they can
/// make progress. Any `Err` should be requeued with back-off.
#[instrument(skip_all, fields(foo = %key))]
pub async fn reconcile(key: &ObjectName, ctx: &Context) -> Result<(), Error> {
    let Some(foo) = ctx.foos.get(key) else {
        debug!("Foo referenced by work item no longer exists");
        return Ok(());
    };

    if let Err(e) = foo.spec.validate() {
        // Requeueing can't help until the Foo is edited, which enqueues it again
        error!(error = %e, "invalid Foo spec, not retrying");
        return Ok(());
    }

    let deployment_name = foo.spec.deployment_name.as_str();
    let deployment_key = ObjectName::new(key.namespace.as_str(), deployment_name);

    let deployment = match ctx.deployments.get(&deployment_key) {
        None => {
            info!(deployment = %deployment_name, "creating deployment");
            let created = ctx
                .deployment_client
                .create(&new_deployment(&foo)?)
                .await?;
            Arc::new(created)
        }
        Some(existing) => {
            if !is_controlled_by(existing.as_ref(), &foo) {
                ctx.events
                    .publish(
                        &foo.object_ref(&()),
                        EventType::Warning,
                        reasons::ERR_RESOURCE_EXISTS,
                        actions::RECONCILE,
                        Some(messages::resource_exists(deployment_name)),
                    )
                    .await;
                return Err(Error::resource_exists(deployment_name));
            }

            let current = existing.spec.as_ref().and_then(|s| s.replicas);
            match foo.spec.replicas {
                Some(desired) if Some(desired) != current => {
                    info!(
                        deployment = %deployment_name,
                        current_replicas = ?current,
                        desired_replicas = desired,
                        "updating deployment replicas"
                    );
                    let updated = ctx
                        .deployment_client
                        .update(&new_deployment(&foo)?)
                        .await?;
                    Arc::new(updated)
                }
                _ => existing,
            }
        }
    };

    update_foo_status(&foo, &deployment, ctx).await?;

    ctx.events
        .publish(
            &foo.object_ref(&()),
            EventType::Normal,
            reasons::SYNCED,
            actions::RECONCILE,
            Some(messages::RESOURCE_SYNCED.to_string()),
        )
        .await;
    Ok(())
}

/// Copy the Deployment's available replicas into the Foo status
///
/// Skips the write when the status already holds that value.
async fn update_foo_status(foo: &Foo, deployment: &Deployment, ctx: &Context) -> Result<(), Error> {
    let available_replicas = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    let status = FooStatus { available_replicas };
    if foo.status.as_ref() == Some(&status) {
        debug!(available_replicas, "status already up to date");
        return Ok(());
    }

    // Never modify cached objects; write through a copy
    let mut updated = foo.clone();
    updated.status = Some(status);
    ctx.foo_status.update_status(&updated).await?;
    debug!(available_replicas, "updated Foo status");
    Ok(())
}

/// Build the Deployment a Foo asks for
///
/// The Deployment is owned by the Foo through a controller reference, so
/// changes to it can be traced back and it is garbage collected with the Foo.
pub fn new_deployment(foo: &Foo) -> Result<Deployment, Error> {
    let owner_ref = foo
        .controller_owner_ref(&())
        .ok_or_else(|| Error::invalid_object(format!("Foo {} has no uid", foo.name_any())))?;
    let labels = BTreeMap::from([
        ("app".to_string(), "nginx".to_string()),
        ("controller".to_string(), foo.name_any()),
    ]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(foo.spec.deployment_name.clone()),
            namespace: foo.namespace(),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: foo.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".to_string(),
                        image: Some(DEPLOYMENT_IMAGE.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
