//! Foo Custom Resource Definition
//!
//! A Foo declares a Deployment by name and, optionally, how many replicas it
//! should run. The controller owns the Deployment it creates for a Foo and
//! mirrors the Deployment's available replica count back into the Foo status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Foo
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "samplecontroller.k8s.io",
    version = "v1alpha1",
    kind = "Foo",
    plural = "foos",
    status = "FooStatus",
    namespaced,
    annotation("api-approved.kubernetes.io", "unapproved, experimental-only"),
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FooSpec {
    /// Name of the Deployment this Foo controls, in the Foo's namespace
    #[serde(default)]
    pub deployment_name: String,

    /// Desired replica count. `None` leaves the Deployment's count alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl FooSpec {
    /// Validate the Foo specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.deployment_name.is_empty() {
            return Err(crate::Error::validation("deployment name must not be empty"));
        }
        Ok(())
    }
}

/// Status for a Foo, written only by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FooStatus {
    /// Available replicas last observed on the controlled Deployment
    #[serde(default)]
    pub available_replicas: i32,
}
