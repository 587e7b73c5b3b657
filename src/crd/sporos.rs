//! Sporos Custom Resource Definition
//!
//! The Sporos CRD declares a desired self-hosted control plane. The user
//! creates it, the controller owns its status, and deleting it cascades
//! through owner references to everything the controller created for it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Specification for a Sporos control plane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sporos.dev",
    version = "v1alpha1",
    kind = "Sporos",
    plural = "sporoses",
    shortname = "sp",
    status = "SporosStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.apiServerIP"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SporosSpec {
    /// Pod network CIDR handed to the controller-manager for node CIDR allocation
    #[serde(rename = "podCIDR")]
    pub pod_cidr: String,

    /// Service network CIDR; its first usable address becomes the in-cluster
    /// API server service IP and a certificate SAN
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: String,

    /// Base image for the control plane containers
    pub base_image: String,

    /// Kubernetes version, appended to the base image as the tag
    pub version: String,

    /// Policy for pods owned by the operator.
    /// This field cannot be updated once the CR is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodPolicy>,
}

impl SporosSpec {
    /// Validate the control plane specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.pod_cidr.is_empty() {
            return Err(crate::Error::validation("podCIDR must be set"));
        }
        if self.service_cidr.is_empty() {
            return Err(crate::Error::validation("serviceCIDR must be set"));
        }
        if self.base_image.is_empty() || self.version.is_empty() {
            return Err(crate::Error::validation(
                "baseImage and version must both be set",
            ));
        }
        Ok(())
    }

    /// The container image for the control plane components
    pub fn image(&self) -> String {
        format!("{}:{}", self.base_image, self.version)
    }
}

/// Policy applied to the pods the operator creates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PodPolicy {
    /// Compute resources for every control plane container
    #[serde(default)]
    pub resources: ComputeResources,
}

/// Requests and limits expressed as Kubernetes quantity strings
///
/// Kept as plain strings in the CRD schema and converted to typed quantities
/// when the deployments are built.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ComputeResources {
    /// Minimum resources per container (e.g. `cpu: 100m`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Maximum resources per container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Control plane lifecycle phase
///
/// The phase only ever moves forward: `Initial` until every bootstrap step
/// has been observed ready, `Running` from then on.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[non_exhaustive]
pub enum ControlplanePhase {
    /// Bootstrap has not completed yet
    #[default]
    Initial,
    /// Every bootstrap step is ready; only maintenance (backups) remains
    Running,
}

/// Status for a Sporos control plane, mutated exclusively by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SporosStatus {
    /// Current phase of the bootstrap lifecycle
    #[serde(default)]
    pub phase: ControlplanePhase,

    /// External IP assigned to the API server endpoint Service.
    /// Written as soon as the load balancer reports an ingress address,
    /// because certificate issuance needs it as a SAN.
    #[serde(
        default,
        rename = "apiServerIP",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_server_ip: Option<String>,

    /// Names of nodes that joined the control plane (informational)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

impl SporosStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ControlplanePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the API server IP and return self for chaining
    pub fn api_server_ip(mut self, ip: impl Into<String>) -> Self {
        self.api_server_ip = Some(ip.into());
        self
    }
}

impl Sporos {
    /// The persisted phase, defaulting to `Initial` when status is unset
    pub fn current_phase(&self) -> ControlplanePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// The externally observed API server IP, if the endpoint has one yet
    pub fn api_server_ip(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.api_server_ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }
}
