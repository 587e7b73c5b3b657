//! Readiness probes for the objects a bootstrap depends on
//!
//! Each probe re-fetches the live object by name and derives readiness from
//! its status fields; stale cached copies are never trusted. A failed get
//! surfaces as an error rather than "not ready" — an object that vanished out
//! from under the probe is an anomaly the caller must decide how to handle.
//! The one exception is the backup probe, where "no request exists" is a
//! legal state the scheduler acts on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::{EtcdBackup, EtcdCluster, Sporos};
use crate::resources;
use crate::{Result, ETCD_CLUSTER_SIZE};

/// Observed state of the current backup request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupState {
    /// When the request object was created, if the API server stamped it
    pub created_at: Option<DateTime<Utc>>,
    /// True once the snapshot reached storage
    pub succeeded: bool,
}

/// Readiness reads against live cluster state
///
/// Probes never mutate anything; the state machine owns every status write.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Probes: Send + Sync {
    /// IP the load balancer assigned to the endpoint Service, if any yet
    async fn endpoint_ip(&self, cr: &Sporos) -> Result<Option<String>>;

    /// True when the etcd operator reports the full member count ready
    async fn etcd_ready(&self, cr: &Sporos) -> Result<bool>;

    /// Names of control plane Deployments that are not yet progressing;
    /// empty means all three are ready
    async fn pending_deployments(&self, cr: &Sporos) -> Result<Vec<String>>;

    /// State of the current backup request, or `None` if none exists
    async fn backup(&self, cr: &Sporos) -> Result<Option<BackupState>>;
}

/// Probe implementation backed by the real Kubernetes client
pub struct KubeProbes {
    client: Client,
}

impl KubeProbes {
    /// Create probes reading through the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Probes for KubeProbes {
    async fn endpoint_ip(&self, cr: &Sporos) -> Result<Option<String>> {
        let namespace = resources::namespace_of(cr)?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let service = services
            .get(&resources::apiserver_name(&cr.name_any()))
            .await?;
        Ok(ingress_ip(&service))
    }

    async fn etcd_ready(&self, cr: &Sporos) -> Result<bool> {
        let namespace = resources::namespace_of(cr)?;
        let clusters: Api<EtcdCluster> = Api::namespaced(self.client.clone(), &namespace);
        let etcd = clusters.get(&resources::etcd_name(&cr.name_any())).await?;
        Ok(etcd
            .status
            .map(|status| status.ready_members())
            .unwrap_or(0)
            == ETCD_CLUSTER_SIZE)
    }

    async fn pending_deployments(&self, cr: &Sporos) -> Result<Vec<String>> {
        let name = cr.name_any();
        let namespace = resources::namespace_of(cr)?;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);

        let mut pending = Vec::new();
        for deploy_name in [
            resources::apiserver_name(&name),
            resources::controller_manager_name(&name),
            resources::scheduler_name(&name),
        ] {
            let deployment = deployments.get(&deploy_name).await?;
            if !deployment_progressing(&deployment) {
                pending.push(deploy_name);
            }
        }
        Ok(pending)
    }

    async fn backup(&self, cr: &Sporos) -> Result<Option<BackupState>> {
        let namespace = resources::namespace_of(cr)?;
        let backups: Api<EtcdBackup> = Api::namespaced(self.client.clone(), &namespace);
        match backups.get(&resources::etcd_name(&cr.name_any())).await {
            Ok(backup) => Ok(Some(BackupState {
                created_at: backup.metadata.creation_timestamp.map(|t| t.0),
                succeeded: backup.status.map(|s| s.succeeded).unwrap_or(false),
            })),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// First load-balancer ingress IP of a Service, if one was assigned
fn ingress_ip(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|entry| entry.ip.clone())
}

/// A Deployment is considered ready once its `Progressing` condition is True
fn deployment_progressing(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Progressing" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn service_with_ingress(ip: Option<&str>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: ip.map(|ip| {
                        vec![LoadBalancerIngress {
                            ip: Some(ip.to_string()),
                            ..Default::default()
                        }]
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment_with_condition(type_: &str, status: &str) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The endpoint is ready exactly when the load balancer has handed out
    /// an ingress IP.
    #[test]
    fn ingress_ip_requires_assigned_address() {
        assert_eq!(
            ingress_ip(&service_with_ingress(Some("1.2.3.4"))),
            Some("1.2.3.4".to_string())
        );
        assert_eq!(ingress_ip(&service_with_ingress(None)), None);
        assert_eq!(ingress_ip(&Service::default()), None);
    }

    /// Readiness keys off the Progressing condition being True; any other
    /// condition or value is not ready.
    #[test]
    fn deployment_ready_only_when_progressing_true() {
        assert!(deployment_progressing(&deployment_with_condition(
            "Progressing",
            "True"
        )));
        assert!(!deployment_progressing(&deployment_with_condition(
            "Progressing",
            "False"
        )));
        assert!(!deployment_progressing(&deployment_with_condition(
            "Available",
            "True"
        )));
        assert!(!deployment_progressing(&Deployment::default()));
    }
}
