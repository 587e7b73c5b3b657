//! Access to the control plane being bootstrapped
//!
//! Once the three Deployments report ready, the reconciler still has to wait
//! for the new API server to actually serve requests before CSR bootstrap
//! RBAC means anything. This is the single place the reconciler polls in a
//! bounded loop instead of returning control; exceeding the bound fails the
//! whole attempt.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::Sporos;
use crate::resources::{self, create_if_absent};
use crate::{Error, Result, API_HEALTH_POLL_INTERVAL, API_HEALTH_TIMEOUT};

/// Operations against the control plane this operator is bootstrapping, as
/// opposed to the cluster it runs in
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostedControlPlane: Send + Sync {
    /// Poll the new API server's health endpoint and system namespace until
    /// reachable, bounded by [`API_HEALTH_TIMEOUT`]; `Error::Timeout` after
    /// the bound
    async fn await_ready(&self, cr: &Sporos) -> Result<()>;

    /// Create the CSR bootstrap-approval ClusterRoleBindings inside the new
    /// control plane (idempotent)
    async fn install_bootstrap_rbac(&self, cr: &Sporos) -> Result<()>;
}

/// Implementation that builds a cluster-admin client from the generated
/// kubeconfig Secret
pub struct KubeHostedControlPlane {
    client: Client,
}

impl KubeHostedControlPlane {
    /// Create hosted-control-plane access reading the kubeconfig Secret
    /// through the given (host cluster) client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client for the hosted control plane from the admin kubeconfig
    /// Secret the provisioner created
    async fn admin_client(&self, cr: &Sporos) -> Result<Client> {
        let namespace = resources::namespace_of(cr)?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets
            .get(&resources::kubeconfig_secret_name(&cr.name_any()))
            .await?;

        let data = secret
            .data
            .and_then(|mut d| d.remove("kubeconfig"))
            .ok_or_else(|| Error::missing_asset("kubeconfig"))?;
        let yaml = String::from_utf8(data.0)
            .map_err(|e| Error::kubeconfig(format!("kubeconfig secret is not UTF-8: {e}")))?;

        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| Error::kubeconfig(format!("failed to parse kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::kubeconfig(format!("failed to load kubeconfig: {e}")))?;
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl HostedControlPlane for KubeHostedControlPlane {
    async fn await_ready(&self, cr: &Sporos) -> Result<()> {
        let client = self.admin_client(cr).await?;

        tokio::time::timeout(API_HEALTH_TIMEOUT, async {
            loop {
                if api_ready(&client).await {
                    return;
                }
                tokio::time::sleep(API_HEALTH_POLL_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| Error::timeout("hosted API server health"))?;

        info!(sporos = %cr.name_any(), "hosted API server is serving");
        Ok(())
    }

    async fn install_bootstrap_rbac(&self, cr: &Sporos) -> Result<()> {
        let client = self.admin_client(cr).await?;
        let bindings: Api<ClusterRoleBinding> = Api::all(client);
        for binding in resources::bootstrap_role_bindings() {
            create_if_absent(&bindings, &binding).await?;
        }
        Ok(())
    }
}

/// One health sample: the API server answers /healthz and has created the
/// system namespace
async fn api_ready(client: &Client) -> bool {
    let request = match http::Request::get("/healthz").body(Vec::new()) {
        Ok(request) => request,
        Err(_) => return false,
    };
    if let Err(e) = client.request_text(request).await {
        debug!(error = %e, "API server health endpoint not reachable yet");
        return false;
    }

    let namespaces: Api<Namespace> = Api::all(client.clone());
    match namespaces.get("kube-system").await {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "system namespace not visible yet");
            false
        }
    }
}
