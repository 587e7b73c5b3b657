//! Sporos controller implementation
//!
//! This module implements the reconciliation state machine for Sporos
//! resources. Every invocation is one idempotent evaluation of desired vs.
//! observed state: objects are created if absent, readiness is re-derived
//! from live status, and the phase advances exactly once per signal. A
//! "not ready" dependency is not an error — it asks the dispatcher to
//! re-invoke later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::backup::{self, BackupDecision};
use super::health::{HostedControlPlane, KubeHostedControlPlane};
use super::probes::{KubeProbes, Probes};
use crate::assets;
use crate::crd::{ControlplanePhase, EtcdBackup, EtcdCluster, Sporos};
use crate::resources::{self, create_if_absent, CreateOutcome};
use crate::{Error, Result, RECONCILE_PERIOD};

/// How often a `Running` control plane is re-checked for backup scheduling
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

/// Field manager name used for status patches
const FIELD_MANAGER: &str = "sporos-controller";

/// Explicit outcome of one pass through the state machine
///
/// Every exit point of the reconcile algorithm is one of these values (or an
/// error); nothing is communicated through control-flow short-circuiting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Every gate up to the new phase was observed ready
    Advance(ControlplanePhase),
    /// A dependency is not ready yet; re-invoke after the reconcile period
    Wait(String),
    /// Everything this pass is responsible for is in its desired state
    Done,
}

impl Transition {
    fn wait(reason: impl Into<String>) -> Self {
        Self::Wait(reason.into())
    }
}

// =============================================================================
// Injected dependencies
// =============================================================================

/// Status writes against the Sporos resource
///
/// The state machine is the only mutator of status; probes stay read-only.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Persist the externally observed API server IP
    async fn set_api_server_ip(&self, cr: &Sporos, ip: &str) -> Result<()>;

    /// Persist a phase transition
    async fn set_phase(&self, cr: &Sporos, phase: ControlplanePhase) -> Result<()>;
}

/// Idempotent create-or-skip operations for every managed object kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the load-balanced endpoint Service
    async fn create_endpoint(&self, cr: &Sporos) -> Result<CreateOutcome>;

    /// Generate PKI assets (embedding the observed endpoint IP as a SAN) and
    /// persist them as Secrets
    async fn create_secrets(&self, cr: &Sporos, api_server_ip: &str) -> Result<()>;

    /// Create the delegated etcd cluster resource
    async fn create_etcd_cluster(&self, cr: &Sporos) -> Result<CreateOutcome>;

    /// Create the three control plane Deployments
    async fn create_control_plane(&self, cr: &Sporos) -> Result<()>;

    /// Create a fresh timestamped backup request
    async fn create_backup(&self, cr: &Sporos) -> Result<()>;

    /// Delete the current backup request (absent is fine)
    async fn delete_backup(&self, cr: &Sporos) -> Result<()>;
}

// =============================================================================
// Real implementations
// =============================================================================

/// Status writer backed by the real Kubernetes client
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    /// Create a status writer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_status(&self, cr: &Sporos, patch: serde_json::Value) -> Result<()> {
        let namespace = resources::namespace_of(cr)?;
        let api: Api<Sporos> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &cr.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn set_api_server_ip(&self, cr: &Sporos, ip: &str) -> Result<()> {
        self.patch_status(cr, serde_json::json!({"status": {"apiServerIP": ip}}))
            .await
    }

    async fn set_phase(&self, cr: &Sporos, phase: ControlplanePhase) -> Result<()> {
        self.patch_status(cr, serde_json::json!({"status": {"phase": phase}}))
            .await
    }
}

/// Provisioner backed by the real Kubernetes client
pub struct KubeProvisioner {
    client: Client,
}

impl KubeProvisioner {
    /// Create a provisioner using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Provisioner for KubeProvisioner {
    async fn create_endpoint(&self, cr: &Sporos) -> Result<CreateOutcome> {
        let namespace = resources::namespace_of(cr)?;
        let service = resources::endpoint_service(cr)?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let outcome = create_if_absent(&services, &service).await?;
        if outcome == CreateOutcome::Created {
            info!(sporos = %cr.name_any(), "created API server endpoint service");
        }
        Ok(outcome)
    }

    async fn create_secrets(&self, cr: &Sporos, api_server_ip: &str) -> Result<()> {
        let namespace = resources::namespace_of(cr)?;
        let bundle = assets::prepare(cr, api_server_ip)?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        for secret in resources::etcd_secrets(cr, &bundle.etcd)?
            .into_iter()
            .chain(resources::controlplane_secrets(cr, &bundle)?)
        {
            let name = secret.name_any();
            if create_if_absent(&secrets, &secret).await? == CreateOutcome::Created {
                debug!(secret = %name, "created secret");
            }
        }
        Ok(())
    }

    async fn create_etcd_cluster(&self, cr: &Sporos) -> Result<CreateOutcome> {
        let namespace = resources::namespace_of(cr)?;
        let etcd = resources::etcd_cluster(cr)?;
        let clusters: Api<EtcdCluster> = Api::namespaced(self.client.clone(), &namespace);
        let outcome = create_if_absent(&clusters, &etcd).await?;
        if outcome == CreateOutcome::Created {
            info!(sporos = %cr.name_any(), "created etcd cluster request");
        }
        Ok(outcome)
    }

    async fn create_control_plane(&self, cr: &Sporos) -> Result<()> {
        let namespace = resources::namespace_of(cr)?;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        for deployment in resources::control_plane_deployments(cr)? {
            let name = deployment.name_any();
            if create_if_absent(&deployments, &deployment).await? == CreateOutcome::Created {
                info!(deployment = %name, "created control plane deployment");
            }
        }
        Ok(())
    }

    async fn create_backup(&self, cr: &Sporos) -> Result<()> {
        let namespace = resources::namespace_of(cr)?;
        let backup = resources::etcd_backup(cr, Utc::now().timestamp())?;
        let backups: Api<EtcdBackup> = Api::namespaced(self.client.clone(), &namespace);
        if create_if_absent(&backups, &backup).await? == CreateOutcome::Created {
            info!(sporos = %cr.name_any(), "created etcd backup request");
        }
        Ok(())
    }

    async fn delete_backup(&self, cr: &Sporos) -> Result<()> {
        let namespace = resources::namespace_of(cr)?;
        let backups: Api<EtcdBackup> = Api::namespaced(self.client.clone(), &namespace);
        match backups
            .delete(
                &resources::etcd_name(&cr.name_any()),
                &DeleteParams::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared controller context holding the injected dependencies
pub struct Context {
    status: Arc<dyn StatusWriter>,
    provisioner: Arc<dyn Provisioner>,
    probes: Arc<dyn Probes>,
    hosted: Arc<dyn HostedControlPlane>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    ///
    /// This is a convenience method equivalent to `Context::builder(client).build()`.
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom mock implementations
    ///
    /// This method is primarily for unit tests where a real Kubernetes
    /// client is not available. For production code, use [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(
        status: Arc<dyn StatusWriter>,
        provisioner: Arc<dyn Provisioner>,
        probes: Arc<dyn Probes>,
        hosted: Arc<dyn HostedControlPlane>,
    ) -> Self {
        Self {
            status,
            provisioner,
            probes,
            hosted,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    status: Option<Arc<dyn StatusWriter>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    probes: Option<Arc<dyn Probes>>,
    hosted: Option<Arc<dyn HostedControlPlane>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            status: None,
            provisioner: None,
            probes: None,
            hosted: None,
        }
    }

    /// Override the status writer (primarily for testing)
    pub fn status_writer(mut self, status: Arc<dyn StatusWriter>) -> Self {
        self.status = Some(status);
        self
    }

    /// Override the provisioner (primarily for testing)
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Override the readiness probes (primarily for testing)
    pub fn probes(mut self, probes: Arc<dyn Probes>) -> Self {
        self.probes = Some(probes);
        self
    }

    /// Override the hosted control plane access (primarily for testing)
    pub fn hosted_control_plane(mut self, hosted: Arc<dyn HostedControlPlane>) -> Self {
        self.hosted = Some(hosted);
        self
    }

    /// Build the Context, filling unset dependencies with the real
    /// client-backed implementations
    pub fn build(self) -> Context {
        Context {
            status: self
                .status
                .unwrap_or_else(|| Arc::new(KubeStatusWriter::new(self.client.clone()))),
            provisioner: self
                .provisioner
                .unwrap_or_else(|| Arc::new(KubeProvisioner::new(self.client.clone()))),
            probes: self
                .probes
                .unwrap_or_else(|| Arc::new(KubeProbes::new(self.client.clone()))),
            hosted: self
                .hosted
                .unwrap_or_else(|| Arc::new(KubeHostedControlPlane::new(self.client.clone()))),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Sporos resource
///
/// Single entry point invoked on every watch event and periodic resync. Maps
/// the explicit [`Transition`] of this pass onto a requeue [`Action`].
#[instrument(skip(cr, ctx), fields(sporos = %cr.name_any()))]
pub async fn reconcile(cr: Arc<Sporos>, ctx: Arc<Context>) -> Result<Action> {
    info!("reconciling control plane");

    cr.spec.validate()?;

    match step(&cr, &ctx).await? {
        Transition::Advance(phase) => {
            info!(?phase, "phase advanced");
            Ok(Action::requeue(RECONCILE_PERIOD))
        }
        Transition::Wait(reason) => {
            debug!(%reason, "waiting on dependency");
            Ok(Action::requeue(RECONCILE_PERIOD))
        }
        Transition::Done => Ok(Action::requeue(MAINTENANCE_PERIOD)),
    }
}

/// One full pass: run the bootstrap stage while `Initial`, then backup
/// maintenance
///
/// The phase write happens here, and only here, so the transition function
/// below stays free of status side effects.
pub async fn step(cr: &Sporos, ctx: &Context) -> Result<Transition> {
    if cr.current_phase() == ControlplanePhase::Initial {
        match bootstrap_step(cr, ctx).await? {
            Transition::Advance(phase) => {
                ctx.status.set_phase(cr, phase).await?;
                info!(sporos = %cr.name_any(), "control plane is ready");
            }
            wait => return Ok(wait),
        }
    }
    backup_step(cr, ctx).await
}

/// The bootstrap stage of the state machine
///
/// Fixed step order: the endpoint must exist and have an address before
/// assets can embed it as a certificate SAN; etcd must be healthy before the
/// control plane pods start (they connect at process start); all three pods
/// must be ready before CSR bootstrap, since approval RBAC is meaningless
/// without a reachable API server. Returns `Advance(Running)` only once every
/// gate has been observed ready in a single pass.
pub async fn bootstrap_step(cr: &Sporos, ctx: &Context) -> Result<Transition> {
    if cr.api_server_ip().is_none() {
        ctx.provisioner.create_endpoint(cr).await?;

        let Some(ip) = ctx.probes.endpoint_ip(cr).await? else {
            return Ok(Transition::wait("endpoint address not assigned"));
        };
        ctx.status.set_api_server_ip(cr, &ip).await?;
        info!(sporos = %cr.name_any(), ip = %ip, "API server endpoint ready");

        ctx.provisioner.create_secrets(cr, &ip).await?;
    }

    ctx.provisioner.create_etcd_cluster(cr).await?;
    if !ctx.probes.etcd_ready(cr).await? {
        return Ok(Transition::wait("etcd cluster not ready"));
    }

    ctx.provisioner.create_control_plane(cr).await?;
    let pending = ctx.probes.pending_deployments(cr).await?;
    if !pending.is_empty() {
        return Ok(Transition::wait(format!(
            "waiting for deployments: {}",
            pending.join(", ")
        )));
    }

    ctx.hosted.await_ready(cr).await?;
    ctx.hosted.install_bootstrap_rbac(cr).await?;

    Ok(Transition::Advance(ControlplanePhase::Running))
}

/// The maintenance stage: time-gated, idempotent backup scheduling
async fn backup_step(cr: &Sporos, ctx: &Context) -> Result<Transition> {
    let state = ctx.probes.backup(cr).await?;
    match backup::decision(state.as_ref(), Utc::now()) {
        BackupDecision::NotDue => {
            if state.map(|s| s.succeeded).unwrap_or(false) {
                Ok(Transition::Done)
            } else {
                Ok(Transition::wait("etcd backup in progress"))
            }
        }
        BackupDecision::Rotate => {
            ctx.provisioner.delete_backup(cr).await?;
            ctx.provisioner.create_backup(cr).await?;
            Ok(Transition::wait("etcd backup requested"))
        }
        BackupDecision::Create => {
            ctx.provisioner.create_backup(cr).await?;
            Ok(Transition::wait("etcd backup requested"))
        }
    }
}

/// Error policy for the controller
///
/// Every failure becomes a delayed requeue; the controller never gives up on
/// a resource, because the design assumes retry can eventually succeed once
/// the environment is fixed.
pub fn error_policy(cr: Arc<Sporos>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        sporos = %cr.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
