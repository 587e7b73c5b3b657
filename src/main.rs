//! Sporos Operator - self-hosted Kubernetes control plane bootstrapping

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sporos::controller::{error_policy, reconcile, Context};
use sporos::crd::Sporos;

/// Sporos - operator that bootstraps self-hosted Kubernetes control planes
#[derive(Parser, Debug)]
#[command(name = "sporos", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace to watch; watches all namespaces when unset
    #[arg(long, env = "SPOROS_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the aws-lc-rs crypto provider before any TLS happens.
    // Failure here indicates a serious system configuration issue.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: failed to install crypto provider: {:?}. \
             The operator cannot talk TLS to any API server without one.",
            e
        );
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Sporos::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli.namespace).await
}

/// Ensure the Sporos CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply, so
/// the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("sporos-controller").force();

    tracing::info!("Installing Sporos CRD...");
    crds.patch("sporoses.sporos.dev", &params, &Patch::Apply(&Sporos::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Sporos CRD: {}", e))?;

    Ok(())
}

/// Run the controller: watch Sporos resources and reconcile each one
async fn run_controller(namespace: Option<String>) -> anyhow::Result<()> {
    tracing::info!("Sporos controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let clusters: Api<Sporos> = match namespace {
        Some(ref ns) => {
            tracing::info!(namespace = %ns, "watching single namespace");
            Api::namespaced(client.clone(), ns)
        }
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(Context::new(client));

    tracing::info!("Starting Sporos controller...");
    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Sporos controller shutting down");
    Ok(())
}
