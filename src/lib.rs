//! Sporos - Kubernetes operator that bootstraps self-hosted control planes
//!
//! Sporos watches a single custom resource describing a desired control plane
//! (etcd, kube-apiserver, kube-controller-manager, kube-scheduler) and drives
//! it through an idempotent bootstrap state machine until it is `Running`,
//! then keeps it maintained with periodic etcd backups.
//!
//! # Architecture
//!
//! Everything the operator creates hangs off the `Sporos` custom resource via
//! owner references, so deleting the resource garbage-collects the whole
//! control plane. The reconciler holds no state of its own: every invocation
//! re-derives where it left off from the persisted status and the live state
//! of already-created objects, which makes it safe to re-run on every watch
//! event, resync, or restart.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Sporos, plus the external etcd-operator types)
//! - [`pki`] - Certificate authority and leaf certificate issuance
//! - [`assets`] - Named bundles of generated keys, certificates, and kubeconfigs
//! - [`resources`] - Construction and idempotent creation of managed objects
//! - [`controller`] - Reconciliation state machine, readiness probes, backup scheduling
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

use std::time::Duration;

pub mod assets;
pub mod controller;
pub mod crd;
pub mod error;
pub mod pki;
pub mod resources;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these here keeps the reconciler, the object builders, and the
// test fixtures agreeing on the same values.

/// Number of etcd members the delegated etcd cluster runs with
pub const ETCD_CLUSTER_SIZE: usize = 1;

/// How long the controller waits before re-checking a not-yet-ready dependency
pub const RECONCILE_PERIOD: Duration = Duration::from_secs(10);

/// Minimum interval between two etcd backup requests
pub const BACKUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Hard cap on the post-bootstrap API server health poll
///
/// This is the single place the reconciler waits in a loop instead of
/// returning control; exceeding it fails the whole reconcile attempt.
pub const API_HEALTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval between individual probes inside the bounded health poll
pub const API_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
