//! Controller implementation for the Sporos CRD
//!
//! This module contains the reconciliation state machine plus the pieces it
//! orchestrates: readiness probes, the backup scheduler, and access to the
//! control plane being bootstrapped. The reconciler follows the Kubernetes
//! controller pattern with observe-diff-act loops.

mod backup;
mod health;
mod probes;
mod sporos;

pub use backup::BackupDecision;
pub use health::{HostedControlPlane, KubeHostedControlPlane};
pub use probes::{BackupState, KubeProbes, Probes};
pub use sporos::{
    error_policy, reconcile, Context, ContextBuilder, KubeProvisioner, KubeStatusWriter,
    Provisioner, StatusWriter, Transition,
};
