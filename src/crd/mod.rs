//! Custom Resource Definitions for Sporos
//!
//! This module contains the Sporos CRD itself plus typed definitions for the
//! external etcd-operator resources the controller creates and polls.

mod etcd;
mod sporos;

pub use etcd::{
    EtcdBackup, EtcdBackupSpec, EtcdBackupStatus, EtcdCluster, EtcdClusterSpec, EtcdClusterStatus,
    EtcdEnvVar, EtcdPodPolicy, MemberSecret, MembersStatus, S3BackupSource, StaticTls, TlsPolicy,
};
pub use sporos::{ComputeResources, ControlplanePhase, PodPolicy, Sporos, SporosSpec, SporosStatus};
