//! Typed access to the external etcd-operator API
//!
//! The etcd sub-cluster and its backups are delegated to an etcd operator
//! running in the same cluster. Sporos only creates these resources and polls
//! their status; the CRDs themselves are installed and reconciled by the etcd
//! operator. The type definitions here cover exactly the fields this
//! controller reads and writes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::sporos::ComputeResources;

/// Specification of a delegated etcd cluster (`etcd.database.coreos.com/v1beta2`)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "etcd.database.coreos.com",
    version = "v1beta2",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    namespaced,
    status = "EtcdClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Desired member count
    pub size: usize,

    /// Static TLS wiring for members and the operator-side client
    #[serde(default, rename = "TLS", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsPolicy>,

    /// Policy applied to the etcd member pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<EtcdPodPolicy>,
}

/// TLS policy for the etcd cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TlsPolicy {
    /// Statically provisioned secrets (as opposed to operator-generated TLS)
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_: Option<StaticTls>,
}

/// Pre-provisioned TLS secret references
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticTls {
    /// Secrets mounted into every member pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<MemberSecret>,

    /// Secret holding the client credentials the etcd operator itself uses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_secret: Option<String>,
}

/// TLS secrets for etcd member pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberSecret {
    /// Secret with the peer certificate bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_secret: Option<String>,

    /// Secret with the serving certificate bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_secret: Option<String>,
}

/// Pod-level policy for etcd members
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdPodPolicy {
    /// Extra environment variables for the etcd container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_env: Vec<EtcdEnvVar>,

    /// Compute resources for the etcd container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComputeResources>,
}

/// A single environment variable entry for the etcd container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EtcdEnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

/// Status reported by the etcd operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Per-member readiness as reported by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<MembersStatus>,

    /// Operator-reported phase string (unused by this controller)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl EtcdClusterStatus {
    /// Number of members the etcd operator reports as ready
    pub fn ready_members(&self) -> usize {
        self.members
            .as_ref()
            .and_then(|m| m.ready.as_ref())
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

/// Ready/unready member name lists
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MembersStatus {
    /// Members currently serving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Vec<String>>,

    /// Members that exist but are not serving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unready: Option<Vec<String>>,
}

/// Specification of a point-in-time etcd backup request
///
/// One request object represents one completed or in-flight attempt, not a
/// queue; re-issuing a backup means deleting the old request and creating a
/// fresh one.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "etcd.database.coreos.com",
    version = "v1beta2",
    kind = "EtcdBackup",
    plural = "etcdbackups",
    namespaced,
    status = "EtcdBackupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdBackupSpec {
    /// Client endpoints of the etcd cluster to snapshot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_endpoints: Vec<String>,

    /// Secret with the client TLS credentials used to reach etcd
    #[serde(
        default,
        rename = "clientTLSSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_tls_secret: Option<String>,

    /// Storage backend; this controller always requests S3-compatible storage
    pub storage_type: String,

    /// S3 storage parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3BackupSource>,
}

/// S3-compatible storage location for a backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3BackupSource {
    /// Object path, including the timestamped leaf segment
    pub path: String,

    /// Secret with AWS-style credentials
    #[serde(rename = "awsSecret")]
    pub aws_secret: String,

    /// S3-compatible endpoint URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

/// Status reported by the etcd operator for a backup request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdBackupStatus {
    /// True once the snapshot was written to storage
    #[serde(default)]
    pub succeeded: bool,

    /// Failure reason, if the attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: The etcd cluster spec serializes with the operator's exact
    /// field casing, notably the all-caps `TLS` key
    #[test]
    fn story_etcd_cluster_matches_operator_wire_format() {
        let spec = EtcdClusterSpec {
            size: 1,
            tls: Some(TlsPolicy {
                static_: Some(StaticTls {
                    member: Some(MemberSecret {
                        peer_secret: Some("demo-etcd-peer-tls".into()),
                        server_secret: Some("demo-etcd-server-tls".into()),
                    }),
                    operator_secret: Some("demo-etcd-client-tls".into()),
                }),
            }),
            pod: None,
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["size"], 1);
        assert_eq!(
            json["TLS"]["static"]["member"]["peerSecret"],
            "demo-etcd-peer-tls"
        );
        assert_eq!(
            json["TLS"]["static"]["operatorSecret"],
            "demo-etcd-client-tls"
        );
    }

    /// Story: Readiness counts only members the operator reports as ready
    #[test]
    fn story_ready_member_count_ignores_unready() {
        let status = EtcdClusterStatus {
            members: Some(MembersStatus {
                ready: Some(vec!["demo-etcd-0000".into()]),
                unready: Some(vec!["demo-etcd-0001".into()]),
            }),
            phase: None,
        };
        assert_eq!(status.ready_members(), 1);

        assert_eq!(EtcdClusterStatus::default().ready_members(), 0);
    }

    /// Story: A backup request targets S3 with the operator's field names
    #[test]
    fn story_backup_request_wire_format() {
        let spec = EtcdBackupSpec {
            etcd_endpoints: vec!["https://demo-etcd-client:2379".into()],
            client_tls_secret: Some("demo-etcd-client-tls".into()),
            storage_type: "S3".into(),
            s3: Some(S3BackupSource {
                path: "etcd-backups/demo/1700000000".into(),
                aws_secret: "sporos-aws".into(),
                endpoint: "http://sporos-minio:9000".into(),
            }),
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["storageType"], "S3");
        assert_eq!(json["clientTLSSecret"], "demo-etcd-client-tls");
        assert_eq!(json["s3"]["awsSecret"], "sporos-aws");
        assert_eq!(json["etcdEndpoints"][0], "https://demo-etcd-client:2379");
    }

    /// Story: Backup status parses from the operator's reported document
    #[test]
    fn story_backup_status_parses_succeeded_flag() {
        let status: EtcdBackupStatus =
            serde_json::from_value(serde_json::json!({"succeeded": true})).unwrap();
        assert!(status.succeeded);

        let status: EtcdBackupStatus =
            serde_json::from_value(serde_json::json!({"succeeded": false, "reason": "etcd unreachable"}))
                .unwrap();
        assert!(!status.succeeded);
        assert_eq!(status.reason.as_deref(), Some("etcd unreachable"));
    }
}
