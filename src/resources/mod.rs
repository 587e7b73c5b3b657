//! Construction and idempotent creation of the objects owned by a Sporos
//! control plane
//!
//! Every managed object gets a deterministic name derived from the Sporos
//! resource name, the shared label set, and a controller owner reference so
//! the platform garbage-collects it when the Sporos resource is deleted.
//! Creation is always create-or-skip: observing `AlreadyExists` is success,
//! which is what makes the whole reconcile loop safe to re-run.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, ProjectedVolumeSource, ResourceRequirements,
    Secret, SecretProjection, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeProjection,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::assets::{Assets, BootstrapAssets};
use crate::crd::{
    ComputeResources, EtcdBackup, EtcdBackupSpec, EtcdCluster, EtcdClusterSpec, EtcdEnvVar,
    EtcdPodPolicy, MemberSecret, S3BackupSource, Sporos, StaticTls, TlsPolicy,
};
use crate::{Error, Result, ETCD_CLUSTER_SIZE};

/// Where the projected Secret volume is mounted inside every control plane
/// container
const SECRETS_MOUNT_PATH: &str = "/etc/kubernetes/secrets";

/// Credentials secret the backup requests reference for S3 access
const BACKUP_AWS_SECRET: &str = "sporos-aws";

/// S3-compatible endpoint the backup requests target
const BACKUP_S3_ENDPOINT: &str = "http://sporos-minio:9000";

// =============================================================================
// Naming and metadata
// =============================================================================

/// Labels for selecting the resources belonging to the given control plane
/// (or one of its components)
pub fn labels_for(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "sporos".to_string()),
        ("controlplane".to_string(), name.to_string()),
    ])
}

/// Namespace of the Sporos resource
pub fn namespace_of(cr: &Sporos) -> Result<String> {
    cr.namespace()
        .ok_or_else(|| Error::validation("Sporos resource has no namespace"))
}

/// Controller owner reference pointing back at the Sporos resource
pub fn owner_reference(cr: &Sporos) -> Result<OwnerReference> {
    cr.controller_owner_ref(&())
        .ok_or_else(|| Error::validation("Sporos resource has no name or uid yet"))
}

/// Name of the API server Service, Deployment, and Secret
pub fn apiserver_name(name: &str) -> String {
    format!("{name}-kube-apiserver")
}

/// In-cluster DNS name of the API server Service
pub fn apiserver_service_host(name: &str, namespace: &str) -> String {
    format!("{}.{}.svc", apiserver_name(name), namespace)
}

/// Name of the controller-manager Deployment and Secret
pub fn controller_manager_name(name: &str) -> String {
    format!("{name}-kube-controller-manager")
}

/// Name of the scheduler Deployment
pub fn scheduler_name(name: &str) -> String {
    format!("{name}-kube-scheduler")
}

/// Name of the admin kubeconfig Secret
pub fn kubeconfig_secret_name(name: &str) -> String {
    format!("{name}-kubeconfig")
}

/// Name of the delegated etcd cluster (and of its backup request)
pub fn etcd_name(name: &str) -> String {
    format!("{name}-etcd")
}

/// Hostname of the client service the etcd operator exposes
pub fn etcd_client_host(name: &str) -> String {
    format!("{}-client", etcd_name(name))
}

/// Client URL of the delegated etcd cluster
pub fn etcd_client_url(name: &str) -> String {
    format!("https://{}:2379", etcd_client_host(name))
}

/// Name of the etcd server TLS secret
pub fn etcd_server_tls_secret_name(name: &str) -> String {
    format!("{}-server-tls", etcd_name(name))
}

/// Name of the etcd client TLS secret
pub fn etcd_client_tls_secret_name(name: &str) -> String {
    format!("{}-client-tls", etcd_name(name))
}

/// Name of the etcd peer TLS secret
pub fn etcd_peer_tls_secret_name(name: &str) -> String {
    format!("{}-peer-tls", etcd_name(name))
}

// =============================================================================
// Idempotent creation
// =============================================================================

/// Result of an idempotent create
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object did not exist and was created by this call
    Created,
    /// The object already existed; treated as success
    AlreadyExists,
}

/// Create an object, treating `AlreadyExists` as success
///
/// Concurrent creators are resolved by the API server: first writer wins,
/// everyone else observes the conflict and skips.
pub async fn create_if_absent<K>(api: &Api<K>, obj: &K) -> Result<CreateOutcome>
where
    K: Resource + Clone + Debug + DeserializeOwned + Serialize,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Object builders
// =============================================================================

fn object_meta(cr: &Sporos, name: String, labels: BTreeMap<String, String>) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(namespace_of(cr)?),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(cr)?]),
        ..Default::default()
    })
}

/// The load-balanced Service exposing the API server externally
///
/// Its labels double as the selector so it matches the API server pods.
pub fn endpoint_service(cr: &Sporos) -> Result<Service> {
    let name = apiserver_name(&cr.name_any());
    let selector = labels_for(&name);

    Ok(Service {
        metadata: object_meta(cr, name, selector.clone())?,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                protocol: Some("TCP".to_string()),
                port: 443,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

fn secret_from_assets(
    cr: &Sporos,
    secret_name: String,
    assets: &Assets,
    keys: &[&str],
) -> Result<Secret> {
    let mut data = BTreeMap::new();
    for key in keys {
        data.insert(
            (*key).to_string(),
            ByteString(assets.get(key)?.data.clone()),
        );
    }
    Ok(Secret {
        metadata: object_meta(cr, secret_name, labels_for(&cr.name_any()))?,
        data: Some(data),
        ..Default::default()
    })
}

/// The three etcd TLS Secrets (server, client, peer), each holding exactly
/// the key names its consumer mounts
pub fn etcd_secrets(cr: &Sporos, assets: &Assets) -> Result<Vec<Secret>> {
    let name = cr.name_any();
    Ok(vec![
        secret_from_assets(
            cr,
            etcd_server_tls_secret_name(&name),
            assets,
            &["server.key", "server.crt", "server-ca.crt"],
        )?,
        secret_from_assets(
            cr,
            etcd_client_tls_secret_name(&name),
            assets,
            &["etcd-client.key", "etcd-client.crt", "etcd-client-ca.crt"],
        )?,
        secret_from_assets(
            cr,
            etcd_peer_tls_secret_name(&name),
            assets,
            &["peer.key", "peer.crt", "peer-ca.crt"],
        )?,
    ])
}

/// The control-plane Secrets: API server bundle, admin kubeconfig, and
/// controller-manager bundle
///
/// Each component receives only the material it needs; the etcd client
/// credentials appear in the API server bundle because the API server is the
/// only component that talks to etcd.
pub fn controlplane_secrets(cr: &Sporos, bundle: &BootstrapAssets) -> Result<Vec<Secret>> {
    let name = cr.name_any();

    let mut apiserver = secret_from_assets(
        cr,
        apiserver_name(&name),
        &bundle.controlplane,
        &["apiserver.key", "apiserver.crt", "ca.crt", "service-account.pub"],
    )?;
    // etcd client credentials come from the etcd bundle
    if let Some(data) = apiserver.data.as_mut() {
        for key in ["etcd-client.key", "etcd-client.crt", "etcd-client-ca.crt"] {
            data.insert(key.to_string(), ByteString(bundle.etcd.get(key)?.data.clone()));
        }
    }

    let kubeconfig = secret_from_assets(
        cr,
        kubeconfig_secret_name(&name),
        &bundle.controlplane,
        &["kubeconfig"],
    )?;

    let controller_manager = secret_from_assets(
        cr,
        controller_manager_name(&name),
        &bundle.controlplane,
        &["ca.crt", "ca.key", "service-account.key", "kubeconfig"],
    )?;

    Ok(vec![apiserver, kubeconfig, controller_manager])
}

fn to_resource_requirements(resources: &ComputeResources) -> ResourceRequirements {
    let quantities = |map: &BTreeMap<String, String>| {
        (!map.is_empty()).then(|| {
            map.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    }
}

/// The delegated etcd cluster resource, wired to the statically provisioned
/// TLS Secrets
pub fn etcd_cluster(cr: &Sporos) -> Result<EtcdCluster> {
    let name = cr.name_any();

    let mut spec = EtcdClusterSpec {
        size: ETCD_CLUSTER_SIZE,
        tls: Some(TlsPolicy {
            static_: Some(StaticTls {
                member: Some(MemberSecret {
                    peer_secret: Some(etcd_peer_tls_secret_name(&name)),
                    server_secret: Some(etcd_server_tls_secret_name(&name)),
                }),
                operator_secret: Some(etcd_client_tls_secret_name(&name)),
            }),
        }),
        pod: Some(EtcdPodPolicy {
            etcd_env: vec![EtcdEnvVar {
                name: "ETCD_AUTO_COMPACTION_RETENTION".to_string(),
                value: "1".to_string(),
            }],
            resources: None,
        }),
    };
    if let Some(policy) = &cr.spec.pod {
        if let Some(pod) = spec.pod.as_mut() {
            pod.resources = Some(policy.resources.clone());
        }
    }

    let mut ec = EtcdCluster::new(&etcd_name(&name), spec);
    ec.metadata.namespace = Some(namespace_of(cr)?);
    ec.metadata.labels = Some(labels_for(&name));
    ec.metadata.owner_references = Some(vec![owner_reference(cr)?]);
    Ok(ec)
}

/// A backup request for the delegated etcd cluster, storing the snapshot
/// under a timestamped S3 path
pub fn etcd_backup(cr: &Sporos, timestamp: i64) -> Result<EtcdBackup> {
    let name = cr.name_any();

    let spec = EtcdBackupSpec {
        etcd_endpoints: vec![etcd_client_url(&name)],
        client_tls_secret: Some(etcd_client_tls_secret_name(&name)),
        storage_type: "S3".to_string(),
        s3: Some(S3BackupSource {
            path: format!("etcd-backups/{name}/{timestamp}"),
            aws_secret: BACKUP_AWS_SECRET.to_string(),
            endpoint: BACKUP_S3_ENDPOINT.to_string(),
        }),
    };

    let mut backup = EtcdBackup::new(&etcd_name(&name), spec);
    backup.metadata.namespace = Some(namespace_of(cr)?);
    backup.metadata.labels = Some(labels_for(&name));
    backup.metadata.owner_references = Some(vec![owner_reference(cr)?]);
    Ok(backup)
}

/// The three control-plane Deployments: API server, controller-manager, and
/// scheduler
pub fn control_plane_deployments(cr: &Sporos) -> Result<Vec<Deployment>> {
    let name = cr.name_any();
    Ok(vec![
        deployment(
            cr,
            apiserver_name(&name),
            apiserver_name(&name),
            apiserver_container(cr),
        )?,
        deployment(
            cr,
            controller_manager_name(&name),
            controller_manager_name(&name),
            controller_manager_container(cr),
        )?,
        deployment(
            cr,
            scheduler_name(&name),
            kubeconfig_secret_name(&name),
            scheduler_container(cr),
        )?,
    ])
}

/// One-replica rolling-update Deployment mounting the given Secret as a
/// projected volume
fn deployment(
    cr: &Sporos,
    name: String,
    secret_name: String,
    container: Container,
) -> Result<Deployment> {
    let selector = labels_for(&name);

    let mut pod_spec = PodSpec {
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: "secrets".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    secret: Some(SecretProjection {
                        name: secret_name,
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };
    if let Some(policy) = &cr.spec.pod {
        apply_pod_policy(&mut pod_spec, policy);
    }

    Ok(Deployment {
        metadata: object_meta(cr, name.clone(), selector.clone())?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(name),
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    max_surge: Some(IntOrString::Int(1)),
                }),
            }),
            ..Default::default()
        }),
        status: None,
    })
}

fn apply_pod_policy(spec: &mut PodSpec, policy: &crate::crd::PodPolicy) {
    let requirements = to_resource_requirements(&policy.resources);
    for container in &mut spec.containers {
        container.resources = Some(requirements.clone());
    }
    if let Some(init_containers) = spec.init_containers.as_mut() {
        for container in init_containers {
            container.resources = Some(requirements.clone());
        }
    }
}

fn apiserver_container(cr: &Sporos) -> Container {
    let name = cr.name_any();
    Container {
        name: "kube-apiserver".to_string(),
        image: Some(cr.spec.image()),
        command: Some(vec![
            "/hyperkube".to_string(),
            "apiserver".to_string(),
            "--enable-admission-plugins=NamespaceLifecycle,LimitRanger,ServiceAccount,DefaultTolerationSeconds,DefaultStorageClass,MutatingAdmissionWebhook,ValidatingAdmissionWebhook,ResourceQuota,NodeRestriction".to_string(),
            format!("--advertise-address={}", cr.api_server_ip().unwrap_or_default()),
            "--allow-privileged=true".to_string(),
            "--anonymous-auth=false".to_string(),
            "--authorization-mode=Node,RBAC".to_string(),
            "--bind-address=0.0.0.0".to_string(),
            format!("--client-ca-file={SECRETS_MOUNT_PATH}/ca.crt"),
            "--enable-bootstrap-token-auth=true".to_string(),
            format!("--etcd-cafile={SECRETS_MOUNT_PATH}/etcd-client-ca.crt"),
            format!("--etcd-certfile={SECRETS_MOUNT_PATH}/etcd-client.crt"),
            format!("--etcd-keyfile={SECRETS_MOUNT_PATH}/etcd-client.key"),
            format!("--etcd-servers={}", etcd_client_url(&name)),
            "--insecure-port=0".to_string(),
            format!("--kubelet-client-certificate={SECRETS_MOUNT_PATH}/apiserver.crt"),
            format!("--kubelet-client-key={SECRETS_MOUNT_PATH}/apiserver.key"),
            "--secure-port=443".to_string(),
            format!("--service-account-key-file={SECRETS_MOUNT_PATH}/service-account.pub"),
            format!("--service-cluster-ip-range={}", cr.spec.service_cidr),
            "--storage-backend=etcd3".to_string(),
            format!("--tls-cert-file={SECRETS_MOUNT_PATH}/apiserver.crt"),
            format!("--tls-private-key-file={SECRETS_MOUNT_PATH}/apiserver.key"),
        ]),
        volume_mounts: Some(vec![secrets_mount()]),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: 443,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn controller_manager_container(cr: &Sporos) -> Container {
    Container {
        name: "kube-controller-manager".to_string(),
        image: Some(cr.spec.image()),
        command: Some(vec![
            "/hyperkube".to_string(),
            "controller-manager".to_string(),
            format!("--cluster-cidr={}", cr.spec.pod_cidr),
            "--allocate-node-cidrs=true".to_string(),
            format!("--service-cluster-ip-range={}", cr.spec.service_cidr),
            format!("--kubeconfig={SECRETS_MOUNT_PATH}/kubeconfig"),
            format!("--cluster-signing-cert-file={SECRETS_MOUNT_PATH}/ca.crt"),
            format!("--cluster-signing-key-file={SECRETS_MOUNT_PATH}/ca.key"),
            "--configure-cloud-routes=false".to_string(),
            "--leader-elect=true".to_string(),
            format!("--root-ca-file={SECRETS_MOUNT_PATH}/ca.crt"),
            format!("--service-account-private-key-file={SECRETS_MOUNT_PATH}/service-account.key"),
            "--use-service-account-credentials=true".to_string(),
        ]),
        volume_mounts: Some(vec![secrets_mount()]),
        ..Default::default()
    }
}

fn scheduler_container(cr: &Sporos) -> Container {
    Container {
        name: "kube-scheduler".to_string(),
        image: Some(cr.spec.image()),
        command: Some(vec![
            "/hyperkube".to_string(),
            "scheduler".to_string(),
            format!("--kubeconfig={SECRETS_MOUNT_PATH}/kubeconfig"),
            "--leader-elect=true".to_string(),
        ]),
        volume_mounts: Some(vec![secrets_mount()]),
        ..Default::default()
    }
}

fn secrets_mount() -> VolumeMount {
    VolumeMount {
        name: "secrets".to_string(),
        mount_path: SECRETS_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

/// ClusterRoleBindings that let nodes bootstrap and renew their own
/// certificates, created inside the new control plane once it is reachable
pub fn bootstrap_role_bindings() -> Vec<ClusterRoleBinding> {
    let group = |name: &str| Subject {
        kind: "Group".to_string(),
        api_group: Some("rbac.authorization.k8s.io".to_string()),
        name: name.to_string(),
        ..Default::default()
    };

    vec![
        cluster_role_binding(
            "system-bootstrap-node-bootstrapper",
            vec![group("system:bootstrappers"), group("system:nodes")],
            "system:node-bootstrapper",
        ),
        cluster_role_binding(
            "system-bootstrap-approve-node-client-csr",
            vec![group("system:bootstrappers")],
            "system:certificates.k8s.io:certificatesigningrequests:nodeclient",
        ),
        cluster_role_binding(
            "system-bootstrap-node-renewal",
            vec![group("system:nodes")],
            "system:certificates.k8s.io:certificatesigningrequests:selfnodeclient",
        ),
    ]
}

fn cluster_role_binding(
    name: &str,
    subjects: Vec<Subject>,
    role_name: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        subjects: Some(subjects),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role_name.to_string(),
        },
    }
}
