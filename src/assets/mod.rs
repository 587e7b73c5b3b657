//! Named bootstrap assets and the bundles the control plane consumes
//!
//! An asset is an immutable named byte blob (key, certificate, or kubeconfig)
//! produced while bootstrapping one control plane. Assets are grouped into
//! bundles, looked up by exact name, and materialized into Secrets by the
//! resource provisioner.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::crd::Sporos;
use crate::pki::{self, CertificateAuthority, KeyCert, ServiceAccountKeyPair};
use crate::resources;
use crate::{Error, Result};

/// A named byte blob produced during bootstrap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Asset {
    /// Lookup name; doubles as the Secret key the data lands under
    pub name: String,
    /// Raw contents (PEM or kubeconfig YAML)
    pub data: Vec<u8>,
}

/// An ordered bundle of assets with unique names
#[derive(Clone, Debug, Default)]
pub struct Assets(Vec<Asset>);

impl Assets {
    /// Append an asset under the given name
    pub fn push(&mut self, name: &str, data: Vec<u8>) {
        self.0.push(Asset {
            name: name.to_string(),
            data,
        });
    }

    /// Exact-name lookup
    ///
    /// A missing name is a hard error carrying the name: silently substituting
    /// empty bytes would end up persisted into a Secret.
    pub fn get(&self, name: &str) -> Result<&Asset> {
        self.0
            .iter()
            .find(|asset| asset.name == name)
            .ok_or_else(|| Error::missing_asset(name))
    }

    /// Names of all assets in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|asset| asset.name.as_str())
    }

    /// Number of assets in the bundle
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the bundle holds nothing
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything `prepare` generates for one control plane
pub struct BootstrapAssets {
    /// TLS material for the etcd members and the operator-side client
    pub etcd: Assets,
    /// TLS material, service-account keys, and kubeconfig for the control plane
    pub controlplane: Assets,
}

/// Generate the full PKI asset set for one control plane
///
/// One CA per invocation; the etcd bundle is keyed off `localhost` and the
/// etcd client service hostname, the control-plane bundle off `localhost`,
/// the derived service IP, the in-cluster DNS name, and the externally
/// observed API server IP (which is why this must not run before the
/// endpoint has an address).
pub fn prepare(cr: &Sporos, api_server_ip: &str) -> Result<BootstrapAssets> {
    let name = cr.name_any();
    let namespace = resources::namespace_of(cr)?;

    let ca = CertificateAuthority::new()?;

    let etcd_hosts = vec![
        "localhost".to_string(),
        resources::etcd_client_host(&name),
    ];
    let etcd = etcd_tls_assets(&ca, &etcd_hosts)?;

    let service_ip = first_service_ip(&cr.spec.service_cidr)?;
    let apiserver_host = resources::apiserver_service_host(&name, &namespace);
    let api_addrs = vec![
        "localhost".to_string(),
        service_ip.to_string(),
        apiserver_host.clone(),
        api_server_ip.to_string(),
    ];
    let controlplane =
        controlplane_tls_assets(&ca, &api_addrs, &format!("https://{apiserver_host}"))?;

    Ok(BootstrapAssets { etcd, controlplane })
}

/// Build the etcd TLS bundle: peer, server, and client certificates, each
/// paired with the CA certificate under the key name its consumer expects
pub fn etcd_tls_assets(ca: &CertificateAuthority, hosts: &[String]) -> Result<Assets> {
    let peer = pki::etcd_cert(ca, "etcd-peer", hosts)?;
    let server = pki::etcd_cert(ca, "etcd-server", hosts)?;
    let client = pki::etcd_cert(ca, "etcd-client", hosts)?;

    let ca_cert = ca.cert_pem().as_bytes().to_vec();

    let mut assets = Assets::default();
    assets.push("peer-ca.crt", ca_cert.clone());
    assets.push("peer.key", peer.key_bytes());
    assets.push("peer.crt", peer.cert_bytes());
    assets.push("server-ca.crt", ca_cert.clone());
    assets.push("server.key", server.key_bytes());
    assets.push("server.crt", server.cert_bytes());
    assets.push("etcd-client-ca.crt", ca_cert);
    assets.push("etcd-client.key", client.key_bytes());
    assets.push("etcd-client.crt", client.cert_bytes());
    Ok(assets)
}

/// Build the control-plane bundle: CA pair, API server serving certificate,
/// service-account key pair, admin client certificate, and the admin
/// kubeconfig derived from them
pub fn controlplane_tls_assets(
    ca: &CertificateAuthority,
    api_addrs: &[String],
    server_url: &str,
) -> Result<Assets> {
    let apiserver = pki::api_server_cert(ca, api_addrs)?;
    let service_account = ServiceAccountKeyPair::generate()?;
    let admin = pki::admin_cert(ca)?;

    let kubeconfig = admin_kubeconfig(server_url, ca.cert_pem().as_bytes(), &admin)?;

    let mut assets = Assets::default();
    assets.push("ca.key", ca.key_pem().as_bytes().to_vec());
    assets.push("ca.crt", ca.cert_pem().as_bytes().to_vec());
    assets.push("apiserver.key", apiserver.key_bytes());
    assets.push("apiserver.crt", apiserver.cert_bytes());
    assets.push(
        "service-account.key",
        service_account.private_key_pem.into_bytes(),
    );
    assets.push(
        "service-account.pub",
        service_account.public_key_pem.into_bytes(),
    );
    assets.push("admin.key", admin.key_bytes());
    assets.push("admin.crt", admin.cert_bytes());
    assets.push("kubeconfig", kubeconfig);
    Ok(assets)
}

/// First usable address of the service CIDR
///
/// The API server claims it as its in-cluster service IP, so it has to appear
/// in the serving certificate's SANs.
pub fn first_service_ip(service_cidr: &str) -> Result<Ipv4Addr> {
    let (addr, prefix) = service_cidr
        .split_once('/')
        .ok_or_else(|| Error::validation(format!("invalid serviceCIDR {service_cidr:?}")))?;
    let base: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::validation(format!("invalid serviceCIDR address {addr:?}")))?;
    if !prefix.parse::<u8>().is_ok_and(|p| p <= 32) {
        return Err(Error::validation(format!(
            "invalid serviceCIDR prefix {prefix:?}"
        )));
    }
    Ok(Ipv4Addr::from(u32::from(base) + 1))
}

// Kubeconfig wire format (apiVersion v1, kind Config). Written out explicitly
// so the emitted document matches what kubectl and client libraries expect.

#[derive(Debug, Serialize, Deserialize)]
struct KubeconfigDoc {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    client_key_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

/// Build the admin kubeconfig document
///
/// One cluster entry (`local`) pointing at the in-cluster API server address
/// with the CA embedded, one user entry (`admin`) with the client pair, one
/// context binding them, marked current. Consumed both by operators and by
/// the controller-manager/scheduler containers.
pub fn admin_kubeconfig(server_url: &str, ca_cert: &[u8], admin: &KeyCert) -> Result<Vec<u8>> {
    let doc = KubeconfigDoc {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: "local".to_string(),
            cluster: ClusterEntry {
                server: server_url.to_string(),
                certificate_authority_data: BASE64.encode(ca_cert),
            },
        }],
        users: vec![NamedUser {
            name: "admin".to_string(),
            user: UserEntry {
                client_certificate_data: BASE64.encode(admin.cert_pem.as_bytes()),
                client_key_data: BASE64.encode(admin.key_pem.as_bytes()),
            },
        }],
        contexts: vec![NamedContext {
            name: "local".to_string(),
            context: ContextEntry {
                cluster: "local".to_string(),
                user: "admin".to_string(),
            },
        }],
        current_context: "local".to_string(),
    };

    let yaml = serde_yaml::to_string(&doc)
        .map_err(|e| Error::serialization(format!("failed to serialize kubeconfig: {e}")))?;
    Ok(yaml.into_bytes())
}
