//! PKI operations for the self-hosted control plane
//!
//! The operator acts as the certificate authority for every control plane it
//! bootstraps: it generates a self-signed CA per cluster and issues the leaf
//! certificates the components need to trust each other (API server serving
//! cert, admin client cert, etcd peer/server/client certs) plus the key pair
//! that signs service-account tokens.
//!
//! # Security Model
//!
//! - One CA per cluster, generated exactly once; regenerating it would
//!   invalidate every leaf certificate already handed out
//! - TLS organizations map to Kubernetes groups, so the admin certificate
//!   carries `system:masters` and nothing else
//! - Each component receives only the subset of material it needs, via
//!   separate Secrets

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// PKI errors
///
/// Generation failures are never retried locally; they fail the whole
/// reconcile attempt and the caller retries later.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate build or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Stored key or certificate material could not be parsed back
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// DNS names every API server serving certificate must carry, independent of
/// the cluster-specific address list
pub const KUBERNETES_SERVICE_NAMES: [&str; 4] = [
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
];

/// Subject alternative names split by kind
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AltNames {
    /// Literal IP addresses
    pub ips: Vec<IpAddr>,
    /// Everything else, treated as a DNS name
    pub dns: Vec<String>,
}

impl AltNames {
    /// Partition a list of addresses: an entry that parses as an IP literal
    /// becomes an IP SAN, anything else a DNS SAN.
    pub fn parse<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names = Self::default();
        for addr in addrs {
            let addr = addr.as_ref();
            match addr.parse::<IpAddr>() {
                Ok(ip) => names.ips.push(ip),
                Err(_) => names.dns.push(addr.to_string()),
            }
        }
        names
    }

    /// Append a DNS name
    pub fn push_dns(&mut self, name: impl Into<String>) {
        self.dns.push(name.into());
    }

    /// True when the certificate carries no SANs at all (identity-only certs)
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.dns.is_empty()
    }

    fn san_types(&self) -> Result<Vec<SanType>> {
        let mut sans = Vec::with_capacity(self.ips.len() + self.dns.len());
        for ip in &self.ips {
            sans.push(SanType::IpAddress(*ip));
        }
        for dns in &self.dns {
            sans.push(SanType::DnsName(Ia5String::try_from(dns.as_str()).map_err(
                |e| PkiError::CertificateGenerationFailed(format!("invalid DNS name {dns:?}: {e}")),
            )?));
        }
        Ok(sans)
    }
}

/// Parameters for a leaf certificate
#[derive(Clone, Debug)]
pub struct CertConfig {
    /// Subject common name
    pub common_name: String,
    /// Subject organization; maps to a Kubernetes group for client certs
    pub organization: String,
    /// Subject alternative names; empty for identity-only certificates
    pub alt_names: AltNames,
}

/// A private key and the certificate issued for it, both PEM encoded
#[derive(Clone, Debug)]
pub struct KeyCert {
    /// PKCS#8 private key PEM
    pub key_pem: String,
    /// Certificate PEM
    pub cert_pem: String,
}

impl KeyCert {
    /// Private key bytes for Secret payloads
    pub fn key_bytes(&self) -> Vec<u8> {
        self.key_pem.clone().into_bytes()
    }

    /// Certificate bytes for Secret payloads
    pub fn cert_bytes(&self) -> Vec<u8> {
        self.cert_pem.clone().into_bytes()
    }
}

/// Certificate Authority that roots the trust of one control plane
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone, so it is
    /// deserialized again for each signing operation)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA with common name `kube-ca`
    ///
    /// The organizational unit is a random UUID so two bootstraps can never
    /// produce colliding subjects.
    pub fn new() -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String("kube-ca".to_string()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("sporos".to_string()),
        );
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(Uuid::new_v4().to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2044, 1, 1);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Get the CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get the CA private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Load the key pair from stored PEM
    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a leaf certificate signed by this CA
    ///
    /// Generates a fresh key pair, splits the configured addresses into IP
    /// and DNS SANs, and signs. The caller decides what the certificate is
    /// for via [`CertConfig`].
    pub fn issue(&self, config: &CertConfig) -> Result<KeyCert> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!(
                "failed to generate key for {}: {}",
                config.common_name, e
            ))
        })?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(config.common_name.clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(config.organization.clone()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = config.alt_names.san_types()?;

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2044, 1, 1);

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                config.common_name, e
            ))
        })?;

        Ok(KeyCert {
            key_pem: key_pair.serialize_pem(),
            cert_pem: cert.pem(),
        })
    }
}

/// Issue the API server serving certificate
///
/// Organization `kube-master`; SANs are the supplied addresses plus the
/// well-known in-cluster service names.
pub fn api_server_cert(ca: &CertificateAuthority, addrs: &[String]) -> Result<KeyCert> {
    let mut alt_names = AltNames::parse(addrs);
    for name in KUBERNETES_SERVICE_NAMES {
        alt_names.push_dns(name);
    }
    ca.issue(&CertConfig {
        common_name: "kube-apiserver".to_string(),
        organization: "kube-master".to_string(),
        alt_names,
    })
}

/// Issue the cluster-admin client certificate
///
/// Identity-only: no SANs, organization `system:masters` (the well-known
/// Kubernetes group that grants admin power).
pub fn admin_cert(ca: &CertificateAuthority) -> Result<KeyCert> {
    ca.issue(&CertConfig {
        common_name: "admin".to_string(),
        organization: "system:masters".to_string(),
        alt_names: AltNames::default(),
    })
}

/// Issue one of the etcd certificates (peer, server, or client)
///
/// All three use organization `etcd` and carry the etcd hosts as SANs; only
/// the common name differs.
pub fn etcd_cert(
    ca: &CertificateAuthority,
    common_name: &str,
    addrs: &[String],
) -> Result<KeyCert> {
    ca.issue(&CertConfig {
        common_name: common_name.to_string(),
        organization: "etcd".to_string(),
        alt_names: AltNames::parse(addrs),
    })
}

/// Key pair with no certificate, used to sign and verify service-account
/// tokens
///
/// Only the public key reaches the API server's Secret; the private key goes
/// to the controller-manager's Secret.
pub struct ServiceAccountKeyPair {
    /// Private key PEM (token signing, controller-manager side)
    pub private_key_pem: String,
    /// Public key PEM (token verification, API server side)
    pub public_key_pem: String,
}

impl ServiceAccountKeyPair {
    /// Generate a fresh service-account key pair
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!(
                "failed to generate service-account key: {}",
                e
            ))
        })?;

        Ok(Self {
            private_key_pem: key_pair.serialize_pem(),
            public_key_pem: key_pair.public_key_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use x509_parser::prelude::*;

    fn parse_der(pem_str: &str) -> Vec<u8> {
        ::pem::parse(pem_str.as_bytes()).unwrap().contents().to_vec()
    }

    /// Collect the SAN sets of a certificate as (dns names, ip strings)
    fn san_sets(cert_pem: &str) -> (BTreeSet<String>, BTreeSet<String>) {
        let der = parse_der(cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let mut dns = BTreeSet::new();
        let mut ips = BTreeSet::new();
        if let Some(san) = cert.subject_alternative_name().unwrap() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(d) => {
                        dns.insert(d.to_string());
                    }
                    GeneralName::IPAddress(bytes) => {
                        let ip: IpAddr = match bytes.len() {
                            4 => {
                                let octets: [u8; 4] = (*bytes).try_into().unwrap();
                                IpAddr::from(octets)
                            }
                            16 => {
                                let octets: [u8; 16] = (*bytes).try_into().unwrap();
                                IpAddr::from(octets)
                            }
                            _ => panic!("unexpected IP SAN length"),
                        };
                        ips.insert(ip.to_string());
                    }
                    _ => {}
                }
            }
        }
        (dns, ips)
    }

    fn verify_against(cert_pem: &str, ca_cert_pem: &str) -> bool {
        let cert_der = parse_der(cert_pem);
        let ca_der = parse_der(ca_cert_pem);
        let (_, cert) = X509Certificate::from_der(&cert_der).unwrap();
        let (_, ca) = X509Certificate::from_der(&ca_der).unwrap();
        cert.verify_signature(Some(ca.public_key())).is_ok()
    }

    fn organization_of(cert_pem: &str) -> Option<String> {
        let der = parse_der(cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let org = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .map(ToString::to_string);
        org
    }

    // =========================================================================
    // Address classification
    // =========================================================================

    /// An entry that parses as an IP literal lands in the IP set, anything
    /// else is treated as a DNS name.
    #[test]
    fn alt_names_partition_ip_and_dns() {
        let names = AltNames::parse(["10.0.0.5", "myhost.example.com"]);
        assert_eq!(names.ips, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(names.dns, vec!["myhost.example.com".to_string()]);
    }

    #[test]
    fn alt_names_accept_ipv6_literals() {
        let names = AltNames::parse(["::1", "localhost"]);
        assert_eq!(names.ips.len(), 1);
        assert_eq!(names.dns, vec!["localhost".to_string()]);
    }

    // =========================================================================
    // CA stories
    // =========================================================================

    /// Story: The CA is self-signed with CN kube-ca
    #[test]
    fn story_ca_is_self_signed_kube_ca() {
        let ca = CertificateAuthority::new().unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("PRIVATE KEY"));

        let der = parse_der(ca.cert_pem());
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "kube-ca");
        assert!(cert.is_ca());
        assert!(verify_against(ca.cert_pem(), ca.cert_pem()));
    }

    /// Story: Two CA generations never collide on subject
    ///
    /// The random organizational unit guarantees that a regenerated CA is
    /// distinguishable from the one it would (wrongly) replace.
    #[test]
    fn story_ca_subjects_are_unique_across_invocations() {
        let ca1 = CertificateAuthority::new().unwrap();
        let ca2 = CertificateAuthority::new().unwrap();

        let subject = |pem: &str| {
            let der = parse_der(pem);
            let (_, cert) = X509Certificate::from_der(&der).unwrap();
            cert.subject().to_string()
        };
        assert_ne!(subject(ca1.cert_pem()), subject(ca2.cert_pem()));
    }

    // =========================================================================
    // Leaf certificate stories
    // =========================================================================

    /// Story: Every leaf verifies against the CA that issued it, and only
    /// that CA
    #[test]
    fn story_leaf_verifies_against_issuing_ca_only() {
        let ca = CertificateAuthority::new().unwrap();
        let other = CertificateAuthority::new().unwrap();
        let leaf = admin_cert(&ca).unwrap();

        assert!(verify_against(&leaf.cert_pem, ca.cert_pem()));
        assert!(!verify_against(&leaf.cert_pem, other.cert_pem()));
    }

    /// Story: The API server certificate carries exactly the supplied
    /// addresses plus the well-known kubernetes service names
    #[test]
    fn story_api_server_cert_san_set_is_exact() {
        let ca = CertificateAuthority::new().unwrap();
        let addrs = vec![
            "localhost".to_string(),
            "10.96.0.1".to_string(),
            "demo-kube-apiserver.default.svc".to_string(),
            "1.2.3.4".to_string(),
        ];
        let cert = api_server_cert(&ca, &addrs).unwrap();

        let (dns, ips) = san_sets(&cert.cert_pem);

        let expected_dns: BTreeSet<String> = [
            "localhost",
            "demo-kube-apiserver.default.svc",
            "kubernetes",
            "kubernetes.default",
            "kubernetes.default.svc",
            "kubernetes.default.svc.cluster.local",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let expected_ips: BTreeSet<String> =
            ["10.96.0.1", "1.2.3.4"].iter().map(ToString::to_string).collect();

        assert_eq!(dns, expected_dns);
        assert_eq!(ips, expected_ips);
        assert_eq!(organization_of(&cert.cert_pem).as_deref(), Some("kube-master"));
    }

    /// Story: The admin certificate is identity-only
    ///
    /// No SANs at all; its power comes purely from the system:masters
    /// organization.
    #[test]
    fn story_admin_cert_is_identity_only() {
        let ca = CertificateAuthority::new().unwrap();
        let cert = admin_cert(&ca).unwrap();

        let (dns, ips) = san_sets(&cert.cert_pem);
        assert!(dns.is_empty());
        assert!(ips.is_empty());
        assert_eq!(
            organization_of(&cert.cert_pem).as_deref(),
            Some("system:masters")
        );
    }

    /// Story: Etcd certificates share the etcd organization and host list
    #[test]
    fn story_etcd_certs_carry_etcd_hosts() {
        let ca = CertificateAuthority::new().unwrap();
        let hosts = vec!["localhost".to_string(), "demo-etcd-client".to_string()];

        for cn in ["etcd-peer", "etcd-server", "etcd-client"] {
            let cert = etcd_cert(&ca, cn, &hosts).unwrap();
            let (dns, ips) = san_sets(&cert.cert_pem);
            assert!(dns.contains("localhost"));
            assert!(dns.contains("demo-etcd-client"));
            assert!(ips.is_empty());
            assert_eq!(organization_of(&cert.cert_pem).as_deref(), Some("etcd"));
            assert!(verify_against(&cert.cert_pem, ca.cert_pem()));
        }
    }

    /// Story: The service-account pair splits into a private signing key and
    /// a public verification key, with no certificate involved
    #[test]
    fn story_service_account_pair_has_no_certificate() {
        let pair = ServiceAccountKeyPair::generate().unwrap();
        assert!(pair.private_key_pem.contains("PRIVATE KEY"));
        assert!(pair.public_key_pem.contains("PUBLIC KEY"));
        assert!(!pair.public_key_pem.contains("PRIVATE"));
        assert!(!pair.private_key_pem.contains("CERTIFICATE"));
    }
}
