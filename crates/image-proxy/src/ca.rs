//! Certificate Authority for the MITM proxy.
//!
//! Holds the root keypair loaded at startup and signs per-host leaf
//! certificates on demand. Leaves are cached by hostname for the process
//! lifetime and re-minted shortly before they expire.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::error::{ConfigError, MintError};

/// Leaf certificates are valid this many days after minting.
const LEAF_VALIDITY_DAYS: i64 = 90;

/// Root certificates created by [`CertificateAuthority::generate`] are valid
/// this many days.
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Backdating applied to every certificate to absorb client clock skew.
const CLOCK_SKEW: Duration = Duration::days(1);

/// A cached leaf is re-minted once it is this close to expiry.
const RENEW_BEFORE_EXPIRY: Duration = Duration::days(1);

/// A freshly generated root keypair in PEM form.
#[derive(Clone)]
pub struct GeneratedRoot {
    /// Root certificate PEM.
    pub cert_pem: String,
    /// Root private key PEM (PKCS#8).
    pub key_pem: String,
}

impl std::fmt::Debug for GeneratedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedRoot")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

struct CachedLeaf {
    key: Arc<CertifiedKey>,
    renew_after: OffsetDateTime,
}

/// The root authority used to impersonate origin servers.
///
/// Immutable after [`load`](Self::load) apart from the internal leaf cache,
/// so it is shared behind an `Arc` by every connection.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    root_pem: String,
    provider: Arc<CryptoProvider>,
    leaves: RwLock<HashMap<String, CachedLeaf>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The private key is deliberately absent.
        f.debug_struct("CertificateAuthority")
            .field("root_der_len", &self.root_der.len())
            .field("cached_leaves", &self.leaves.read().len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Loads the root authority from PEM-encoded certificate and key bytes.
    ///
    /// The first certificate in `cert_pem` is the root. Fails when either
    /// blob does not parse, when the certificate is not a CA, or when the key
    /// does not belong to the certificate.
    pub fn load(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, ConfigError> {
        let root_der = rustls_pemfile::certs(&mut &cert_pem[..])
            .next()
            .ok_or_else(|| ConfigError::InvalidCertificate("no PEM certificate found".into()))?
            .map_err(|e| ConfigError::InvalidCertificate(e.to_string()))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(root_der.as_ref())
            .map_err(|e| ConfigError::InvalidCertificate(e.to_string()))?;

        if !parsed.is_ca() {
            return Err(ConfigError::InvalidCertificate(
                "certificate is not a certificate authority".into(),
            ));
        }
        if !parsed.validity().is_valid() {
            tracing::warn!("CA certificate is outside its validity window");
        }

        // PKCS#8, PKCS#1 (RSA) and SEC1 (EC) keys are all accepted.
        let key_der = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| ConfigError::InvalidKey(e.to_string()))?
            .ok_or_else(|| ConfigError::InvalidKey("no PEM private key found".into()))?;
        let key_pair =
            KeyPair::try_from(&key_der).map_err(|e| ConfigError::InvalidKey(e.to_string()))?;

        if parsed.public_key().raw != key_pair.subject_public_key_info().as_slice() {
            return Err(ConfigError::KeyMismatch);
        }

        let root_pem = pem::encode(&pem::Pem::new("CERTIFICATE", root_der.to_vec()));
        let issuer = Issuer::from_ca_cert_pem(&root_pem, key_pair)
            .map_err(|e| ConfigError::InvalidCertificate(e.to_string()))?;

        Ok(Self {
            issuer,
            root_der,
            root_pem,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            leaves: RwLock::new(HashMap::new()),
        })
    }

    /// Generates a new self-signed root keypair.
    pub fn generate(common_name: &str) -> Result<GeneratedRoot, ConfigError> {
        let key_pair = KeyPair::generate().map_err(|e| ConfigError::Generation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, common_name);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ConfigError::Generation(e.to_string()))?;

        Ok(GeneratedRoot {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Returns the root certificate in PEM format.
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// Returns the root certificate in DER format.
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Returns the number of hostnames with a cached leaf.
    pub fn cached_leaves(&self) -> usize {
        self.leaves.read().len()
    }

    /// Returns the leaf identity for `host`, minting it if needed.
    ///
    /// The certificate's subject and SAN equal `host` and the chain is
    /// `[leaf, root]`.
    pub fn mint_leaf(&self, host: &str) -> Result<Arc<CertifiedKey>, MintError> {
        let host = normalize_host(host);
        let now = OffsetDateTime::now_utc();

        if let Some(cached) = self.leaves.read().get(&host) {
            if cached.renew_after > now {
                return Ok(Arc::clone(&cached.key));
            }
        }

        let key = Arc::new(self.sign_leaf(&host, now)?);
        tracing::debug!("Minted leaf certificate for {}", host);

        let mut leaves = self.leaves.write();
        // A concurrent task may have minted the same host in the meantime.
        if let Some(cached) = leaves.get(&host) {
            if cached.renew_after > now {
                return Ok(Arc::clone(&cached.key));
            }
        }
        leaves.insert(
            host,
            CachedLeaf {
                key: Arc::clone(&key),
                renew_after: now + Duration::days(LEAF_VALIDITY_DAYS) - RENEW_BEFORE_EXPIRY,
            },
        );
        Ok(key)
    }

    /// Builds the TLS server configuration presented to clients for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, MintError> {
        let leaf = self.mint_leaf(host)?;

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(MintError::Config)?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(LeafResolver { leaf }));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    fn sign_leaf(&self, host: &str, now: OffsetDateTime) -> Result<CertifiedKey, MintError> {
        let san = subject_alt_name(host)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(MintError::SigningKey)?;

        Ok(CertifiedKey::new(
            vec![cert.der().clone(), self.root_der.clone()],
            signing_key,
        ))
    }
}

/// Presents one pre-minted leaf regardless of SNI.
#[derive(Debug)]
struct LeafResolver {
    leaf: Arc<CertifiedKey>,
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.leaf))
    }
}

/// Lower-cases DNS names and strips IPv6 brackets.
fn normalize_host(host: &str) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn subject_alt_name(host: &str) -> Result<SanType, MintError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    if !is_valid_dns_name(host) {
        return Err(MintError::InvalidHostname(host.to_string()));
    }
    let name = host
        .try_into()
        .map_err(|_| MintError::InvalidHostname(host.to_string()))?;
    Ok(SanType::DnsName(name))
}

/// Checks that `host` can be a certificate DNS name.
///
/// Labels are 1-63 bytes of letters, digits, `-` or `_` and never start or
/// end with `-`. A single trailing dot is not accepted.
pub fn is_valid_dns_name(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    // An all-numeric last label is IPv4 shorthand such as `127.1`.
    if host
        .rsplit('.')
        .next()
        .is_some_and(|tld| tld.bytes().all(|b| b.is_ascii_digit()))
    {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}
