use super::cache::LeafCache;
use super::CaError;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Where the root pair lives on disk.
#[derive(Debug, Clone)]
pub struct CaPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Options for generating a missing root and for issuing leaves.
#[derive(Debug, Clone)]
pub struct CaSettings {
    pub common_name: String,
    pub validity: Duration,
    pub leaf_ttl: Duration,
    pub leaf_cache_ttl: Option<Duration>,
}

impl CaSettings {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            validity: Duration::from_secs(5 * 365 * 86_400),
            leaf_ttl: Duration::from_secs(24 * 3600),
            leaf_cache_ttl: None,
        }
    }
}

/// A short-lived certificate for one interception session.
pub struct LeafCertificate {
    hostnames: Vec<String>,
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
    not_after: OffsetDateTime,
}

impl LeafCertificate {
    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    /// Leaf DER followed by the root DER.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Server config presenting this leaf, HTTP/1.1 only.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CaError> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), key)
            .map_err(|e| CaError::CertGen(format!("failed to build server config: {e}")))?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hostnames", &self.hostnames)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Root signing authority. Issuance only reads the root key, so concurrent
/// calls need no locking beyond the optional cache.
pub struct CertificateAuthority {
    issuer: Certificate,
    issuer_key: KeyPair,
    root_der: CertificateDer<'static>,
    root_pem: String,
    common_name: String,
    not_after: OffsetDateTime,
    leaf_ttl: Duration,
    cache: Option<LeafCache>,
}

impl CertificateAuthority {
    /// Loads the root pair from `paths`, generating and persisting a new one
    /// when neither file exists.
    pub fn load(paths: &CaPaths, settings: &CaSettings) -> Result<Self, CaError> {
        match (paths.cert.exists(), paths.key.exists()) {
            (true, true) => {
                let cert_pem = std::fs::read_to_string(&paths.cert)?;
                let key_pem = std::fs::read_to_string(&paths.key)?;
                let ca = Self::from_pem(&cert_pem, &key_pem, settings)?;
                info!(
                    cert = %paths.cert.display(),
                    subject = %ca.common_name,
                    "Loaded root CA"
                );
                Ok(ca)
            }
            (false, false) => {
                let ca = Self::generate(settings)?;
                ca.persist(paths)?;
                Ok(ca)
            }
            _ => Err(CaError::Init(format!(
                "only one of {} and {} exists",
                paths.cert.display(),
                paths.key.display()
            ))),
        }
    }

    /// Generates an in-memory root.
    pub fn generate(settings: &CaSettings) -> Result<Self, CaError> {
        let key = KeyPair::generate().map_err(|e| CaError::Init(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, settings.common_name.as_str());
        dn.push(DnType::OrganizationName, "Burst Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        let not_after = now + to_time(settings.validity);
        params.not_before = now - time::Duration::days(1);
        params.not_after = not_after;

        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::Init(format!("failed to self-sign root: {e}")))?;

        info!(subject = %settings.common_name, "Generated new root CA");
        Ok(Self {
            root_der: cert.der().clone(),
            root_pem: cert.pem(),
            issuer: cert,
            issuer_key: key,
            common_name: settings.common_name.clone(),
            not_after,
            leaf_ttl: settings.leaf_ttl,
            cache: settings.leaf_cache_ttl.map(LeafCache::new),
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str, settings: &CaSettings) -> Result<Self, CaError> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| CaError::Init(format!("invalid root key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CaError::Init(format!("invalid root certificate: {e}")))?;

        // The issuer is rebuilt from the stored params; clients verify the
        // chain against the original DER, so that is what gets served.
        let original_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Init("no certificate in root PEM".into()))?
            .map_err(|e| CaError::Init(e.to_string()))?;

        let common_name = common_name_of(&params.distinguished_name)
            .unwrap_or_else(|| settings.common_name.clone());
        let not_after = params.not_after;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| CaError::Init(format!("failed to rebuild root issuer: {e}")))?;

        Ok(Self {
            issuer,
            issuer_key: key,
            root_der: original_der,
            root_pem: cert_pem.to_string(),
            common_name,
            not_after,
            leaf_ttl: settings.leaf_ttl,
            cache: settings.leaf_cache_ttl.map(LeafCache::new),
        })
    }

    fn persist(&self, paths: &CaPaths) -> Result<(), CaError> {
        for path in [&paths.cert, &paths.key] {
            if let Some(parent) = path.parent() {
                create_private_dir(parent)?;
            }
        }

        write_private_file(&paths.cert, self.root_pem.as_bytes())?;
        write_private_file(&paths.key, self.issuer_key.serialize_pem().as_bytes())?;

        info!(
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            "Saved root CA; install the certificate in client trust stores to avoid warnings"
        );
        Ok(())
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// Issues a leaf whose subject is `hostnames[0]` and whose SAN list is the
    /// full set, valid until `min(root expiry, now + leaf ttl)`.
    pub fn issue_leaf(&self, hostnames: &[String]) -> Result<Arc<LeafCertificate>, CaError> {
        if let Some(cache) = &self.cache {
            if let Some(leaf) = cache.get(hostnames) {
                return Ok(leaf);
            }
        }

        let leaf = Arc::new(self.sign_leaf(hostnames)?);
        if let Some(cache) = &self.cache {
            cache.insert(hostnames, leaf.clone());
        }
        Ok(leaf)
    }

    fn sign_leaf(&self, hostnames: &[String]) -> Result<LeafCertificate, CaError> {
        let subject = hostnames
            .first()
            .ok_or_else(|| CaError::CertGen("no hostnames requested".into()))?;

        let now = OffsetDateTime::now_utc();
        let not_after = std::cmp::min(self.not_after, now + to_time(self.leaf_ttl));
        if not_after <= now {
            return Err(CaError::CertGen("root CA has expired".into()));
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.as_str());
        params.distinguished_name = dn;
        params.subject_alt_names = hostnames
            .iter()
            .map(|name| san_for(name))
            .collect::<Result<_, _>>()?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = not_after;

        let key = KeyPair::generate().map_err(|e| CaError::CertGen(e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.issuer, &self.issuer_key)
            .map_err(|e| CaError::CertGen(format!("failed to sign leaf for {subject}: {e}")))?;

        debug!(subject = %subject, sans = hostnames.len(), "Issued leaf certificate");

        Ok(LeafCertificate {
            hostnames: hostnames.to_vec(),
            chain: vec![cert.der().clone(), self.root_der.clone()],
            key_der: key.serialize_der(),
            not_after,
        })
    }
}

fn san_for(name: &str) -> Result<SanType, CaError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = name
        .to_string()
        .try_into()
        .map_err(|e| CaError::InvalidName(format!("{name}: {e}")))?;
    Ok(SanType::DnsName(dns))
}

fn common_name_of(dn: &DistinguishedName) -> Option<String> {
    dn.iter().find_map(|(ty, value)| match (ty, value) {
        (DnType::CommonName, rcgen::DnValue::Utf8String(s)) => Some(s.clone()),
        (DnType::CommonName, rcgen::DnValue::PrintableString(s)) => Some(s.as_str().to_string()),
        _ => None,
    })
}

fn to_time(duration: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX / 2))
}

fn create_private_dir(dir: &Path) -> Result<(), CaError> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), CaError> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn settings() -> CaSettings {
        CaSettings::new("test-host")
    }

    fn san_set(der: &[u8]) -> Vec<String> {
        let (_, cert) = X509Certificate::from_der(der).unwrap();
        let sans = cert
            .subject_alternative_name()
            .unwrap()
            .expect("leaf must carry a SAN extension");
        sans.value
            .general_names
            .iter()
            .map(|name| match name {
                GeneralName::DNSName(dns) => dns.to_string(),
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => IpAddr::from(<[u8; 4]>::try_from(*bytes).unwrap()).to_string(),
                    16 => IpAddr::from(<[u8; 16]>::try_from(*bytes).unwrap()).to_string(),
                    _ => panic!("unexpected ip length"),
                },
                other => panic!("unexpected SAN {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_leaf_san_and_issuer() {
        let ca = CertificateAuthority::generate(&settings()).unwrap();
        let hosts = vec![
            "example.com".to_string(),
            "www.example.com".to_string(),
            "10.0.0.1".to_string(),
        ];
        let leaf = ca.issue_leaf(&hosts).unwrap();

        assert_eq!(san_set(leaf.leaf_der()), hosts);

        let (_, leaf_cert) = X509Certificate::from_der(leaf.leaf_der()).unwrap();
        let (_, root_cert) = X509Certificate::from_der(ca.root_der()).unwrap();
        assert_eq!(leaf_cert.issuer().as_raw(), root_cert.subject().as_raw());
        assert_eq!(
            leaf_cert.subject().iter_common_name().next().unwrap().as_str().unwrap(),
            "example.com"
        );
        assert_eq!(leaf.chain().len(), 2);
        assert_eq!(&leaf.chain()[1], ca.root_der());
    }

    #[test]
    fn test_leaf_validity_clipped_to_root() {
        let mut short = settings();
        short.validity = Duration::from_secs(3600);
        short.leaf_ttl = Duration::from_secs(48 * 3600);
        let ca = CertificateAuthority::generate(&short).unwrap();

        let leaf = ca.issue_leaf(&["clip.test".to_string()]).unwrap();
        assert!(leaf.not_after() <= ca.not_after());
    }

    #[test]
    fn test_empty_hostnames_rejected() {
        let ca = CertificateAuthority::generate(&settings()).unwrap();
        assert!(matches!(ca.issue_leaf(&[]), Err(CaError::CertGen(_))));
    }

    #[test]
    fn test_every_issuance_is_fresh_without_cache() {
        let ca = CertificateAuthority::generate(&settings()).unwrap();
        let hosts = vec!["fresh.test".to_string()];
        let first = ca.issue_leaf(&hosts).unwrap();
        let second = ca.issue_leaf(&hosts).unwrap();
        assert_ne!(first.leaf_der(), second.leaf_der());
    }

    #[test]
    fn test_cache_reuses_leaf() {
        let mut cached = settings();
        cached.leaf_cache_ttl = Some(Duration::from_secs(60));
        let ca = CertificateAuthority::generate(&cached).unwrap();
        let hosts = vec!["cached.test".to_string()];
        let first = ca.issue_leaf(&hosts).unwrap();
        let second = ca.issue_leaf(&hosts).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_cache_never_returns_expired_leaf() {
        let mut cached = settings();
        cached.leaf_ttl = Duration::from_secs(1);
        cached.leaf_cache_ttl = Some(Duration::from_secs(3600));
        let ca = CertificateAuthority::generate(&cached).unwrap();
        let hosts = vec!["short-lived.test".to_string()];
        let first = ca.issue_leaf(&hosts).unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        let second = ca.issue_leaf(&hosts).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.not_after() > OffsetDateTime::now_utc());
    }

    #[test]
    fn test_server_config_offers_http1_only() {
        let ca = CertificateAuthority::generate(&settings()).unwrap();
        let leaf = ca.issue_leaf(&["alpn.test".to_string()]).unwrap();
        let config = leaf.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_load_creates_then_reuses_root() {
        let dir = TempDir::new().unwrap();
        let paths = CaPaths {
            cert: dir.path().join("ca/ca-cert.pem"),
            key: dir.path().join("ca/ca-key.pem"),
        };

        let created = CertificateAuthority::load(&paths, &settings()).unwrap();
        assert!(paths.cert.exists());
        assert!(paths.key.exists());

        let reloaded = CertificateAuthority::load(&paths, &settings()).unwrap();
        assert_eq!(created.root_der(), reloaded.root_der());
        assert_eq!(reloaded.common_name(), "test-host");

        // Leaves from the reloaded root still chain to the persisted subject.
        let leaf = reloaded.issue_leaf(&["reload.test".to_string()]).unwrap();
        let (_, leaf_cert) = X509Certificate::from_der(leaf.leaf_der()).unwrap();
        let (_, root_cert) = X509Certificate::from_der(created.root_der()).unwrap();
        assert_eq!(leaf_cert.issuer().as_raw(), root_cert.subject().as_raw());
    }

    #[cfg(unix)]
    #[test]
    fn test_persisted_key_is_owner_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let paths = CaPaths {
            cert: dir.path().join("ca-cert.pem"),
            key: dir.path().join("ca-key.pem"),
        };
        CertificateAuthority::load(&paths, &settings()).unwrap();

        let mode = std::fs::metadata(&paths.key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }

    #[test]
    fn test_half_present_pair_is_an_init_error() {
        let dir = TempDir::new().unwrap();
        let paths = CaPaths {
            cert: dir.path().join("ca-cert.pem"),
            key: dir.path().join("ca-key.pem"),
        };
        std::fs::write(&paths.cert, "not a cert").unwrap();

        assert!(matches!(
            CertificateAuthority::load(&paths, &settings()),
            Err(CaError::Init(_))
        ));
    }
}
