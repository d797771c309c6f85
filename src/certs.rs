//! Per-host leaf certificate minting, grounded on the teacher's
//! `CaAuthority` (rcgen + rustls `pki_types`), extended with disk-backed
//! caching and a per-host single-flight guard so concurrent `obtain` calls
//! for the same host mint at most once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{ProxyError, Result};

/// PEM-encoded leaf certificate and private key for one host.
#[derive(Debug, Clone)]
pub struct LeafCert {
    pub cert_pem: String,
    pub key_pem: String,
}

impl LeafCert {
    pub fn to_rustls(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut cert_reader = std::io::Cursor::new(self.cert_pem.as_bytes());
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .filter_map(|r| r.ok())
            .collect();
        if certs.is_empty() {
            return Err(ProxyError::CertMintError("no certificate in PEM".into()));
        }

        let mut key_reader = std::io::Cursor::new(self.key_pem.as_bytes());
        let key = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .next()
            .and_then(|r| r.ok())
            .ok_or_else(|| ProxyError::CertMintError("no private key in PEM".into()))?;

        Ok((certs, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.secret_pkcs8_der().to_vec()))))
    }
}

struct CaAuthority {
    key_pair: KeyPair,
    cert: rcgen::Certificate,
}

/// Issues and caches per-host leaf certs signed by a locally trusted CA.
///
/// The CA material is read once at startup; minting for a host never
/// happens before it is loaded (construction fails if the files are
/// missing, matching the spec's "fail startup" requirement).
pub struct CertificateMint {
    ca: CaAuthority,
    certs_dir: PathBuf,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateMint {
    pub async fn load(ca_cert_path: &Path, ca_key_path: &Path, certs_dir: impl Into<PathBuf>) -> Result<Self> {
        let cert_pem = fs::read_to_string(ca_cert_path)
            .await
            .map_err(|e| ProxyError::CertMintError(format!("reading CA cert: {e}")))?;
        let key_pem = fs::read_to_string(ca_key_path)
            .await
            .map_err(|e| ProxyError::CertMintError(format!("reading CA key: {e}")))?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::CertMintError(format!("parsing CA key: {e}")))?;
        let ca_params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| ProxyError::CertMintError(format!("parsing CA cert: {e}")))?;
        let cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::CertMintError(format!("reconstructing CA cert: {e}")))?;

        let certs_dir = certs_dir.into();
        fs::create_dir_all(&certs_dir)
            .await
            .map_err(|e| ProxyError::CertMintError(format!("creating certs dir: {e}")))?;

        Ok(Self {
            ca: CaAuthority { key_pair, cert },
            certs_dir,
            in_flight: DashMap::new(),
        })
    }

    fn paths_for(&self, host: &str) -> (PathBuf, PathBuf) {
        (
            self.certs_dir.join(format!("{host}.crt")),
            self.certs_dir.join(format!("{host}.key")),
        )
    }

    /// Returns the cached leaf cert for `host`, minting it if this is the
    /// first call. Concurrent callers for the same host share one mint.
    pub async fn obtain(&self, host: &str) -> Result<LeafCert> {
        let lock = self
            .in_flight
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let (cert_path, key_path) = self.paths_for(host);
        if let Ok(existing) = self.read_existing(&cert_path, &key_path).await {
            return Ok(existing);
        }

        let leaf = self.mint(host)?;
        fs::write(&cert_path, &leaf.cert_pem)
            .await
            .map_err(|e| ProxyError::CertMintError(format!("writing leaf cert: {e}")))?;
        fs::write(&key_path, &leaf.key_pem)
            .await
            .map_err(|e| ProxyError::CertMintError(format!("writing leaf key: {e}")))?;
        Ok(leaf)
    }

    async fn read_existing(&self, cert_path: &Path, key_path: &Path) -> Result<LeafCert> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .map_err(|_| ProxyError::CertMintError("no cached cert".into()))?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .map_err(|_| ProxyError::CertMintError("no cached key".into()))?;
        Ok(LeafCert { cert_pem, key_pem })
    }

    fn mint(&self, host: &str) -> Result<LeafCert> {
        let mut params = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            let mut p = CertificateParams::new(Vec::new())
                .map_err(|e| ProxyError::CertMintError(e.to_string()))?;
            p.subject_alt_names.push(SanType::IpAddress(ip.into()));
            p
        } else {
            CertificateParams::new(vec![host.to_string()])
                .map_err(|e| ProxyError::CertMintError(e.to_string()))?
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(365);

        let mut serial_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut serial_bytes);
        params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial_bytes));

        // Leaf keys must be RSA-2048. rcgen/ring can sign with an RSA key
        // but not generate one, so the key is generated with `rsa` and
        // handed to rcgen as PKCS8 DER.
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .map_err(|e| ProxyError::CertMintError(format!("generating RSA key: {e}")))?;
        let key_der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| ProxyError::CertMintError(format!("encoding RSA key: {e}")))?;
        let key_pair = KeyPair::try_from(key_der.as_bytes())
            .map_err(|e| ProxyError::CertMintError(format!("loading RSA key into rcgen: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &self.ca.cert, &self.ca.key_pair)
            .map_err(|e| ProxyError::CertMintError(e.to_string()))?;

        Ok(LeafCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}
