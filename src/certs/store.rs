//! Certificate store - spoofed CA and per-host leaf issuance
//!
//! The CA keypair and certificate are generated once per process and
//! pushed into the OS trust store during construction. Leaves are minted
//! on first request for a host and memoized for the process lifetime;
//! a cached leaf is never regenerated or overwritten.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::version::{TLS12, TLS13};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::certs::trust::{TrustStore, TrustStoreError};

/// Downstream TLS protocol range for intercepted connections.
///
/// The downstream side is deliberately generous because diverted clients
/// may be legacy software. The original design admitted SSLv3 and
/// TLS 1.0/1.1; rustls implements TLS 1.2 and newer, so `Permissive` maps
/// to the widest range the backend offers. Upstream connections always
/// use modern defaults and are not affected by this knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownstreamTlsRange {
    /// Widest supported range (TLS 1.2 + 1.3).
    #[default]
    Permissive,
    /// TLS 1.3 only.
    Strict,
}

#[derive(Debug, Error)]
pub enum CertStoreError {
    #[error("failed to install CA into trust store: {0}")]
    TrustInstallFailed(#[from] TrustStoreError),

    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("TLS configuration failed: {0}")]
    TlsConfig(String),
}

/// An issued leaf: DER certificate, its private key, and a ready
/// server-side TLS config presenting it.
pub struct LeafCert {
    host: String,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    server_config: Arc<ServerConfig>,
}

impl LeafCert {
    /// Hostname the leaf was issued for (case-folded).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// DER-encoded certificate, signed by the store's CA.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// PKCS#8 DER private key.
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Server config presenting this leaf, ALPN pinned to HTTP/1.1.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl std::fmt::Debug for LeafCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCert")
            .field("host", &self.host)
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

/// Spoofed certificate authority with a memoizing leaf cache.
pub struct SpoofedCertStore {
    ca: Certificate,
    ca_der: Vec<u8>,
    range: DownstreamTlsRange,
    cache: Mutex<HashMap<String, Arc<LeafCert>>>,
}

impl SpoofedCertStore {
    /// Generate the CA (EC P-256, SHA-256/ECDSA, CA=true,
    /// keyCertSign|cRLSign, valid from one year ago to two years out) and
    /// install it into the platform trust store. Any pre-existing trusted
    /// root with the same subject is removed first so repeated starts
    /// stay idempotent.
    pub async fn new(
        authority_cn: &str,
        trust: &dyn TrustStore,
        range: DownstreamTlsRange,
    ) -> Result<Self, CertStoreError> {
        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CertStoreError::GenerationFailed(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(key_pair);
        params
            .distinguished_name
            .push(DnType::CommonName, authority_cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(365);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(730);
        params.serial_number = Some(generate_serial_number().into());

        let ca = Certificate::from_params(params)
            .map_err(|e| CertStoreError::GenerationFailed(e.to_string()))?;
        let ca_der = ca
            .serialize_der()
            .map_err(|e| CertStoreError::GenerationFailed(e.to_string()))?;

        // Remove-then-add keeps repeated process starts from piling up
        // stale roots under the same subject.
        trust.remove_by_subject(authority_cn).await?;
        trust.install(&ca_der).await?;

        info!(
            authority = %authority_cn,
            der_len = ca_der.len(),
            "CA generated and installed into trust store"
        );

        Ok(Self {
            ca,
            ca_der,
            range,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// DER-encoded CA certificate, for hosts that pin or re-export it.
    pub fn ca_cert_der(&self) -> &[u8] {
        &self.ca_der
    }

    /// PEM rendering of the CA certificate.
    pub fn ca_cert_pem(&self) -> Result<String, CertStoreError> {
        self.ca
            .serialize_pem()
            .map_err(|e| CertStoreError::GenerationFailed(e.to_string()))
    }

    /// Return the leaf for `host`, minting it on first request.
    ///
    /// Hostname comparison is Unicode case-folding. Generation is
    /// serialized under the cache lock so concurrent first requests for
    /// one host produce a single leaf.
    pub async fn leaf_for(&self, host: &str) -> Result<Arc<LeafCert>, CertStoreError> {
        let key = host.to_lowercase();

        let mut cache = self.cache.lock().await;
        if let Some(leaf) = cache.get(&key) {
            debug!(host = %key, "leaf cache hit");
            return Ok(Arc::clone(leaf));
        }

        debug!(host = %key, "minting leaf certificate");
        let leaf = Arc::new(self.issue_leaf(&key)?);
        cache.insert(key, Arc::clone(&leaf));
        Ok(leaf)
    }

    /// Number of leaves issued so far.
    pub async fn issued_count(&self) -> usize {
        self.cache.lock().await.len()
    }

    fn issue_leaf(&self, host: &str) -> Result<LeafCert, CertStoreError> {
        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CertStoreError::GenerationFailed(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(key_pair);
        params.distinguished_name.push(DnType::CommonName, host);
        params.subject_alt_names = vec![SanType::DnsName(host.to_string())];
        params.use_authority_key_identifier_extension = true;
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(365);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(730);
        params.serial_number = Some(generate_serial_number().into());

        let leaf = Certificate::from_params(params)
            .map_err(|e| CertStoreError::GenerationFailed(e.to_string()))?;

        let cert_der = leaf
            .serialize_der_with_signer(&self.ca)
            .map_err(|e| CertStoreError::GenerationFailed(e.to_string()))?;
        let key_der = leaf.serialize_private_key_der();

        let server_config = build_server_config(&cert_der, &key_der, self.range)?;

        Ok(LeafCert {
            host: host.to_string(),
            cert_der,
            key_der,
            server_config: Arc::new(server_config),
        })
    }
}

impl std::fmt::Debug for SpoofedCertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoofedCertStore")
            .field("ca_der_len", &self.ca_der.len())
            .field("range", &self.range)
            .finish()
    }
}

fn build_server_config(
    cert_der: &[u8],
    key_der: &[u8],
    range: DownstreamTlsRange,
) -> Result<ServerConfig, CertStoreError> {
    let versions: Vec<&'static rustls::SupportedProtocolVersion> = match range {
        DownstreamTlsRange::Permissive => vec![&TLS12, &TLS13],
        DownstreamTlsRange::Strict => vec![&TLS13],
    };

    let cert_chain = vec![CertificateDer::from(cert_der.to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.to_vec()));

    let mut config = ServerConfig::builder_with_protocol_versions(&versions)
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| CertStoreError::TlsConfig(e.to_string()))?;

    // HTTP/1.x only on the intercepted side.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Unique serial from crypto RNG plus timestamp.
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::trust::NoopTrustStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTrustStore {
        removes: AtomicUsize,
        installs: AtomicUsize,
    }

    impl RecordingTrustStore {
        fn new() -> Self {
            Self {
                removes: AtomicUsize::new(0),
                installs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TrustStore for RecordingTrustStore {
        async fn remove_by_subject(&self, _cn: &str) -> Result<(), TrustStoreError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn install(&self, der: &[u8]) -> Result<(), TrustStoreError> {
            assert!(!der.is_empty());
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTrustStore;

    #[async_trait]
    impl TrustStore for FailingTrustStore {
        async fn remove_by_subject(&self, _cn: &str) -> Result<(), TrustStoreError> {
            Ok(())
        }

        async fn install(&self, _der: &[u8]) -> Result<(), TrustStoreError> {
            Err(TrustStoreError::Rejected("denied by test".into()))
        }
    }

    #[tokio::test]
    async fn test_ca_installed_remove_then_add() {
        let trust = RecordingTrustStore::new();
        let store = SpoofedCertStore::new("TestAuthority", &trust, DownstreamTlsRange::default())
            .await
            .unwrap();

        assert_eq!(trust.removes.load(Ordering::SeqCst), 1);
        assert_eq!(trust.installs.load(Ordering::SeqCst), 1);
        assert!(!store.ca_cert_der().is_empty());
    }

    #[tokio::test]
    async fn test_install_failure_is_fatal() {
        let result =
            SpoofedCertStore::new("TestAuthority", &FailingTrustStore, DownstreamTlsRange::default())
                .await;
        assert!(matches!(result, Err(CertStoreError::TrustInstallFailed(_))));
    }

    #[tokio::test]
    async fn test_leaf_memoized_per_host() {
        let store =
            SpoofedCertStore::new("TestAuthority", &NoopTrustStore, DownstreamTlsRange::default())
                .await
                .unwrap();

        let first = store.leaf_for("a.test").await.unwrap();
        let second = store.leaf_for("a.test").await.unwrap();
        let other = store.leaf_for("b.test").await.unwrap();

        // Same host: same certificate bytes. Different host: different leaf.
        assert_eq!(first.cert_der(), second.cert_der());
        assert!(Arc::ptr_eq(&first, &second));
        assert_ne!(first.cert_der(), other.cert_der());
        assert_eq!(store.issued_count().await, 2);
    }

    #[tokio::test]
    async fn test_hostname_case_folding() {
        let store =
            SpoofedCertStore::new("TestAuthority", &NoopTrustStore, DownstreamTlsRange::default())
                .await
                .unwrap();

        let lower = store.leaf_for("example.test").await.unwrap();
        let upper = store.leaf_for("EXAMPLE.Test").await.unwrap();
        assert!(Arc::ptr_eq(&lower, &upper));
        assert_eq!(store.issued_count().await, 1);
    }

    #[tokio::test]
    async fn test_ca_pem_round_trip() {
        let store =
            SpoofedCertStore::new("TestAuthority", &NoopTrustStore, DownstreamTlsRange::default())
                .await
                .unwrap();
        let pem = store.ca_cert_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
