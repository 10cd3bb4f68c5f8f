//! # TLS Upgrade
//!
//! Certificate loading and rustls configuration for the optional encryption
//! step that follows the plain handshake.
//!
//! The acceptor always presents a certificate. It may additionally require a
//! client certificate signed by a configured CA and, when revocation checking
//! is on, reject client certificates listed in a certificate revocation list.
//! The initiator verifies the acceptor against a CA bundle (or the platform
//! roots), a pinned SHA-256 fingerprint, or not at all in insecure mode. With
//! revocation lists configured it also rejects a revoked acceptor certificate.
//!
//! ## Responsibilities
//! - Load PEM certificates, keys and CRLs
//! - Build `rustls` server and client configurations
//! - Generate self-signed material for development

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::server::{AllowAnyAuthenticatedClient, UnparsedCertRevocationList};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};
use rustls::{CertificateError, ServerName};
use rustls_pemfile::{certs, crls, pkcs8_private_keys};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::config::TlsSettings;
use crate::error::{ProtocolError, Result};

fn open_pem(path: &str, what: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open {what} file '{path}': {e}")))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let mut reader = open_pem(path, "certificate")?;
    let chain = certs(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    if chain.is_empty() {
        return Err(ProtocolError::TlsError(format!(
            "No certificates found in '{path}'"
        )));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let mut reader = open_pem(path, "key")?;
    let mut keys = pkcs8_private_keys(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse PKCS8 private key".into()))?;
    if keys.is_empty() {
        return Err(ProtocolError::TlsError("No private keys found".into()));
    }
    Ok(PrivateKey(keys.swap_remove(0)))
}

fn load_root_store(path: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(&cert)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to add CA cert: {e}")))?;
    }
    Ok(store)
}

fn load_revocation_lists(paths: &[String]) -> Result<Vec<UnparsedCertRevocationList>> {
    let mut lists = Vec::new();
    for path in paths {
        let mut reader = open_pem(path, "revocation list")?;
        let parsed = crls(&mut reader)
            .map_err(|_| ProtocolError::TlsError(format!("Failed to parse CRL '{path}'")))?;
        lists.extend(parsed.into_iter().map(UnparsedCertRevocationList));
    }
    Ok(lists)
}

fn parse_revocation_lists(paths: &[String]) -> Result<Vec<webpki::OwnedCertRevocationList>> {
    load_revocation_lists(paths)?
        .iter()
        .map(|list| {
            list.parse()
                .map_err(|e| ProtocolError::TlsError(format!("Invalid revocation list: {e:?}")))
        })
        .collect()
}

fn native_roots() -> Result<Vec<Certificate>> {
    let native_certs = rustls_native_certs::load_native_certs()
        .map_err(|e| ProtocolError::TlsError(format!("Failed to load native certs: {e}")))?;
    Ok(native_certs
        .into_iter()
        .map(|cert| Certificate(cert.0))
        .collect())
}

/// SHA-256 fingerprint of a DER certificate, as used for pinning
pub fn certificate_fingerprint(cert: &Certificate) -> Vec<u8> {
    Sha256::digest(&cert.0).to_vec()
}

/// Acceptor-side TLS configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
    /// CA bundle for client certificates; set means client certificates are required
    client_ca_path: Option<String>,
    /// CRLs checked against client certificates
    crl_paths: Vec<String>,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
            client_ca_path: None,
            crl_paths: Vec::new(),
        }
    }

    /// Build from the `[tls]` section; `None` when no certificate is configured
    pub fn from_settings(settings: &TlsSettings) -> Option<Self> {
        let (cert, key) = (settings.cert_path.as_ref()?, settings.key_path.as_ref()?);
        let mut config = Self::new(cert, key);
        if let Some(ca) = &settings.client_ca_path {
            config = config.with_client_auth(ca.clone());
            if settings.check_certificate_revocation {
                config = config.with_revocation_lists(settings.crl_paths.clone());
            }
        }
        Some(config)
    }

    /// Require client certificates signed by the CA bundle at `client_ca_path`
    pub fn with_client_auth<S: Into<String>>(mut self, client_ca_path: S) -> Self {
        self.client_ca_path = Some(client_ca_path.into());
        self
    }

    /// Reject client certificates revoked by any of these PEM CRLs
    pub fn with_revocation_lists(mut self, crl_paths: Vec<String>) -> Self {
        self.crl_paths = crl_paths;
        self
    }

    pub fn requires_client_auth(&self) -> bool {
        self.client_ca_path.is_some()
    }

    pub fn checks_revocation(&self) -> bool {
        self.client_ca_path.is_some() && !self.crl_paths.is_empty()
    }

    /// Generate a self-signed certificate for `localhost` for development and tests
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(Self::new(cert_path, key_path))
    }

    /// Load certificate material and build the rustls configuration
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;
        let builder = ServerConfig::builder().with_safe_defaults();

        let config = match &self.client_ca_path {
            Some(ca_path) => {
                let roots = load_root_store(ca_path)?;
                let mut verifier = AllowAnyAuthenticatedClient::new(roots);
                if !self.crl_paths.is_empty() {
                    let lists = load_revocation_lists(&self.crl_paths)?;
                    debug!(count = lists.len(), "Loaded certificate revocation lists");
                    verifier = verifier.with_crls(lists).map_err(|e| {
                        ProtocolError::TlsError(format!("Invalid revocation list: {e:?}"))
                    })?;
                }
                debug!("Client certificates required");
                builder
                    .with_client_cert_verifier(Arc::new(verifier))
                    .with_single_cert(cert_chain, private_key)
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(cert_chain, private_key),
        };

        config.map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

struct PinnedCertVerifier {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        if certificate_fingerprint(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Signature algorithms accepted on certificates and CRLs during revocation checks
static SUPPORTED_SIG_ALGS: &[&webpki::SignatureAlgorithm] = &[
    &webpki::ECDSA_P256_SHA256,
    &webpki::ECDSA_P256_SHA384,
    &webpki::ECDSA_P384_SHA256,
    &webpki::ECDSA_P384_SHA384,
    &webpki::ED25519,
    &webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
    &webpki::RSA_PSS_2048_8192_SHA384_LEGACY_KEY,
    &webpki::RSA_PSS_2048_8192_SHA512_LEGACY_KEY,
    &webpki::RSA_PKCS1_2048_8192_SHA256,
    &webpki::RSA_PKCS1_2048_8192_SHA384,
    &webpki::RSA_PKCS1_2048_8192_SHA512,
    &webpki::RSA_PKCS1_3072_8192_SHA384,
];

/// Standard chain and name verification, then a revocation check of the
/// chain against the configured CRLs
struct RevocationCheckingVerifier {
    inner: WebPkiVerifier,
    anchors: Vec<Certificate>,
    crls: Vec<webpki::OwnedCertRevocationList>,
}

impl ServerCertVerifier for RevocationCheckingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        )?;

        let cert = webpki::EndEntityCert::try_from(end_entity.0.as_slice())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        // Anchors that webpki cannot parse were already skipped by the root store
        let anchors: Vec<_> = self
            .anchors
            .iter()
            .filter_map(|anchor| webpki::TrustAnchor::try_from_cert_der(&anchor.0).ok())
            .collect();
        let chain: Vec<&[u8]> = intermediates.iter().map(|c| c.0.as_slice()).collect();
        let crls: Vec<&dyn webpki::CertRevocationList> = self
            .crls
            .iter()
            .map(|crl| crl as &dyn webpki::CertRevocationList)
            .collect();
        let time =
            webpki::Time::try_from(now).map_err(|_| rustls::Error::FailedToGetCurrentTime)?;

        cert.verify_for_usage(
            SUPPORTED_SIG_ALGS,
            &anchors,
            &chain,
            time,
            webpki::KeyUsage::server_auth(),
            &crls,
        )
        .map_err(|e| match e {
            webpki::Error::CertRevoked => {
                warn!("Server certificate is revoked");
                rustls::Error::InvalidCertificate(CertificateError::Revoked)
            }
            other => rustls::Error::General(format!("Revocation check failed: {other}")),
        })?;

        Ok(verified)
    }
}

/// Initiator-side TLS configuration
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Name to verify; the peer IP is used when unset
    server_name: Option<String>,
    insecure: bool,
    pinned_cert_hash: Option<Vec<u8>>,
    /// CA bundle replacing the platform roots
    root_ca_path: Option<String>,
    client_cert_path: Option<String>,
    client_key_path: Option<String>,
    /// CRLs checked against the acceptor's certificate chain
    crl_paths: Vec<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[tls]` section plus the connector's server name
    pub fn from_settings(settings: &TlsSettings, server_name: Option<String>) -> Result<Self> {
        let mut config = Self {
            server_name,
            root_ca_path: settings.client_ca_path.clone(),
            ..Self::default()
        };
        if let (Some(cert), Some(key)) = (&settings.cert_path, &settings.key_path) {
            config = config.with_client_certificate(cert.clone(), key.clone());
        }
        if settings.check_certificate_revocation {
            config = config.with_revocation_lists(settings.crl_paths.clone());
        }
        if let Some(hash) = settings.pinned_fingerprint()? {
            config = config.with_pinned_cert_hash(hash);
        }
        if settings.insecure {
            config = config.insecure();
        }
        Ok(config)
    }

    pub fn with_server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Trust only the CA certificates in this PEM bundle
    pub fn with_root_certificates<S: Into<String>>(mut self, ca_path: S) -> Self {
        self.root_ca_path = Some(ca_path.into());
        self
    }

    /// Present a client certificate when the acceptor asks for one
    pub fn with_client_certificate<S: Into<String>>(mut self, cert_path: S, key_path: S) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// Reject an acceptor whose certificate chain is revoked by any of these PEM CRLs.
    ///
    /// Has no effect with [`TlsClientConfig::insecure`] or a pinned hash.
    pub fn with_revocation_lists(mut self, crl_paths: Vec<String>) -> Self {
        self.crl_paths = crl_paths;
        self
    }

    pub fn checks_revocation(&self) -> bool {
        !self.crl_paths.is_empty() && !self.insecure && self.pinned_cert_hash.is_none()
    }

    /// Skip server certificate verification.
    ///
    /// # WARNING: Security Risk
    /// Only for development and testing, or together with
    /// [`TlsClientConfig::with_pinned_cert_hash`].
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Accept only a server certificate with this SHA-256 fingerprint
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                hash.len()
            );
        }
        self.pinned_cert_hash = Some(hash);
        self
    }

    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let verifier: Arc<dyn ServerCertVerifier> = if let Some(hash) = &self.pinned_cert_hash {
            Arc::new(PinnedCertVerifier {
                fingerprint: hash.clone(),
            })
        } else if self.insecure {
            Arc::new(AcceptAnyServerCert)
        } else {
            let anchors = match &self.root_ca_path {
                Some(ca_path) => load_certs(ca_path)?,
                None => native_roots()?,
            };
            let mut roots = RootCertStore::empty();
            let (added, skipped) = roots.add_parsable_certificates(&anchors);
            debug!(added, skipped, "Loaded trust anchors");
            if added == 0 {
                return Err(ProtocolError::TlsError("No usable trust anchors".into()));
            }
            let inner = WebPkiVerifier::new(roots, None);

            if self.crl_paths.is_empty() {
                Arc::new(inner)
            } else {
                let crls = parse_revocation_lists(&self.crl_paths)?;
                debug!(count = crls.len(), "Checking server certificate revocation");
                Arc::new(RevocationCheckingVerifier {
                    inner,
                    anchors,
                    crls,
                })
            }
        };

        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(verifier);

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
                .map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to set client certificate: {e}"))
                }),
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.load_client_config()?)))
    }

    /// Name to verify the acceptor against, falling back to its address
    pub fn server_name(&self, peer: IpAddr) -> Result<ServerName> {
        match &self.server_name {
            Some(name) => ServerName::try_from(name.as_str())
                .map_err(|_| ProtocolError::TlsError(format!("Invalid server name: {name}"))),
            None => Ok(ServerName::IpAddress(peer)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        let config = TlsServerConfig::generate_self_signed(&cert, &key).unwrap();
        assert!(!config.requires_client_auth());
        assert!(config.load_server_config().is_ok());

        let chain = load_certs(&cert.to_string_lossy()).unwrap();
        assert_eq!(certificate_fingerprint(&chain[0]).len(), 32);
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let config = TlsServerConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(
            config.load_server_config(),
            Err(ProtocolError::TlsError(_))
        ));
    }

    #[test]
    fn test_from_settings_wires_revocation_only_with_client_ca() {
        let mut settings = TlsSettings {
            cert_path: Some("cert.pem".into()),
            key_path: Some("key.pem".into()),
            check_certificate_revocation: true,
            crl_paths: vec!["revoked.pem".into()],
            ..TlsSettings::default()
        };
        let config = TlsServerConfig::from_settings(&settings).unwrap();
        assert!(!config.checks_revocation());

        settings.client_ca_path = Some("ca.pem".into());
        let config = TlsServerConfig::from_settings(&settings).unwrap();
        assert!(config.requires_client_auth());
        assert!(config.checks_revocation());

        settings.cert_path = None;
        assert!(TlsServerConfig::from_settings(&settings).is_none());
    }

    #[test]
    fn test_server_name_falls_back_to_ip() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            TlsClientConfig::new().server_name(ip).unwrap(),
            ServerName::IpAddress(ip)
        );
        assert!(TlsClientConfig::new()
            .with_server_name("localhost")
            .server_name(ip)
            .is_ok());
    }

    #[test]
    fn test_insecure_client_config_builds() {
        assert!(TlsClientConfig::new().insecure().load_client_config().is_ok());
    }

    #[test]
    fn test_client_from_settings_checks_server_revocation() {
        let mut settings = TlsSettings {
            client_ca_path: Some("ca.pem".into()),
            crl_paths: vec!["revoked.pem".into()],
            ..TlsSettings::default()
        };
        let config = TlsClientConfig::from_settings(&settings, None).unwrap();
        assert!(!config.checks_revocation());

        settings.check_certificate_revocation = true;
        let config = TlsClientConfig::from_settings(&settings, None).unwrap();
        assert!(config.checks_revocation());
        assert!(!config.clone().insecure().checks_revocation());
        assert!(!config.with_pinned_cert_hash(vec![0; 32]).checks_revocation());
    }

    #[test]
    fn test_client_config_with_missing_crl_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ca.pem");
        let key = dir.path().join("ca.key");
        TlsServerConfig::generate_self_signed(&cert, &key).unwrap();

        let anchored = TlsClientConfig::new().with_root_certificates(cert.to_string_lossy());
        assert!(anchored.load_client_config().is_ok());
        assert!(matches!(
            anchored
                .with_revocation_lists(vec!["/nonexistent/ca.crl".into()])
                .load_client_config(),
            Err(ProtocolError::TlsError(_))
        ));
    }
}
