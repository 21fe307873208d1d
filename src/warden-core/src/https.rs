//! HTTPS transport with certificate pinning.
//!
//! Trust modes, selected from [`LicenseConfig`]:
//!
//! | `cert_file` | `cert_fingerprint` | validation |
//! |-------------|--------------------|------------|
//! | -           | -                  | Mozilla roots (webpki-roots) |
//! | -           | set                | **pin only**: leaf SHA-256 must match, no chain validation |
//! | set         | -                  | chain against the file's roots |
//! | set         | set                | chain against the file's roots, then the pin |
//!
//! `skip_verify` disables validation entirely and exists for testing.
//!
//! ## Endpoints
//!
//! All under `<server>/api/client`: `/auth/*`, `/subscription/*` and
//! `GET /releases/latest`.

use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::config::LicenseConfig;
use crate::error::LicenseError;
use crate::transport::{data_object, decode_envelope, LicenseTransport};

/// Normalize a certificate fingerprint for comparison.
///
/// Accepts `SHA256:AA:BB:...`, `aa:bb:...` and bare hex.
#[must_use]
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    let upper = fingerprint.trim().to_uppercase();
    upper
        .strip_prefix("SHA256:")
        .unwrap_or(&upper)
        .replace(':', "")
        .to_lowercase()
}

/// Format a DER certificate's SHA-256 as `SHA256:AA:BB:...`.
#[must_use]
pub fn format_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let pairs: Vec<String> = digest.iter().map(|b| format!("{b:02X}")).collect();
    format!("SHA256:{}", pairs.join(":"))
}

/// Fingerprint of the first certificate in a PEM file.
///
/// # Errors
///
/// `Config` if the file cannot be read or holds no certificate.
pub fn certificate_fingerprint_from_file(path: &Path) -> Result<String, LicenseError> {
    let cert = CertificateDer::pem_file_iter(path)
        .map_err(|e| LicenseError::config(format!("read {}: {e}", path.display())))?
        .next()
        .ok_or_else(|| LicenseError::config(format!("no certificate in {}", path.display())))?
        .map_err(|e| LicenseError::config(format!("parse {}: {e}", path.display())))?;
    Ok(format_fingerprint(cert.as_ref()))
}

/// Fingerprint of the leaf certificate presented by `host:port`.
///
/// Blocking. The chain is not validated.
///
/// # Errors
///
/// `NetworkFailure` if the connection or handshake fails.
pub fn server_certificate_fingerprint(host: &str, port: u16) -> Result<String, LicenseError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(PinnedVerifier::new(None, None, provider.clone()));
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| LicenseError::config(format!("TLS config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    let name = ServerName::try_from(host.to_string())
        .map_err(|e| LicenseError::config(format!("invalid host {host}: {e}")))?;
    let mut conn = ClientConnection::new(Arc::new(config), name)
        .map_err(|e| LicenseError::network(e.to_string()))?;
    let mut sock = TcpStream::connect((host, port))
        .map_err(|e| LicenseError::network(format!("connect {host}:{port}: {e}")))?;
    sock.set_read_timeout(Some(Duration::from_secs(10)))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut sock)
            .map_err(|e| LicenseError::network(format!("handshake: {e}")))?;
    }

    let leaf = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| LicenseError::network("server presented no certificate"))?;
    Ok(format_fingerprint(leaf.as_ref()))
}

/// Certificate verifier that optionally chains to roots and optionally pins the leaf.
#[derive(Debug)]
struct PinnedVerifier {
    chain: Option<Arc<WebPkiServerVerifier>>,
    pin: Option<String>,
    provider: Arc<CryptoProvider>,
    last_mismatch: Mutex<Option<String>>,
}

impl PinnedVerifier {
    fn new(
        chain: Option<Arc<WebPkiServerVerifier>>,
        pin: Option<String>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            chain,
            pin,
            provider,
            last_mismatch: Mutex::new(None),
        }
    }

    fn take_mismatch(&self) -> Option<String> {
        self.last_mismatch.lock().ok().and_then(|mut m| m.take())
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(chain) = &self.chain {
            chain.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        }
        if let Some(pin) = &self.pin {
            let actual = hex::encode(Sha256::digest(end_entity.as_ref()));
            if &actual != pin {
                warn!(expected = %pin, actual = %actual, "HTTPS: certificate pin mismatch");
                if let Ok(mut slot) = self.last_mismatch.lock() {
                    *slot = Some(actual);
                }
                return Err(rustls::Error::General("certificate pin mismatch".into()));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// HTTPS transport for the license server.
pub struct HttpsClient {
    client: Client,
    /// `<server>/api/client`
    api_base: String,
    max_retries: u32,
    pinned: Option<Arc<PinnedVerifier>>,
}

impl HttpsClient {
    /// Build a client from the TLS and timeout settings in `config`.
    ///
    /// # Errors
    ///
    /// `Config` if the certificate file cannot be loaded or the client cannot be built.
    pub fn new(config: &LicenseConfig) -> Result<Self, LicenseError> {
        let (tls, pinned) = build_tls_config(config)?;

        let client = ClientBuilder::new()
            .use_preconfigured_tls(tls)
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("Warden/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LicenseError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base(),
            max_retries: config.max_retries,
            pinned,
        })
    }

    /// Base URL for API calls.
    #[must_use]
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn map_send_error(&self, url: &str, e: &reqwest::Error) -> LicenseError {
        if let Some(actual) = self.pinned.as_ref().and_then(|p| p.take_mismatch()) {
            let expected = self
                .pinned
                .as_ref()
                .and_then(|p| p.pin.clone())
                .unwrap_or_default();
            return LicenseError::CertificatePinningMismatch { expected, actual };
        }
        warn!(url = %url, error = %e, "HTTPS request failed");
        LicenseError::network(format!("Request to {url} failed: {e}"))
    }

    async fn read_body(&self, url: &str, response: reqwest::Response) -> Result<Value, LicenseError> {
        let status = response.status();
        debug!(url = %url, status = %status, "HTTPS: Response received");
        let body = response
            .bytes()
            .await
            .map_err(|e| LicenseError::network(format!("read body from {url}: {e}")))?;
        match decode_envelope(&body) {
            Err(LicenseError::InvalidResponse { .. }) if status.is_server_error() => Err(
                LicenseError::network(format!("HTTP {status} from {url}")),
            ),
            other => other,
        }
    }

    async fn with_retries<F, Fut>(&self, url: &str, attempt: F) -> Result<Value, LicenseError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Value, LicenseError>>,
    {
        let mut tries = 0u32;
        loop {
            match attempt().await {
                Err(e) if e.is_retryable() && tries < self.max_retries => {
                    tries += 1;
                    debug!(url = %url, attempt = tries, "HTTPS: retrying after network failure");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(tries))).await;
                },
                other => return other,
            }
        }
    }
}

#[async_trait]
impl LicenseTransport for HttpsClient {
    #[instrument(skip(self, body))]
    async fn post(&self, endpoint: &str, body: Value) -> Result<Map<String, Value>, LicenseError> {
        let target = format!("{}{}", self.api_base, endpoint);
        let (url, body) = (target.as_str(), &body);
        let data = self
            .with_retries(url, || async move {
                let response = self
                    .client
                    .post(url)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| self.map_send_error(url, &e))?;
                self.read_body(url, response).await
            })
            .await?;
        data_object(data)
    }

    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Value, LicenseError> {
        let target = format!("{}{}", self.api_base, path);
        let url = target.as_str();
        self.with_retries(url, || async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| self.map_send_error(url, &e))?;
            self.read_body(url, response).await
        })
        .await
    }
}

impl std::fmt::Debug for HttpsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsClient")
            .field("api_base", &self.api_base)
            .field("pinned", &self.pinned.is_some())
            .finish_non_exhaustive()
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore, LicenseError> {
    let mut roots = RootCertStore::empty();
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| LicenseError::config(format!("read {}: {e}", path.display())))?;
    for cert in certs {
        let cert = cert.map_err(|e| LicenseError::config(format!("parse {}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| LicenseError::config(format!("add root: {e}")))?;
    }
    if roots.is_empty() {
        return Err(LicenseError::config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn build_tls_config(
    config: &LicenseConfig,
) -> Result<(ClientConfig, Option<Arc<PinnedVerifier>>), LicenseError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| LicenseError::config(format!("TLS config: {e}")))?;

    let pin = config
        .cert_fingerprint
        .as_deref()
        .map(normalize_fingerprint)
        .filter(|p| !p.is_empty());

    if config.skip_verify {
        warn!("HTTPS: certificate verification disabled");
        let verifier = Arc::new(PinnedVerifier::new(None, None, provider));
        let tls = builder
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        return Ok((tls, None));
    }

    let chain = match &config.cert_file {
        Some(path) => {
            let roots = load_roots(path)?;
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| LicenseError::config(format!("certificate verifier: {e}")))?;
            Some(verifier)
        },
        None => None,
    };

    if chain.is_none() && pin.is_none() {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok((builder.with_root_certificates(roots).with_no_client_auth(), None));
    }

    info!(
        pinned = pin.is_some(),
        custom_roots = chain.is_some(),
        "HTTPS: using pinned certificate verification"
    );
    let verifier = Arc::new(PinnedVerifier::new(chain, pin, provider));
    let tls = builder
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
        .with_no_client_auth();
    Ok((tls, Some(verifier)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = LicenseConfig::new("https://license.example.com", "app");
        assert!(HttpsClient::new(&config).is_ok());
    }

    #[test]
    fn test_client_with_cert_pin() {
        let config = LicenseConfig::new("https://license.example.com", "app")
            .with_cert_fingerprint(format!("SHA256:{}", ["AB"; 32].join(":")));
        let client = HttpsClient::new(&config).unwrap();
        let pinned = client.pinned.as_ref().unwrap();
        assert_eq!(pinned.pin.as_deref(), Some("ab".repeat(32).as_str()));
        assert!(pinned.chain.is_none());
    }

    #[test]
    fn test_missing_cert_file_rejected() {
        let mut config = LicenseConfig::new("https://license.example.com", "app");
        config.cert_file = Some("/nonexistent/ca.pem".into());
        assert!(HttpsClient::new(&config).is_err());
    }

    #[test]
    fn test_url_normalization() {
        let client =
            HttpsClient::new(&LicenseConfig::new("https://license.example.com/", "app")).unwrap();
        assert_eq!(client.api_base(), "https://license.example.com/api/client");
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("SHA256:AB:cd:01"), "abcd01");
        assert_eq!(normalize_fingerprint("sha256:ABCD"), "abcd");
        assert_eq!(normalize_fingerprint("ab:CD"), "abcd");
    }

    #[test]
    fn test_format_fingerprint() {
        let fp = format_fingerprint(b"certificate");
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp.split(':').count(), 33);
        assert_eq!(
            normalize_fingerprint(&fp),
            hex::encode(Sha256::digest(b"certificate"))
        );
    }

    #[test]
    fn test_pin_mismatch_recorded() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = PinnedVerifier::new(None, Some("00".repeat(32)), provider);
        let cert = CertificateDer::from(b"not really a certificate".to_vec());
        let name = ServerName::try_from("license.example.com").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());
        assert_eq!(
            verifier.take_mismatch(),
            Some(hex::encode(Sha256::digest(b"not really a certificate")))
        );
        assert_eq!(verifier.take_mismatch(), None);
    }

    #[test]
    fn test_pin_only_accepts_matching_leaf() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let der = b"leaf".to_vec();
        let pin = normalize_fingerprint(&format_fingerprint(&der));
        let verifier = PinnedVerifier::new(None, Some(pin), provider);
        let cert = CertificateDer::from(der);
        let name = ServerName::try_from("license.example.com").unwrap();
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());
    }
}
