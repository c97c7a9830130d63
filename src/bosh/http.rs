//! HTTP transport seam for the dispatcher.
//!
//! The session engine only needs "POST these bytes, give me status, headers
//! and body back" plus a cheap reachability probe. [`ReqwestHttpClient`] is
//! the production implementation; tests script their own.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use super::config::BoshConfig;
use super::error::TransportError;

/// One BOSH HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    /// Read timeout: the negotiated `wait` plus a safety margin.
    pub timeout: Duration,
}

/// A minimal HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Response headers (lowercase keys).
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Look up a response header by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k == &lower)
            .map(|(_, v)| v.as_str())
    }
}

/// Async HTTP client used by the dispatcher's workers.
pub trait HttpClient: Send + Sync + 'static {
    fn post(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;

    /// Preflight: open and drop one TCP connection so an unreachable
    /// connection manager fails `connect` fast.
    fn probe<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move { tcp_probe(host, port, timeout).await }.boxed()
    }
}

/// TCP connect with a timeout. The connection is dropped immediately.
pub async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<(), TransportError> {
    let target = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Err(_) => {
            error!(host, port, timeout_secs = timeout.as_secs(), "Preflight TCP connect timed out");
            Err(TransportError::Unreachable {
                host: host.to_string(),
                port,
                reason: format!("timed out after {}s", timeout.as_secs()),
            })
        }
        Ok(Err(e)) => {
            error!(host, port, error = %e, error_kind = ?e.kind(), "Preflight TCP connect failed");
            Err(TransportError::Unreachable {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })
        }
        Ok(Ok(_stream)) => {
            debug!(host, port, "Preflight TCP connect succeeded");
            Ok(())
        }
    }
}

/// Initialize rustls crypto provider (must be called once before TLS setup)
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: Only used when `dangerous_insecure_tls` is set.
/// Intended for development/testing against servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build the rustls client configuration for HTTPS connection managers,
/// trusting the system's native root certificates.
///
/// A host without any root certificates still gets a configuration so that
/// plain-HTTP endpoints keep working; HTTPS handshakes will then fail.
pub fn tls_client_config(dangerous_insecure_tls: bool) -> Result<ClientConfig, TransportError> {
    init_crypto_provider();

    if dangerous_insecure_tls {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(config);
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        warn!(
            "No system root certificates found. HTTPS connection managers will fail. \
            Ensure CA certificates are installed (e.g., ca-certificates package on Linux)."
        );
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| TransportError::Setup(format!("Failed to add cert: {}", e)))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Build a client honouring the TLS, proxy and connect-timeout settings.
    pub fn from_config(config: &BoshConfig) -> Result<Self, TransportError> {
        let tls = tls_client_config(config.dangerous_insecure_tls)?;
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(config.connect_timeout());
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| TransportError::Setup(format!("Invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let inner = builder
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn post(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        async move {
            let timeout = request.timeout;
            let mut builder = self.inner.post(&request.url).timeout(timeout);
            for (name, value) in &request.headers {
                builder = builder.header(*name, value.as_str());
            }

            let map_err = |e: reqwest::Error| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else {
                    TransportError::Request(e.to_string())
                }
            };

            let resp = builder.body(request.body).send().await.map_err(map_err)?;
            let status = resp.status().as_u16();
            let headers: Vec<(String, String)> = resp
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                })
                .collect();
            let body = resp.bytes().await.map_err(map_err)?.to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
        .boxed()
    }
}
