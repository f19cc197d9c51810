//! Upstream dialing, over plain TCP or TLS.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::crypto_provider;
use super::target::split_host_port;
use crate::ca::{CaError, load_cert_chain, load_private_key};

/// How sessions reach their upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Wrap the upstream connection in TLS.
    pub tls: bool,
    /// Verify the upstream certificate against the web PKI roots.
    pub verify: bool,
    /// Client certificate chain presented to the upstream.
    pub client_cert: Option<PathBuf>,
    /// Private key for `client_cert`.
    pub client_key: Option<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            tls: true,
            verify: false,
            client_cert: None,
            client_key: None,
        }
    }
}

/// Dials upstream targets.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Option<Duration>,
}

impl UpstreamConnector {
    /// A connector that dials plain TCP.
    pub fn plain() -> Self {
        Self {
            tls: None,
            connect_timeout: None,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        if !config.tls {
            return Ok(Self::plain());
        }

        let provider = crypto_provider();
        let algorithms = provider.signature_verification_algorithms;
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(UpstreamError::Tls)?;

        let builder = if config.verify {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(root_store)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier { algorithms }))
        };

        let client_config = match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_cert_chain(cert)?, load_private_key(key)?)
                .map_err(UpstreamError::Tls)?,
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            tls: Some(Arc::new(client_config)),
            connect_timeout: None,
        })
    }

    /// Bounds the whole dial, TLS handshake included.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connects to `target` (`host:port`).
    pub async fn connect(&self, target: &str) -> Result<UpstreamStream, UpstreamError> {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.dial(target))
                .await
                .map_err(|_| UpstreamError::Timeout(target.to_string()))?,
            None => self.dial(target).await,
        }
    }

    async fn dial(&self, target: &str) -> Result<UpstreamStream, UpstreamError> {
        let (host, _) =
            split_host_port(target).ok_or_else(|| UpstreamError::InvalidTarget(target.to_string()))?;

        debug!("connecting to upstream {}", target);
        let tcp_stream = TcpStream::connect(target)
            .await
            .map_err(UpstreamError::Connect)?;

        let Some(client_config) = &self.tls else {
            return Ok(UpstreamStream::Plain(tcp_stream));
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| UpstreamError::InvalidServerName(host.to_string()))?;

        let connector = TlsConnector::from(Arc::clone(client_config));
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(UpstreamError::TlsHandshake)?;

        debug!("upstream TLS connection established to {}", target);

        Ok(UpstreamStream::Tls(Box::new(tls_stream)))
    }
}

/// An established upstream connection.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Accepts any upstream certificate while still checking handshake
/// signatures, so the peer must hold the key for whatever it presents.
#[derive(Debug)]
struct NoVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] io::Error),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),
    #[error("invalid upstream server name: {0}")]
    InvalidServerName(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("TLS configuration error: {0}")]
    Tls(#[source] rustls::Error),
    #[error("client credentials: {0}")]
    Credentials(#[from] CaError),
}
