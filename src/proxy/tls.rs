//! TLS termination and per-handshake certificate selection.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info};

use super::crypto_provider;
use crate::ca::{CaError, CaResult, LeafIssuer, load_cert_chain, load_private_key};

/// Picks the certificate for one handshake from the negotiated server name
/// (if the client sent one) and the remote address.
pub trait CertificateSelector: Send + Sync {
    fn select(&self, server_name: Option<&str>, remote: SocketAddr)
    -> CaResult<Arc<CertifiedKey>>;
}

/// Forges a leaf for the requested name, or for the fallback name when the
/// client sent no SNI.
pub struct HandshakeGate {
    issuer: Arc<LeafIssuer>,
    fallback: String,
}

impl HandshakeGate {
    pub fn new(issuer: Arc<LeafIssuer>, fallback: impl Into<String>) -> Self {
        Self {
            issuer,
            fallback: fallback.into(),
        }
    }

    /// The hostname a handshake is answered for.
    pub fn hostname<'a>(&'a self, server_name: Option<&'a str>) -> &'a str {
        match server_name {
            Some(name) if !name.is_empty() => name,
            _ => &self.fallback,
        }
    }

    pub fn issuer(&self) -> &Arc<LeafIssuer> {
        &self.issuer
    }
}

impl CertificateSelector for HandshakeGate {
    fn select(
        &self,
        server_name: Option<&str>,
        remote: SocketAddr,
    ) -> CaResult<Arc<CertifiedKey>> {
        let hostname = self.hostname(server_name);
        info!("{} -> {}", remote, hostname);
        Ok(self.issuer.issue(hostname)?.certified_key())
    }
}

/// Answers every handshake with one operator-supplied certificate.
pub struct StaticCertificate {
    certified: Arc<CertifiedKey>,
}

impl StaticCertificate {
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: &PrivateKeyDer<'static>,
    ) -> CaResult<Self> {
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(key).map_err(CaError::SigningKey)?;
        Ok(Self {
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    pub fn load(cert: &Path, key: &Path) -> CaResult<Self> {
        Self::new(load_cert_chain(cert)?, &load_private_key(key)?)
    }
}

impl CertificateSelector for StaticCertificate {
    fn select(
        &self,
        server_name: Option<&str>,
        remote: SocketAddr,
    ) -> CaResult<Arc<CertifiedKey>> {
        info!("{} -> {} (static certificate)", remote, server_name.unwrap_or("-"));
        Ok(Arc::clone(&self.certified))
    }
}

/// TLS acceptor that consults a [`CertificateSelector`] on every handshake.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
    selector: Arc<dyn CertificateSelector>,
    handshake_timeout: Option<Duration>,
}

impl TlsAcceptor {
    /// Builds a server config that requests, but never requires or
    /// verifies, a client certificate.
    pub fn new(selector: Arc<dyn CertificateSelector>) -> Result<Self, rustls::Error> {
        let provider = crypto_provider();
        let client_verifier = Arc::new(RequestClientCert {
            algorithms: provider.signature_verification_algorithms,
        });
        // The remote address is filled in per connection by `accept`.
        let resolver = Arc::new(CertResolver {
            selector: Arc::clone(&selector),
            remote: SocketAddr::from(([0, 0, 0, 0], 0)),
        });
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(client_verifier)
            .with_cert_resolver(resolver);

        Ok(Self {
            config: Arc::new(config),
            selector,
            handshake_timeout: None,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Drives the handshake to completion.
    /// Returns the TLS stream and the SNI (if provided by client).
    pub async fn accept(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> io::Result<(TlsStream<TcpStream>, Option<String>)> {
        let mut config = ServerConfig::clone(&self.config);
        config.cert_resolver = Arc::new(CertResolver {
            selector: Arc::clone(&self.selector),
            remote,
        });
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let tls_stream = match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, acceptor.accept(stream))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??,
            None => acceptor.accept(stream).await?,
        };

        let sni = tls_stream.get_ref().1.server_name().map(|s| s.to_string());
        debug!("TLS handshake completed with {}, SNI: {:?}", remote, sni);

        Ok((tls_stream, sni))
    }
}

/// Logs any certificate the client presented, as PEM.
pub fn log_peer_certificates(stream: &TlsStream<TcpStream>) {
    let Some(certs) = stream.get_ref().1.peer_certificates() else {
        return;
    };
    for cert in certs {
        let subject = x509_parser::parse_x509_certificate(cert.as_ref())
            .map(|(_, parsed)| parsed.subject().to_string())
            .unwrap_or_else(|_| "<unparseable>".to_string());
        info!("peer: {}\n{}", subject, certificate_pem(cert));
    }
}

fn certificate_pem(der: &CertificateDer<'_>) -> String {
    let encoded = STANDARD.encode(der.as_ref());
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Bridges rustls certificate resolution to a [`CertificateSelector`].
struct CertResolver {
    selector: Arc<dyn CertificateSelector>,
    remote: SocketAddr,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();
        match self.selector.select(sni, self.remote) {
            Ok(key) => Some(key),
            Err(e) => {
                error!(
                    "failed to select certificate for {} ({:?}): {}",
                    self.remote, sni, e
                );
                None
            }
        }
    }
}

/// Offers client authentication and accepts whatever is presented.
#[derive(Debug)]
struct RequestClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for RequestClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
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
