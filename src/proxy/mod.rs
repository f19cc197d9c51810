//! TLS-intercepting relay.
//!
//! The listener terminates client TLS with a certificate forged for the
//! negotiated server name, dials the chosen upstream and relays bytes both
//! ways. Each session can also expose an injection port that feeds extra
//! bytes to its upstream.

mod inject;
mod server;
mod session;
mod tap;
mod target;
mod tls;
mod upstream;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub use inject::InjectListener;
pub use server::{ConnectionError, ProxyServer, ProxyState, SetupError};
pub use session::{Direction, Session, SessionSummary};
pub use tap::{HexDumpTap, NoopTap, Tap, hex_dump};
pub use target::{TargetPolicy, split_host_port};
pub use tls::{
    CertificateSelector, HandshakeGate, StaticCertificate, TlsAcceptor, log_peer_certificates,
};
pub use upstream::{UpstreamConfig, UpstreamConnector, UpstreamError, UpstreamStream};

/// The crypto provider shared by every TLS config in the crate.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
