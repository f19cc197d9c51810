//! Interception listener.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::inject::InjectListener;
use super::session::{Session, SessionSummary};
use super::tap::{NoopTap, Tap};
use super::target::TargetPolicy;
use super::tls::{CertificateSelector, TlsAcceptor, log_peer_certificates};
use super::upstream::{UpstreamConnector, UpstreamError};
use crate::config::ProxyConfig;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared state for the proxy server.
pub struct ProxyState {
    acceptor: TlsAcceptor,
    connector: UpstreamConnector,
    /// Server name used when the client sends none.
    fallback: String,
    target: Option<String>,
    /// Bind address for per-session injection listeners, if enabled.
    inject_bind: Option<IpAddr>,
    tap: Arc<dyn Tap>,
    idle_timeout: Option<Duration>,
}

impl ProxyState {
    /// Creates a state that mirrors the server name, without injection
    /// and with a silent tap.
    pub fn new(
        acceptor: TlsAcceptor,
        connector: UpstreamConnector,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            acceptor,
            connector,
            fallback: fallback.into(),
            target: None,
            inject_bind: None,
            tap: Arc::new(NoopTap),
            idle_timeout: None,
        }
    }

    /// Builds the state described by `config`, answering handshakes
    /// through `selector`.
    pub fn from_config(
        config: &ProxyConfig,
        selector: Arc<dyn CertificateSelector>,
    ) -> Result<Self, SetupError> {
        let acceptor =
            TlsAcceptor::new(selector)?.with_handshake_timeout(config.timeouts.handshake());
        let connector = UpstreamConnector::from_config(&config.upstream)?
            .with_connect_timeout(config.timeouts.connect());

        Ok(Self::new(acceptor, connector, config.fallback.clone())
            .with_target(config.target.clone())
            .with_injection(config.inject.enabled.then_some(config.inject.bind))
            .with_tap(config.tap.build())
            .with_idle_timeout(config.timeouts.idle()))
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_injection(mut self, bind: Option<IpAddr>) -> Self {
        self.inject_bind = bind;
        self
    }

    pub fn with_tap(mut self, tap: Arc<dyn Tap>) -> Self {
        self.tap = tap;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// The effective server name for a handshake that offered `sni`.
    fn server_name(&self, sni: Option<&str>) -> String {
        match sni {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.fallback.clone(),
        }
    }
}

/// The interception server.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    listener: TcpListener,
    policy: Arc<TargetPolicy>,
}

impl ProxyServer {
    /// Binds the listener. Mirror mode dials the port actually bound, so
    /// binding port 0 mirrors onto the ephemeral port.
    pub async fn bind(addr: SocketAddr, state: Arc<ProxyState>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let policy = TargetPolicy::new(state.target.clone(), local_addr.port());
        info!("listening on {} ({:?})", local_addr, policy);

        Ok(Self {
            state,
            listener,
            policy: Arc::new(policy),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn target_policy(&self) -> &TargetPolicy {
        &self.policy
    }

    /// Accepts connections forever, one session task each.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            debug!("accepted connection from {}", peer);

            let state = Arc::clone(&self.state);
            let policy = Arc::clone(&self.policy);
            tokio::spawn(async move {
                match handle_connection(stream, peer, state, policy).await {
                    Ok(summary) => debug!("session {} finished: {:?}", peer, summary),
                    Err(e) => warn!("connection from {} failed: {}", peer, e),
                }
            });
        }
    }
}

/// Terminates TLS, dials upstream and relays until the session ends.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ProxyState>,
    policy: Arc<TargetPolicy>,
) -> Result<SessionSummary, ConnectionError> {
    let (tls_stream, sni) = state
        .acceptor
        .accept(stream, peer)
        .await
        .map_err(ConnectionError::TlsHandshake)?;
    log_peer_certificates(&tls_stream);

    let server_name = state.server_name(sni.as_deref());
    let target = policy.resolve(&server_name);
    debug!("{} ({}) -> upstream {}", peer, server_name, target);

    let upstream = state
        .connector
        .connect(&target)
        .await
        .map_err(|source| ConnectionError::Upstream {
            target: target.clone(),
            source,
        })?;

    let mut session = Session::new(peer, tls_stream, upstream)
        .with_tap(Arc::clone(&state.tap))
        .with_idle_timeout(state.idle_timeout);
    if let Some(bind) = state.inject_bind {
        match InjectListener::bind(bind).await {
            Ok(injector) => {
                info!("inject at {} for {}", injector.local_addr(), peer);
                session = session.with_injector(injector);
            }
            Err(e) => warn!("no injection listener for {}: {}", peer, e),
        }
    }

    let summary = session.run().await;
    info!(
        "{} closed: {} bytes up, {} bytes down, {} injected",
        peer, summary.client_to_upstream, summary.upstream_to_client, summary.injected
    );
    Ok(summary)
}

/// Failure to build a [`ProxyState`].
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("TLS server configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("upstream {target}: {source}")]
    Upstream {
        target: String,
        #[source]
        source: UpstreamError,
    },
}
