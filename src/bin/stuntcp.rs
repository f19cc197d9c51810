use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stun::ca::{LeafIssuer, RootAuthority};
use stun::proxy::{CertificateSelector, HandshakeGate, ProxyServer, ProxyState, StaticCertificate};
use stun::{ProxyConfig, TapKind};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// TLS-intercepting relay.
///
/// Terminates client TLS with certificates forged per server name, relays
/// the plaintext to an upstream and logs it. Flags override values from
/// the configuration file.
#[derive(Parser, Debug)]
#[command(name = "stuntcp")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Fixed upstream host:port.
    #[arg(short = 't', long)]
    target: Option<String>,

    /// Do not derive the upstream from the client's server name.
    #[arg(long)]
    no_mirror: bool,

    /// Hostname used when the client sends no server name.
    #[arg(long)]
    fallback: Option<String>,

    /// Root certificate PEM file.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Root private key PEM file.
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Serve this certificate chain instead of forging one per name.
    #[arg(long, requires = "server_key")]
    server_cert: Option<PathBuf>,

    /// Private key for --server-cert.
    #[arg(long, requires = "server_cert")]
    server_key: Option<PathBuf>,

    /// Dial the upstream over plain TCP.
    #[arg(long)]
    no_upstream_tls: bool,

    /// Verify the upstream certificate.
    #[arg(long, conflicts_with = "no_upstream_tls")]
    verify_upstream: bool,

    /// Client certificate presented to the upstream.
    #[arg(long, requires = "client_key")]
    client_cert: Option<PathBuf>,

    /// Private key for --client-cert.
    #[arg(long, requires = "client_cert")]
    client_key: Option<PathBuf>,

    /// Do not open injection listeners.
    #[arg(long)]
    no_inject: bool,

    /// Address injection listeners bind to.
    #[arg(long)]
    inject_bind: Option<IpAddr>,

    /// How relayed bytes are logged.
    #[arg(long, value_enum)]
    tap: Option<TapKind>,

    /// End a session after this many seconds without traffic in one direction.
    #[arg(long)]
    idle_timeout: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.target.is_some() {
            config.target = self.target;
        }
        if self.no_mirror {
            config.mirror = false;
        }
        if let Some(fallback) = self.fallback {
            config.fallback = fallback;
        }
        if let Some(cert) = self.ca_cert {
            config.ca.cert = cert;
        }
        if let Some(key) = self.ca_key {
            config.ca.key = key;
        }
        if self.server_cert.is_some() {
            config.server_cert = self.server_cert;
            config.server_key = self.server_key;
        }
        if self.no_upstream_tls {
            config.upstream.tls = false;
        }
        if self.verify_upstream {
            config.upstream.verify = true;
        }
        if self.client_cert.is_some() {
            config.upstream.client_cert = self.client_cert;
            config.upstream.client_key = self.client_key;
        }
        if self.no_inject {
            config.inject.enabled = false;
        }
        if let Some(bind) = self.inject_bind {
            config.inject.bind = bind;
        }
        if let Some(tap) = self.tap {
            config.tap = tap;
        }
        if self.idle_timeout.is_some() {
            config.timeouts.idle_secs = self.idle_timeout;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut args = Args::parse();

    let mut config = match args.config.take() {
        Some(path) => ProxyConfig::load(&path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => ProxyConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let selector: Arc<dyn CertificateSelector> = match config.static_certificate() {
        Some((cert, key)) => {
            info!("serving static certificate {:?}", cert);
            Arc::new(
                StaticCertificate::load(cert, key)
                    .context("failed to load static server certificate")?,
            )
        }
        None => {
            let root = RootAuthority::bootstrap(&config.ca)
                .context("failed to set up root certificate authority")?;
            info!("root CA valid until {}", root.validity().not_after);
            // Operators install this PEM as a trusted root.
            print!("{}", root.cert_pem());
            let issuer = LeafIssuer::new(Arc::new(root));
            Arc::new(HandshakeGate::new(
                Arc::new(issuer),
                config.fallback.clone(),
            ))
        }
    };

    let state = ProxyState::from_config(&config, selector).context("failed to set up proxy")?;
    let server = ProxyServer::bind(config.listen, Arc::new(state))
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    tokio::select! {
        _ = server.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupted, shutting down");
        }
    }

    Ok(())
}
