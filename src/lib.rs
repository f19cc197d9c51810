//! TLS-intercepting relay proxy.
//!
//! Clients connect over TLS and are answered with a certificate forged on
//! the fly for whatever server name they asked for, signed by a persistent
//! root authority. The proxy then dials the real upstream (a fixed target,
//! or the requested name on the listening port) and relays bytes both
//! ways, logging them through a tap.
//!
//! # Architecture
//!
//! - [`ca::RootAuthority`] loads the root certificate and key from disk, or
//!   generates and persists them on first start.
//! - [`ca::LeafIssuer`] signs one leaf per hostname and memoizes it.
//! - [`proxy::HandshakeGate`] picks the leaf for each handshake, using the
//!   fallback hostname when the client sends no server name.
//! - [`proxy::Session`] relays both directions and tears down exactly once
//!   when either side ends. Each session can expose an injection port whose
//!   connections feed extra bytes to the upstream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stun::ca::{CaStorage, LeafIssuer, RootAuthority};
//! use stun::proxy::{HandshakeGate, ProxyServer, ProxyState};
//! use stun::ProxyConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProxyConfig::default();
//! let root = Arc::new(RootAuthority::bootstrap(&CaStorage::default())?);
//! let gate = HandshakeGate::new(Arc::new(LeafIssuer::new(root)), config.fallback.clone());
//! let state = ProxyState::from_config(&config, Arc::new(gate))?;
//! ProxyServer::bind(config.listen, Arc::new(state)).await?.run().await;
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod config;
pub mod proxy;

pub use ca::{CaError, CaResult, CaStorage, LeafIssuer, RootAuthority};
pub use config::{ConfigError, ProxyConfig, TapKind};
pub use proxy::{ProxyServer, ProxyState, Session, SessionSummary};
