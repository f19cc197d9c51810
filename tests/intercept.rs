//! End-to-end interception through a real TLS client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use stun::ca::{CaStorage, LeafIssuer, RootAuthority};
use stun::proxy::{
    HandshakeGate, ProxyServer, ProxyState, TlsAcceptor, UpstreamConfig, UpstreamConnector,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    _dir: tempfile::TempDir,
    root: Arc<RootAuthority>,
    proxy: SocketAddr,
}

/// Starts a proxy on an ephemeral port, backed by a fresh root.
async fn start_proxy(fallback: &str, target: Option<SocketAddr>) -> Harness {
    let connector = UpstreamConnector::plain().with_connect_timeout(Some(Duration::from_secs(2)));
    start_proxy_with(fallback, target, connector).await
}

async fn start_proxy_with(
    fallback: &str,
    target: Option<SocketAddr>,
    connector: UpstreamConnector,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = CaStorage {
        cert: dir.path().join("ca.pem"),
        key: dir.path().join("ca-key.pem"),
    };
    let root = Arc::new(RootAuthority::bootstrap(&storage).unwrap());
    let gate = HandshakeGate::new(Arc::new(LeafIssuer::new(Arc::clone(&root))), fallback);

    let acceptor = TlsAcceptor::new(Arc::new(gate))
        .unwrap()
        .with_handshake_timeout(Some(WAIT));
    let state = ProxyState::new(acceptor, connector, fallback)
        .with_target(target.map(|addr| addr.to_string()));

    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(state))
        .await
        .unwrap();
    let proxy = server.local_addr().unwrap();
    tokio::spawn(server.run());

    Harness {
        _dir: dir,
        root,
        proxy,
    }
}

async fn connect_client(
    harness: &Harness,
    server_name: &str,
    send_sni: bool,
) -> TlsStream<TcpStream> {
    let mut roots = RootCertStore::empty();
    roots.add(harness.root.cert_der().clone()).unwrap();
    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
    config.enable_sni = send_sni;

    let tcp = TcpStream::connect(harness.proxy).await.unwrap();
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    timeout(WAIT, TlsConnector::from(Arc::new(config)).connect(name, tcp))
        .await
        .unwrap()
        .unwrap()
}

fn leaf_common_name(client: &TlsStream<TcpStream>) -> String {
    let certs = client.get_ref().1.peer_certificates().unwrap();
    let (_, leaf) = x509_parser::parse_x509_certificate(certs[0].as_ref()).unwrap();
    leaf.subject()
        .iter_common_name()
        .next()
        .unwrap()
        .as_str()
        .unwrap()
        .to_string()
}

/// Bytes cross the proxy unchanged both ways, and the upstream closing
/// closes the client.
#[tokio::test]
async fn relays_through_forged_certificate() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let harness = start_proxy("*.example.org", Some(upstream.local_addr().unwrap())).await;

    // A failed handshake does not take the listener down.
    let mut junk = TcpStream::connect(harness.proxy).await.unwrap();
    junk.write_all(b"not a client hello\r\n\r\n").await.unwrap();
    drop(junk);

    let mut client = connect_client(&harness, "svc.local", true).await;
    assert_eq!(leaf_common_name(&client), "svc.local");

    let (mut server_side, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, server_side.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    server_side.write_all(b"pong").await.unwrap();
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");

    drop(server_side);
    let mut rest = Vec::new();
    let closed = timeout(WAIT, client.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "client still open after upstream closed");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn client_close_closes_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let harness = start_proxy("*.example.org", Some(upstream.local_addr().unwrap())).await;

    let mut client = connect_client(&harness, "svc.local", true).await;
    let (mut server_side, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"bye").await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    let mut received = Vec::new();
    timeout(WAIT, server_side.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"bye");
}

/// Leaves are issued once per name and reused across connections.
#[tokio::test]
async fn repeated_name_gets_same_leaf() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let harness = start_proxy("*.example.org", Some(upstream.local_addr().unwrap())).await;

    let first = connect_client(&harness, "svc.local", true).await;
    let second = connect_client(&harness, "svc.local", true).await;
    assert_eq!(
        first.get_ref().1.peer_certificates().unwrap()[0],
        second.get_ref().1.peer_certificates().unwrap()[0]
    );
}

/// Without SNI the fallback name is forged, and mirror mode dials it.
#[tokio::test]
async fn missing_sni_uses_fallback() {
    let harness = start_proxy("fallback.invalid", None).await;

    let mut client = connect_client(&harness, "fallback.invalid", false).await;
    assert_eq!(leaf_common_name(&client), "fallback.invalid");

    // The mirrored upstream does not exist, so the proxy drops the client.
    let mut rest = Vec::new();
    let closed = timeout(WAIT, client.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "client still open after failed dial");
}

/// The upstream leg can itself be TLS: the proxy accepts the upstream's
/// self-signed certificate and relays plaintext between the two sessions.
#[tokio::test]
async fn relays_to_tls_upstream() {
    let upstream_key = rcgen::KeyPair::generate().unwrap();
    let upstream_cert = rcgen::CertificateParams::new(vec!["backend.test".to_string()])
        .unwrap()
        .self_signed(&upstream_key)
        .unwrap();
    let upstream_config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![upstream_cert.der().clone()],
                PrivateKeyDer::Pkcs8(upstream_key.serialize_der().into()),
            )
            .unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let upstream_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(upstream_config));

    let connector = UpstreamConnector::from_config(&UpstreamConfig::default())
        .unwrap()
        .with_connect_timeout(Some(WAIT));
    let harness = start_proxy_with("*.example.org", Some(upstream_addr), connector).await;

    let mut client = connect_client(&harness, "svc.local", true).await;
    let (tcp, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();
    let mut server_side = timeout(WAIT, upstream_acceptor.accept(tcp))
        .await
        .unwrap()
        .unwrap();

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, server_side.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    server_side.write_all(b"pong").await.unwrap();
    server_side.flush().await.unwrap();
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");
}
