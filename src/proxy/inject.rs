//! Per-session injection listener.
//!
//! Every intercepted session may own one plain TCP listener on an
//! ephemeral port. Whatever a connection to it sends is forwarded to that
//! session's upstream, interleaved with the client's own traffic. Nothing
//! is ever sent back to the injecting connection.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::{SharedWriter, pump};
use super::tap::Tap;

/// A bound, not yet serving, injection listener.
#[derive(Debug)]
pub struct InjectListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl InjectListener {
    /// Binds an ephemeral port on `ip`.
    pub async fn bind(ip: IpAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, 0)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts injection connections until `token` is cancelled, then
    /// closes the listener and waits for every connection to finish.
    ///
    /// Returns the total number of bytes forwarded upstream.
    pub(crate) async fn serve(
        self,
        peer: SocketAddr,
        upstream: SharedWriter,
        tap: Arc<dyn Tap>,
        token: CancellationToken,
    ) -> u64 {
        let Self {
            listener,
            local_addr,
        } = self;
        let mut connections = JoinSet::new();
        let mut total = 0;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    total += done.unwrap_or_default();
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, from)) => {
                        debug!("injection connection from {} into {}", from, peer);
                        connections.spawn(inject(
                            stream,
                            format!("{} i2s", peer),
                            Arc::clone(&upstream),
                            Arc::clone(&tap),
                            token.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("injection accept on {} failed: {}", local_addr, e);
                        break;
                    }
                },
            }
        }
        drop(listener);
        debug!("injection listener {} closed", local_addr);

        while let Some(done) = connections.join_next().await {
            total += done.unwrap_or_default();
        }
        total
    }
}

async fn inject(
    mut stream: TcpStream,
    label: String,
    upstream: SharedWriter,
    tap: Arc<dyn Tap>,
    token: CancellationToken,
) -> u64 {
    let (bytes, result) = pump(&mut stream, &upstream, &label, tap.as_ref(), &token, None).await;
    if let Err(e) = result {
        debug!("{} failed after {} bytes: {}", label, bytes, e);
    }
    let _ = stream.shutdown().await;
    bytes
}
