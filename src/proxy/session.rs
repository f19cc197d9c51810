//! One intercepted connection: two relay directions, an optional injection
//! listener, and a teardown that runs exactly once.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::inject::InjectListener;
use super::tap::{NoopTap, Tap};

const BUFFER_SIZE: usize = 32 * 1024;

/// How long teardown waits for each writer to shut down gracefully.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A write handle that teardown can take away from everyone using it.
pub(crate) type SharedWriter = Arc<Mutex<Option<BoxedWriter>>>;

pub(crate) fn shared<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Some(Box::new(writer))))
}

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("c2s"),
            Self::UpstreamToClient => f.write_str("s2c"),
        }
    }
}

/// What happened during a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// Bytes forwarded upstream from injection connections.
    pub injected: u64,
    /// The relay direction whose termination ran the teardown.
    pub closed_by: Option<Direction>,
}

/// Exactly-once trigger for session teardown.
///
/// Firing also cancels the session token, which unblocks every relay,
/// the injection accept loop and all injection connections.
#[derive(Debug, Default)]
pub(crate) struct TeardownGuard {
    fired: AtomicBool,
    token: CancellationToken,
}

impl TeardownGuard {
    /// Returns `true` for exactly one caller.
    pub(crate) fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// The handles released by teardown. The injection listener is owned by
/// its accept loop and closes when the guard cancels the session token.
struct Teardown {
    guard: TeardownGuard,
    client: SharedWriter,
    upstream: SharedWriter,
}

impl Teardown {
    /// Closes the session if nobody has yet. Returns whether this call did.
    async fn run(&self, initiator: &str) -> bool {
        if !self.guard.fire() {
            return false;
        }
        debug!("{} ended first, closing session", initiator);
        close_writer(&self.client).await;
        close_writer(&self.upstream).await;
        true
    }
}

async fn close_writer(writer: &SharedWriter) {
    let taken = writer.lock().await.take();
    let Some(mut writer) = taken else {
        return;
    };
    match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("shutdown failed: {}", e),
        Err(_) => debug!("shutdown timed out"),
    }
}

/// An intercepted client connection paired with its upstream.
pub struct Session<C, U> {
    peer: SocketAddr,
    client: C,
    upstream: U,
    injector: Option<InjectListener>,
    tap: Arc<dyn Tap>,
    idle_timeout: Option<Duration>,
}

impl<C, U> Session<C, U>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    /// `peer` is the client's remote address, used to label traffic.
    pub fn new(peer: SocketAddr, client: C, upstream: U) -> Self {
        Self {
            peer,
            client,
            upstream,
            injector: None,
            tap: Arc::new(NoopTap),
            idle_timeout: None,
        }
    }

    pub fn with_tap(mut self, tap: Arc<dyn Tap>) -> Self {
        self.tap = tap;
        self
    }

    /// Serves `injector` alongside the relays and closes it on teardown.
    pub fn with_injector(mut self, injector: InjectListener) -> Self {
        self.injector = Some(injector);
        self
    }

    /// A direction that reads nothing for this long ends the session.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn injector_addr(&self) -> Option<SocketAddr> {
        self.injector.as_ref().map(InjectListener::local_addr)
    }

    /// Relays until either direction ends, then tears everything down.
    ///
    /// Returns once every task of the session has exited, so all sockets
    /// are released by then.
    pub async fn run(self) -> SessionSummary {
        let Self {
            peer,
            client,
            upstream,
            injector,
            tap,
            idle_timeout,
        } = self;

        let (client_reader, client_writer) = tokio::io::split(client);
        let (upstream_reader, upstream_writer) = tokio::io::split(upstream);
        let teardown = Arc::new(Teardown {
            guard: TeardownGuard::default(),
            client: shared(client_writer),
            upstream: shared(upstream_writer),
        });

        let injection = injector.map(|listener| {
            tokio::spawn(listener.serve(
                peer,
                Arc::clone(&teardown.upstream),
                Arc::clone(&tap),
                teardown.guard.token().clone(),
            ))
        });

        let c2s = tokio::spawn(relay(
            client_reader,
            Arc::clone(&teardown.upstream),
            format!("{} {}", peer, Direction::ClientToUpstream),
            Arc::clone(&tap),
            idle_timeout,
            Arc::clone(&teardown),
        ));
        let s2c = tokio::spawn(relay(
            upstream_reader,
            Arc::clone(&teardown.client),
            format!("{} {}", peer, Direction::UpstreamToClient),
            tap,
            idle_timeout,
            Arc::clone(&teardown),
        ));

        let (c2s, s2c) = tokio::join!(c2s, s2c);
        let c2s = c2s.unwrap_or_default();
        let s2c = s2c.unwrap_or_default();
        let injected = match injection {
            Some(task) => task.await.unwrap_or_default(),
            None => 0,
        };

        let closed_by = if c2s.closed {
            Some(Direction::ClientToUpstream)
        } else if s2c.closed {
            Some(Direction::UpstreamToClient)
        } else {
            None
        };

        SessionSummary {
            client_to_upstream: c2s.bytes,
            upstream_to_client: s2c.bytes,
            injected,
            closed_by,
        }
    }
}

#[derive(Debug, Default)]
struct RelayOutcome {
    bytes: u64,
    /// Whether this relay's termination ran the teardown.
    closed: bool,
}

async fn relay<R>(
    mut reader: R,
    writer: SharedWriter,
    label: String,
    tap: Arc<dyn Tap>,
    idle_timeout: Option<Duration>,
    teardown: Arc<Teardown>,
) -> RelayOutcome
where
    R: AsyncRead + Send + Unpin,
{
    // A panicking tap must still unblock the other direction.
    let _cancel_on_exit = teardown.guard.token().clone().drop_guard();

    let (bytes, result) = pump(
        &mut reader,
        &writer,
        &label,
        tap.as_ref(),
        teardown.guard.token(),
        idle_timeout,
    )
    .await;
    match result {
        Ok(()) => debug!("{} finished after {} bytes", label, bytes),
        Err(e) => debug!("{} failed after {} bytes: {}", label, bytes, e),
    }
    drop(reader);

    let closed = teardown.run(&label).await;
    RelayOutcome { bytes, closed }
}

/// Copies `reader` into `writer` until end of stream, an error, an idle
/// timeout, or cancellation. Returns the bytes forwarded along with how
/// the copy ended.
///
/// Nothing is written once `token` is cancelled or the writer has been
/// taken by teardown.
pub(crate) async fn pump<R>(
    reader: &mut R,
    writer: &SharedWriter,
    label: &str,
    tap: &dyn Tap,
    token: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return (total, Ok(())),
            read = read_chunk(reader, &mut buf, idle_timeout) => read,
        };
        let n = match read {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };

        let mut slot = tokio::select! {
            biased;
            _ = token.cancelled() => return (total, Ok(())),
            slot = writer.lock() => slot,
        };
        if token.is_cancelled() {
            return (total, Ok(()));
        }
        let Some(sink) = slot.as_mut() else {
            return (total, Ok(()));
        };

        tap.observe(label, &buf[..n]);
        let written = tokio::select! {
            biased;
            _ = token.cancelled() => return (total, Ok(())),
            written = write_chunk(sink, &buf[..n]) => written,
        };
        if let Err(e) = written {
            return (total, Err(e));
        }
        total += n as u64;
    }
}

async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"))?,
        None => reader.read(buf).await,
    }
}

async fn write_chunk(sink: &mut BoxedWriter, data: &[u8]) -> io::Result<()> {
    sink.write_all(data).await?;
    sink.flush().await
}
