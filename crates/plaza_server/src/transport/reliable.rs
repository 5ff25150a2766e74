//! Reliable (TCP) transport: accept loop, per-connection read loops and the
//! connection handle sessions write through.

use crate::error::{Result, ServerError};
use crate::protocol::{FrameBuffer, ReliablePacket};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Process-unique identifier of an accepted stream connection.
pub type ConnectionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side of the stream.
    PeerClosed,
    /// Reading from the stream failed.
    TransportError(String),
    /// The connection was closed locally (session removed or expired).
    Closed,
    /// The whole server is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed the connection"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {e}"),
            DisconnectReason::Closed => write!(f, "closed by server"),
            DisconnectReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Write side of an accepted connection.
///
/// Exactly one session owns a connection. Writes are serialized through an
/// async mutex so concurrent broadcasts never interleave frames.
pub struct ReliableConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    writer: Mutex<BoxedWriter>,
    closed: CancellationToken,
    write_timeout: Duration,
}

/// How long one frame may take to hand to the peer before the connection is
/// given up on.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the graceful half-close at the end of a read loop.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

impl fmt::Debug for ReliableConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ReliableConnection {
    /// Wraps a writer. `closed` is normally a child of the server's shutdown token.
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            writer: Mutex::new(Box::new(writer)),
            closed,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Marks the connection closed. The read loop notices and exits; further
    /// writes are refused. Calling this more than once is harmless.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Writes one already-encoded frame.
    ///
    /// The write is abandoned as soon as the connection is closed. A peer
    /// that does not drain its socket within the write timeout gets its
    /// connection closed; a half-written frame never leaves a usable stream
    /// behind.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(self.not_connected());
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(self.not_connected()),
            written = timeout(self.write_timeout, write) => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    self.close();
                    Err(ServerError::TransportFailure(e))
                }
                Err(_) => {
                    warn!(
                        "Connection {} to {} stalled for {:?}, closing",
                        self.id, self.peer_addr, self.write_timeout
                    );
                    self.close();
                    Err(ServerError::TransportFailure(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("write to connection {} timed out", self.id),
                    )))
                }
            }
        }
    }

    fn not_connected(&self) -> ServerError {
        ServerError::TransportFailure(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            format!("connection {} is closed", self.id),
        ))
    }

    /// Half-closes the write side, skipping it if the writer stays busy.
    async fn shutdown(&self) {
        let graceful = timeout(SHUTDOWN_GRACE, async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        })
        .await;

        match graceful {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Connection {} shutdown: {}", self.id, e),
            Err(_) => debug!("Connection {} writer busy, skipping graceful shutdown", self.id),
        }
    }
}

/// Callbacks the reliable listener raises for each connection.
///
/// Each callback is invoked exactly once per event, from the connection's
/// own read loop, so frames of one connection arrive in stream order while
/// different connections proceed concurrently.
#[async_trait]
pub trait ReliableEvents: Send + Sync + 'static {
    /// Per-connection state produced on connect and handed back for every packet.
    type Context: Send + Sync + 'static;

    /// A connection was accepted. Returning `None` rejects and closes it.
    async fn on_client_connected(&self, connection: Arc<ReliableConnection>) -> Option<Self::Context>;

    /// One complete frame was decoded.
    async fn on_packet_received(&self, context: &Self::Context, packet: ReliablePacket);

    /// The connection is gone. Called once, after the last packet.
    async fn on_client_disconnected(&self, context: Self::Context, reason: DisconnectReason);
}

/// Bound TCP listener that has not started accepting yet.
pub struct ReliableListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_connections: usize,
    read_buffer_size: usize,
    write_timeout: Duration,
    active_connections: Arc<AtomicUsize>,
    next_connection_id: AtomicU64,
}

impl ReliableListener {
    /// Creates, binds and starts listening on `addr`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, max_connections: usize, read_buffer_size: usize) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
        socket.set_reuse_address(true).ok();

        socket
            .bind(&addr.into())
            .map_err(|e| ServerError::Network(format!("Bind to {addr} failed: {e}")))?;
        socket
            .listen(1024)
            .map_err(|e| ServerError::Network(format!("Listen on {addr} failed: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::Network(format!("Non-blocking mode failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Local address unavailable: {e}")))?;

        info!("✅ Reliable listener bound on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            max_connections,
            read_buffer_size,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Sets the write timeout given to every accepted connection.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until `shutdown` is cancelled.
    ///
    /// Every read loop runs on a child of `shutdown`; after the accept loop
    /// stops, this waits for all of them to finish.
    pub async fn run<E: ReliableEvents>(self, events: Arc<E>, shutdown: CancellationToken) {
        let mut read_loops = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(finished) = read_loops.join_next(), if !read_loops.is_empty() => {
                    if let Err(e) = finished {
                        error!("Read loop task failed: {}", e);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if self.active_connections.load(Ordering::Acquire) >= self.max_connections {
                            warn!(
                                "Rejecting {}: connection limit of {} reached",
                                peer_addr, self.max_connections
                            );
                            drop(stream);
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("TCP_NODELAY on {} failed: {}", peer_addr, e);
                        }

                        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                        let (reader, writer) = stream.into_split();
                        let connection = Arc::new(
                            ReliableConnection::new(id, peer_addr, writer, shutdown.child_token())
                                .with_write_timeout(self.write_timeout),
                        );

                        let slot = ConnectionSlot::acquire(&self.active_connections);
                        read_loops.spawn(read_loop(
                            reader,
                            connection,
                            events.clone(),
                            self.read_buffer_size,
                            slot,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }

        info!("Reliable accept loop stopped, waiting for {} connection(s)", read_loops.len());
        while let Some(finished) = read_loops.join_next().await {
            if let Err(e) = finished {
                error!("Read loop task failed: {}", e);
            }
        }
    }
}

/// One counted connection. The count drops with the guard, so a read loop
/// that panics or is aborted still frees its slot.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active.clone())
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reads from one connection until it closes, emitting one event per frame.
async fn read_loop<E: ReliableEvents>(
    mut reader: OwnedReadHalf,
    connection: Arc<ReliableConnection>,
    events: Arc<E>,
    read_buffer_size: usize,
    slot: ConnectionSlot,
    shutdown: CancellationToken,
) {
    let Some(context) = events.on_client_connected(connection.clone()).await else {
        debug!("Connection {} from {} rejected", connection.id(), connection.peer_addr());
        connection.close();
        connection.shutdown().await;
        return;
    };

    let mut frames = FrameBuffer::with_capacity(read_buffer_size);

    let reason = loop {
        tokio::select! {
            _ = connection.closed() => {
                break if shutdown.is_cancelled() {
                    DisconnectReason::Shutdown
                } else {
                    DisconnectReason::Closed
                };
            }
            read = reader.read_buf(frames.buffer_mut()) => match read {
                Ok(0) => break DisconnectReason::PeerClosed,
                Ok(n) => {
                    debug!("Connection {} read {} bytes", connection.id(), n);
                    while let Some(frame) = frames.next_frame() {
                        match frame {
                            Ok(packet) => events.on_packet_received(&context, packet).await,
                            Err(e) => warn!(
                                "Dropping frame from {}: {}",
                                connection.peer_addr(), e
                            ),
                        }
                    }
                }
                Err(e) => break DisconnectReason::TransportError(e.to_string()),
            }
        }
    };

    connection.close();
    connection.shutdown().await;
    drop(slot);

    debug!("Connection {} from {} ended: {}", connection.id(), connection.peer_addr(), reason);
    events.on_client_disconnected(context, reason).await;
}
