//! Unreliable (UDP) transport.

use crate::error::{Result, ServerError};
use crate::protocol::UnreliablePacket;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest datagram the receive loop accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Callback raised for every decoded datagram.
#[async_trait]
pub trait UnreliableEvents: Send + Sync + 'static {
    async fn on_packet_received(&self, from: SocketAddr, packet: UnreliablePacket);
}

/// Bound datagram socket plus its receive loop.
///
/// The socket is shared: sessions send through the same handle the loop
/// receives on, so replies leave from the advertised port.
pub struct UnreliableListener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UnreliableListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::Network(format!("UDP bind to {addr} failed: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Local address unavailable: {e}")))?;

        info!("✅ Unreliable listener bound on {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for outbound datagrams.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Receives until `shutdown` is cancelled.
    ///
    /// Datagrams are dispatched inline, one at a time, so packets from the
    /// same address reach the callback in arrival order.
    pub async fn run<E: UnreliableEvents>(self, events: Arc<E>, shutdown: CancellationToken) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => match UnreliablePacket::decode(&buffer[..len]) {
                        Ok(packet) => events.on_packet_received(from, packet).await,
                        Err(e) => warn!("Dropping datagram from {}: {}", from, e),
                    },
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        debug!("Unreliable receive loop on {} stopped", self.local_addr);
    }
}
