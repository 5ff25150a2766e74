//! A single client session.

use super::presence::PresenceCache;
use crate::error::{Result, ServerError};
use crate::protocol::{ReliablePacket, SessionId, UnreliablePacket};
use crate::transport::ReliableConnection;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::debug;

/// Server-side state of one connected client.
///
/// Owns exactly one reliable connection and at most one bound datagram
/// address. Shared as `Arc<Session>` between the registry, the read loop of
/// its connection and any handler currently running for it.
pub struct Session {
    id: SessionId,
    connection: Arc<ReliableConnection>,
    unreliable_socket: Option<Arc<UdpSocket>>,
    unreliable_addr: RwLock<Option<SocketAddr>>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    idle: AtomicBool,
    presence: RwLock<PresenceCache>,
    outbound_sequence: AtomicU16,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.connection.peer_addr())
            .field("unreliable_addr", &*self.unreliable_addr.read())
            .field("idle", &self.is_idle())
            .finish()
    }
}

impl Session {
    pub fn new(
        id: SessionId,
        connection: Arc<ReliableConnection>,
        unreliable_socket: Option<Arc<UdpSocket>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection,
            unreliable_socket,
            unreliable_addr: RwLock::new(None),
            connected_at: now,
            last_activity: Mutex::new(now),
            idle: AtomicBool::new(false),
            presence: RwLock::new(PresenceCache::default()),
            outbound_sequence: AtomicU16::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection(&self) -> &Arc<ReliableConnection> {
        &self.connection
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn unreliable_addr(&self) -> Option<SocketAddr> {
        *self.unreliable_addr.read()
    }

    /// Only the registry changes the bound address, so both indices move together.
    pub(crate) fn set_unreliable_addr(&self, addr: Option<SocketAddr>) {
        *self.unreliable_addr.write() = addr;
    }

    /// Records inbound activity on either transport.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let mut last = self.last_activity.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub(crate) fn set_idle(&self, idle: bool) -> bool {
        self.idle.swap(idle, Ordering::AcqRel)
    }

    pub fn is_ready(&self) -> bool {
        self.presence.read().ready
    }

    pub fn set_ready(&self, ready: bool) {
        self.presence.write().ready = ready;
    }

    pub fn presence(&self) -> PresenceCache {
        self.presence.read().clone()
    }

    /// Mutates the presence cache under its write lock.
    pub fn update_presence<R>(&self, update: impl FnOnce(&mut PresenceCache) -> R) -> R {
        update(&mut self.presence.write())
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Sends a packet on the reliable connection.
    ///
    /// Sending on a closed session is a no-op. A failed write closes the
    /// connection and is reported so the caller can remove the session.
    pub async fn send_reliable(&self, packet: &ReliablePacket) -> Result<()> {
        let frame = packet.to_bytes()?;
        self.send_reliable_frame(&frame).await
    }

    pub(crate) async fn send_reliable_frame(&self, frame: &[u8]) -> Result<()> {
        if !self.connection.is_open() {
            return Ok(());
        }
        if let Err(e) = self.connection.send(frame).await {
            debug!("Session {} reliable write failed: {}", self.id, e);
            self.connection.close();
            return Err(e);
        }
        Ok(())
    }

    /// Sends a packet to the bound datagram address, if there is one.
    pub async fn send_unreliable(&self, packet: &UnreliablePacket) -> Result<()> {
        self.send_unreliable_datagram(&packet.to_bytes()).await
    }

    pub(crate) async fn send_unreliable_datagram(&self, datagram: &[u8]) -> Result<()> {
        let (Some(socket), Some(addr)) = (self.unreliable_socket.as_ref(), self.unreliable_addr())
        else {
            return Ok(());
        };
        socket
            .send_to(datagram, addr)
            .await
            .map_err(ServerError::TransportFailure)?;
        Ok(())
    }

    /// Next outbound datagram sequence number; wraps at `u16::MAX`.
    pub fn next_unreliable_sequence(&self) -> u16 {
        self.outbound_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Closes the reliable connection. The read loop ends shortly after.
    pub fn close(&self) {
        self.connection.close();
    }
}
