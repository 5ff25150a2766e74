//! Wiring from transport events to the registry and router.

use crate::protocol::{InboundPacket, Packet, ReliablePacket, UnreliablePacket};
use crate::routing::PacketRouter;
use crate::session::{Session, SessionRegistry};
use crate::transport::{DisconnectReason, ReliableConnection, ReliableEvents, UnreliableEvents};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error};

/// Host hook for session lifecycle.
///
/// `on_session_opened` runs once after a session is registered and before
/// its first packet is dispatched. `on_session_closed` runs once after the
/// session has left the registry, whatever removed it.
#[async_trait]
pub trait SessionObserver: Send + Sync + 'static {
    async fn on_session_opened(&self, _session: &Arc<Session>) {}

    async fn on_session_closed(&self, _session: &Arc<Session>, _reason: &DisconnectReason) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

pub(crate) struct ServerEvents {
    registry: Arc<SessionRegistry>,
    router: Arc<PacketRouter>,
    observer: Arc<dyn SessionObserver>,
    bind_requires_ready: bool,
}

impl ServerEvents {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        router: Arc<PacketRouter>,
        observer: Arc<dyn SessionObserver>,
        bind_requires_ready: bool,
    ) -> Self {
        Self {
            registry,
            router,
            observer,
            bind_requires_ready,
        }
    }

    /// Finds the session a datagram belongs to, binding its address when
    /// the datagram proves knowledge of a live session id.
    fn resolve_datagram(&self, from: SocketAddr, packet: &UnreliablePacket) -> Option<Arc<Session>> {
        if let Some(session) = self.registry.get_by_unreliable_addr(from) {
            if session.id() == packet.session_id {
                return Some(session);
            }
        }

        let Some(session) = self.registry.get(packet.session_id) else {
            debug!(
                "Dropping datagram from {}: unknown session {}",
                from, packet.session_id
            );
            return None;
        };
        if self.bind_requires_ready && !session.is_ready() {
            debug!(
                "Dropping datagram from {}: session {} is not ready",
                from,
                session.id()
            );
            return None;
        }

        self.registry.bind_unreliable_address(&session, from);
        Some(session)
    }
}

#[async_trait]
impl ReliableEvents for ServerEvents {
    type Context = Arc<Session>;

    async fn on_client_connected(&self, connection: Arc<ReliableConnection>) -> Option<Arc<Session>> {
        match self.registry.create_session(connection.clone()) {
            Ok(session) => {
                self.observer.on_session_opened(&session).await;
                Some(session)
            }
            Err(e) => {
                error!("Rejecting connection from {}: {}", connection.peer_addr(), e);
                None
            }
        }
    }

    async fn on_packet_received(&self, session: &Arc<Session>, packet: ReliablePacket) {
        debug!(
            "Session {} sent reliable packet type {} ({} bytes)",
            session.id(),
            packet.packet_type,
            packet.payload.len()
        );
        session.touch();
        self.router
            .dispatch(&InboundPacket::from(packet), session)
            .await;
    }

    async fn on_client_disconnected(&self, session: Arc<Session>, reason: DisconnectReason) {
        self.registry.remove_session(session.id());
        self.observer.on_session_closed(&session, &reason).await;
    }
}

#[async_trait]
impl UnreliableEvents for ServerEvents {
    async fn on_packet_received(&self, from: SocketAddr, packet: UnreliablePacket) {
        let Some(session) = self.resolve_datagram(from, &packet) else {
            return;
        };

        debug!(
            "Session {} sent datagram type {} seq {}",
            session.id(),
            packet.packet_type(),
            packet.sequence
        );
        session.touch();
        self.router
            .dispatch(&InboundPacket::from(packet), &session)
            .await;
    }
}
