//! Demonstration handlers and the departure announcer.
//!
//! Payloads are JSON over both transports.

use async_trait::async_trait;
use plaza_server::{
    DisconnectReason, InboundPacket, Packet, PacketHandler, PacketType, ReliablePacket, Result,
    ServerError, Session, SessionObserver, SessionRegistry, UnreliablePacket,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const IDENTIFY: PacketType = 1;
pub const MOVE: PacketType = 2;
pub const PRESENCE_LEFT: PacketType = 6;
pub const PING: PacketType = 99;
pub const UDP_HANDSHAKE: PacketType = 100;

/// Every handler the server serves, in registration order.
pub fn all_handlers(registry: Arc<SessionRegistry>) -> Vec<Arc<dyn PacketHandler>> {
    vec![
        Arc::new(IdentifyHandler),
        Arc::new(MoveHandler::new(registry)),
        Arc::new(PingHandler),
        Arc::new(UdpHandshakeHandler),
    ]
}

fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ServerError::HandlerFailure(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct IdentifyRequest {
    name: String,
    #[serde(default)]
    player_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IdentifyResponse {
    pub session_id: u32,
    pub name: String,
    pub player_id: Option<i64>,
}

/// Records the client's display name and marks the session ready.
pub struct IdentifyHandler;

#[async_trait]
impl PacketHandler for IdentifyHandler {
    fn packet_type(&self) -> PacketType {
        IDENTIFY
    }

    fn name(&self) -> &str {
        "identify"
    }

    async fn handle(&self, packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        let request: IdentifyRequest = serde_json::from_slice(packet.payload())
            .map_err(|e| ServerError::MalformedPacket(format!("identify payload: {e}")))?;
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ServerError::HandlerFailure("empty display name".into()));
        }

        session.update_presence(|presence| {
            presence.display_name = Some(name.clone());
            presence.player_id = request.player_id;
            presence.ready = true;
        });
        info!("Session {} identified as {}", session.id(), name);

        let response = IdentifyResponse {
            session_id: session.id(),
            name,
            player_id: request.player_id,
        };
        session
            .send_reliable(&ReliablePacket::new(IDENTIFY, session.id(), to_json(&response)?))
            .await
    }
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    x: f32,
    y: f32,
    #[serde(default)]
    animation: Option<String>,
    #[serde(default)]
    direction: Option<String>,
}

/// What the other sessions see when someone moves.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct MoveUpdate {
    pub session_id: u32,
    pub player_id: Option<i64>,
    pub x: f32,
    pub y: f32,
    pub animation: Option<String>,
    pub direction: Option<String>,
}

/// Caches the sender's position and relays it to every other ready session
/// over datagrams. Sessions that have not identified yet are only cached.
pub struct MoveHandler {
    registry: Arc<SessionRegistry>,
}

impl MoveHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PacketHandler for MoveHandler {
    fn packet_type(&self) -> PacketType {
        MOVE
    }

    fn name(&self) -> &str {
        "move"
    }

    async fn handle(&self, packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        let request: MoveRequest = serde_json::from_slice(packet.payload())
            .map_err(|e| ServerError::MalformedPacket(format!("move payload: {e}")))?;

        let presence = session.update_presence(|presence| {
            presence.position = Some((request.x, request.y));
            if request.animation.is_some() {
                presence.animation = request.animation;
            }
            if request.direction.is_some() {
                presence.direction = request.direction;
            }
            presence.clone()
        });
        if !presence.ready {
            return Ok(());
        }

        // Identity comes from the session, never from the payload.
        let update = MoveUpdate {
            session_id: session.id(),
            player_id: presence.player_id,
            x: request.x,
            y: request.y,
            animation: presence.animation,
            direction: presence.direction,
        };
        let relay = UnreliablePacket::new(MOVE, session.id(), to_json(&update)?)
            .with_sequence(session.next_unreliable_sequence());
        let outcome = self.registry.broadcast_unreliable(&relay, Some(session.id())).await;
        debug!(
            "Move of session {} relayed to {} session(s)",
            session.id(),
            outcome.delivered
        );
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PingResponse {
    pub timestamp: u64,
    pub message: String,
}

/// Answers over whichever transport the ping arrived on.
pub struct PingHandler;

#[async_trait]
impl PacketHandler for PingHandler {
    fn packet_type(&self) -> PacketType {
        PING
    }

    fn name(&self) -> &str {
        "ping"
    }

    async fn handle(&self, packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        let body = to_json(&PingResponse {
            timestamp: current_timestamp_millis(),
            message: "pong".to_string(),
        })?;

        match packet {
            InboundPacket::Reliable(_) => {
                session
                    .send_reliable(&ReliablePacket::new(PING, session.id(), body))
                    .await
            }
            InboundPacket::Unreliable(ping) => {
                let reply = UnreliablePacket::new(PING, session.id(), body)
                    .with_sequence(session.next_unreliable_sequence())
                    .with_timestamp(ping.timestamp);
                session.send_unreliable(&reply).await
            }
        }
    }
}

/// Confirms the datagram address binding. The core binds the address before
/// dispatching, so the reply reaches the sender.
pub struct UdpHandshakeHandler;

#[async_trait]
impl PacketHandler for UdpHandshakeHandler {
    fn packet_type(&self) -> PacketType {
        UDP_HANDSHAKE
    }

    fn name(&self) -> &str {
        "udp_handshake"
    }

    async fn handle(&self, packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        if packet.is_reliable() {
            debug!("Ignoring UDP handshake sent over TCP by session {}", session.id());
            return Ok(());
        }

        let reply = UnreliablePacket::new(UDP_HANDSHAKE, session.id(), &b"ok"[..])
            .with_sequence(session.next_unreliable_sequence());
        session.send_unreliable(&reply).await
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PresenceLeft {
    pub session_id: u32,
    pub name: Option<String>,
}

/// Tells the remaining ready sessions when a ready session leaves.
pub struct PresenceAnnouncer {
    registry: Arc<SessionRegistry>,
}

impl PresenceAnnouncer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SessionObserver for PresenceAnnouncer {
    async fn on_session_closed(&self, session: &Arc<Session>, reason: &DisconnectReason) {
        if !session.is_ready() || *reason == DisconnectReason::Shutdown {
            return;
        }

        let body = match to_json(&PresenceLeft {
            session_id: session.id(),
            name: session.presence().display_name,
        }) {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not encode departure of session {}: {}", session.id(), e);
                return;
            }
        };

        let packet = ReliablePacket::new(PRESENCE_LEFT, session.id(), body);
        match self.registry.broadcast_reliable_except(&packet, session.id()).await {
            Ok(outcome) => debug!(
                "Departure of session {} announced to {} session(s)",
                session.id(),
                outcome.delivered
            ),
            Err(e) => warn!("Departure broadcast for session {} failed: {}", session.id(), e),
        }
    }
}
