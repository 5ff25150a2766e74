//! # Plaza Server - Presence Core for Small Multiplayer Worlds
//!
//! The core of a real-time presence server. It owns the network plumbing and
//! the session bookkeeping; everything that gives a packet meaning lives in
//! handlers registered by the host.
//!
//! ## Transports
//!
//! * **Reliable** - one TCP stream per client, length-prefixed frames, used
//!   for login, chat and control traffic
//! * **Unreliable** - one shared UDP socket, one packet per datagram, used for
//!   frequent position and state updates
//!
//! A client's datagram source address is bound to its session the first time
//! a datagram carries that session's id (by default only once the session is
//! marked ready).
//!
//! ## Architecture Overview
//!
//! * [`protocol`] - both wire formats plus stream framing
//! * [`transport`] - the accept loop, per-connection read loops and the
//!   datagram receive loop
//! * [`session`] - sessions, their presence cache, the concurrent registry
//!   and the idle/expiry supervisor
//! * [`routing`] - the handler contract and the packet-type router
//! * [`server`] - [`PresenceServer`], which wires it all together
//!
//! ### Packet Flow
//!
//! 1. A listener decodes a frame or datagram
//! 2. The owning session is looked up and its activity refreshed
//! 3. The router hands the packet to the handler for its type
//! 4. The handler replies through the session or broadcasts through the registry
//!
//! ## Usage
//!
//! ```no_run
//! use plaza_server::{PacketRouter, PresenceServer, ServerConfig};
//!
//! # async fn start() -> plaza_server::Result<()> {
//! let router = PacketRouter::new();
//! let server = PresenceServer::bind(ServerConfig::default(), router).await?;
//! let shutdown = server.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.cancel();
//! });
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod session;
pub mod transport;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use protocol::{
    InboundPacket, Packet, PacketType, ReliablePacket, SessionId, UnreliablePacket,
};
pub use routing::{DispatchOutcome, PacketHandler, PacketRouter};
pub use server::{NoopObserver, PresenceServer, SessionObserver};
pub use session::{
    BroadcastOutcome, PresenceCache, Session, SessionNotice, SessionRegistry,
    SessionStateChange, SessionSupervisor,
};
pub use transport::DisconnectReason;
