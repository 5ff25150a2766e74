//! The presence server: both listeners, the registry, the supervisor and
//! the router, driven by one shutdown token.

use super::events::{NoopObserver, ServerEvents, SessionObserver};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::routing::PacketRouter;
use crate::session::{SessionNotice, SessionRegistry, SessionSupervisor};
use crate::transport::{ReliableListener, UnreliableListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A bound, not yet running server.
///
/// Binding is split from running so a host can read the actual local
/// addresses (useful with port 0) and grab the registry or shutdown token
/// before the loops start.
pub struct PresenceServer {
    config: ServerConfig,
    reliable: ReliableListener,
    unreliable: UnreliableListener,
    registry: Arc<SessionRegistry>,
    router: Arc<PacketRouter>,
    observer: Arc<dyn SessionObserver>,
    notices: Option<mpsc::UnboundedSender<SessionNotice>>,
    shutdown: CancellationToken,
}

impl PresenceServer {
    /// Validates `config` and binds both sockets.
    ///
    /// A bind failure is the only error that aborts startup.
    pub async fn bind(config: ServerConfig, router: PacketRouter) -> Result<Self> {
        Self::bind_with(config, |_| router).await
    }

    /// Like [`bind`](Self::bind), but builds the router once the registry
    /// exists, for handlers that broadcast.
    pub async fn bind_with<F>(config: ServerConfig, build_router: F) -> Result<Self>
    where
        F: FnOnce(&Arc<SessionRegistry>) -> PacketRouter,
    {
        config.validate()?;

        let reliable = ReliableListener::bind(
            config.reliable_bind_address,
            config.max_connections,
            config.read_buffer_size,
        )?
        .with_write_timeout(config.write_timeout);
        let unreliable = UnreliableListener::bind(config.unreliable_bind_address).await?;
        let registry = Arc::new(SessionRegistry::new(Some(unreliable.socket())));
        let router = build_router(&registry);

        Ok(Self {
            config,
            reliable,
            unreliable,
            registry,
            router: Arc::new(router),
            observer: Arc::new(NoopObserver),
            notices: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Forwards supervisor state-change notices to `notices`.
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<SessionNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn reliable_addr(&self) -> SocketAddr {
        self.reliable.local_addr()
    }

    pub fn unreliable_addr(&self) -> SocketAddr {
        self.unreliable.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn router(&self) -> Arc<PacketRouter> {
        self.router.clone()
    }

    /// Cancelling this token stops the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until the shutdown token is cancelled, then closes every session.
    pub async fn run(self) -> Result<()> {
        let mut supervisor = SessionSupervisor::new(
            self.registry.clone(),
            self.config.afk_timeout,
            self.config.session_timeout,
            self.config.supervisor_interval,
        )?;
        if let Some(notices) = self.notices {
            supervisor = supervisor.with_notices(notices);
        }

        let events = Arc::new(ServerEvents::new(
            self.registry.clone(),
            self.router.clone(),
            self.observer,
            self.config.bind_unreliable_requires_ready,
        ));

        let reliable_addr = self.reliable.local_addr();
        let unreliable_addr = self.unreliable.local_addr();

        let tasks = vec![
            (
                "reliable accept loop",
                tokio::spawn(self.reliable.run(events.clone(), self.shutdown.clone())),
            ),
            (
                "unreliable receive loop",
                tokio::spawn(self.unreliable.run(events, self.shutdown.clone())),
            ),
            (
                "session supervisor",
                tokio::spawn(supervisor.run(self.shutdown.clone())),
            ),
        ];

        info!(
            "🚀 Presence server running (reliable {}, unreliable {}, {} handler(s))",
            reliable_addr,
            unreliable_addr,
            self.router.handler_count()
        );

        self.shutdown.cancelled().await;
        info!("🛑 Shutting down presence server...");

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!("{} ended abnormally: {}", name, e);
            }
        }

        let remaining = self.registry.all_sessions();
        for session in &remaining {
            self.registry.remove_session(session.id());
        }

        info!("✅ Presence server stopped ({} session(s) closed at shutdown)", remaining.len());
        Ok(())
    }
}
