//! Core server configuration.

use crate::error::{Result, ServerError};
use std::net::SocketAddr;
use std::time::Duration;

/// Settings the core needs from its host.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for the reliable (stream) listener.
    pub reliable_bind_address: SocketAddr,
    /// Address for the unreliable (datagram) socket.
    pub unreliable_bind_address: SocketAddr,
    /// Inactivity after which a session is flagged idle.
    pub afk_timeout: Duration,
    /// Inactivity after which a session is removed.
    pub session_timeout: Duration,
    /// Period of the supervisor tick.
    pub supervisor_interval: Duration,
    /// Concurrent reliable connections accepted before new ones are dropped.
    pub max_connections: usize,
    /// Initial size of each connection's receive buffer.
    pub read_buffer_size: usize,
    /// Longest a single reliable write may block before the connection is closed.
    pub write_timeout: Duration,
    /// Only ready sessions may bind a datagram address.
    pub bind_unreliable_requires_ready: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            reliable_bind_address: SocketAddr::from(([127, 0, 0, 1], 9000)),
            unreliable_bind_address: SocketAddr::from(([127, 0, 0, 1], 9001)),
            afk_timeout: Duration::from_secs(120),
            session_timeout: Duration::from_secs(600),
            supervisor_interval: Duration::from_secs(5),
            max_connections: 1000,
            read_buffer_size: 4096,
            write_timeout: Duration::from_secs(5),
            bind_unreliable_requires_ready: true,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.afk_timeout >= self.session_timeout {
            return Err(ServerError::Config(
                "afk_timeout must be shorter than session_timeout".into(),
            ));
        }
        if self.supervisor_interval.is_zero() {
            return Err(ServerError::Config("supervisor_interval must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ServerError::Config("read_buffer_size must be non-zero".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(ServerError::Config("write_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
