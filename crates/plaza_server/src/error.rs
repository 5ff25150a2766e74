//! Error types for the presence server core.
//!
//! Every failure in the core is local to one unit of work (a frame, a
//! datagram, a connection or a handler call). Only [`ServerError::Network`]
//! raised while binding a listener is allowed to abort startup.

use crate::protocol::{PacketType, SessionId};
use thiserror::Error;

/// Errors raised by the codec, transports, registry and router.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A frame or datagram could not be decoded. The unit is dropped and
    /// the loop that produced it keeps running.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// The payload does not fit in the 16-bit length prefix of the reliable format.
    #[error("Payload of {0} bytes exceeds the reliable frame limit")]
    PayloadTooLarge(usize),

    /// No handler is registered for the packet type.
    #[error("No handler registered for packet type {0}")]
    UnroutablePacket(PacketType),

    /// The registry already holds a session with this id.
    #[error("Duplicate session id {0}")]
    DuplicateSessionId(SessionId),

    /// Every session id has been handed out once; ids are never reused.
    #[error("Session id space exhausted")]
    SessionIdsExhausted,

    /// Connection reset, closed or otherwise unusable.
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] std::io::Error),

    /// A packet handler returned an error or panicked.
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// Socket creation, bind or listen failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration values.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, ServerError>;
