//! Socket-level plumbing for the two transports.

mod reliable;
mod unreliable;

pub use reliable::{
    ConnectionId, DisconnectReason, ReliableConnection, ReliableEvents, ReliableListener,
    DEFAULT_WRITE_TIMEOUT,
};
pub use unreliable::{UnreliableEvents, UnreliableListener, MAX_DATAGRAM_SIZE};
