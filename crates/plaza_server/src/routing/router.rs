//! Packet-type to handler dispatch.

use super::handler::PacketHandler;
use crate::protocol::{InboundPacket, Packet, PacketType};
use crate::session::Session;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to a dispatched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler is registered for the type; the packet was dropped.
    Unroutable,
    /// The handler returned an error or panicked.
    Failed,
}

/// One handler per packet type. Built before the listeners start and then
/// shared read-only.
#[derive(Default)]
pub struct PacketRouter {
    handlers: HashMap<PacketType, Arc<dyn PacketHandler>>,
}

impl PacketRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for its packet type.
    ///
    /// A later registration for the same type replaces the earlier one; the
    /// replaced handler is returned.
    pub fn register(&mut self, handler: Arc<dyn PacketHandler>) -> Option<Arc<dyn PacketHandler>> {
        let packet_type = handler.packet_type();
        let replaced = self.handlers.insert(packet_type, handler);
        match &replaced {
            Some(old) => warn!(
                "Handler {} for packet type {} replaced by {}",
                old.name(),
                packet_type,
                self.handlers[&packet_type].name()
            ),
            None => info!(
                "📦 Registered {} for packet type {}",
                self.handlers[&packet_type].name(),
                packet_type
            ),
        }
        replaced
    }

    /// Registers every handler in order.
    pub fn with_handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn PacketHandler>>) -> Self {
        for handler in handlers {
            self.register(handler);
        }
        self
    }

    pub fn handler_for(&self, packet_type: PacketType) -> Option<&Arc<dyn PacketHandler>> {
        self.handlers.get(&packet_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Routes `packet` to its handler and waits for it to finish.
    pub async fn dispatch(&self, packet: &InboundPacket, session: &Arc<Session>) -> DispatchOutcome {
        let packet_type = packet.packet_type();
        let Some(handler) = self.handlers.get(&packet_type) else {
            debug!(
                "No handler for packet type {} from session {}",
                packet_type,
                session.id()
            );
            return DispatchOutcome::Unroutable;
        };

        let result = AssertUnwindSafe(handler.handle(packet, session))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                error!(
                    "Handler {} failed on packet type {} for session {}: {}",
                    handler.name(),
                    packet_type,
                    session.id(),
                    e
                );
                DispatchOutcome::Failed
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "Handler {} panicked on packet type {} for session {}: {}",
                    handler.name(),
                    packet_type,
                    session.id(),
                    message
                );
                DispatchOutcome::Failed
            }
        }
    }
}
