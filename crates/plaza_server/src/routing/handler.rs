use crate::error::Result;
use crate::protocol::{InboundPacket, PacketType};
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;

/// Handles one packet type.
///
/// Implementations may do any async work: reply through the session, read or
/// write its presence cache, or broadcast through a registry they hold.
/// Returned errors and panics are contained by the router.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    /// The code this handler serves.
    fn packet_type(&self) -> PacketType;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, packet: &InboundPacket, session: &Arc<Session>) -> Result<()>;
}
