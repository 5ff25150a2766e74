//! Wire formats and stream framing.

mod framing;
mod packet;

pub use framing::FrameBuffer;
pub use packet::{
    InboundPacket, Packet, PacketType, ReliablePacket, SessionId, UnreliablePacket,
    RELIABLE_HEADER_BODY, RELIABLE_LENGTH_PREFIX, RELIABLE_MAX_PAYLOAD, RELIABLE_MIN_FRAME,
    UNRELIABLE_HEADER,
};
