//! Binary packet formats for both transports.
//!
//! Reliable (stream) frames, big-endian:
//!
//! ```text
//! [2B total_length][1B packet_type][1B flags][4B session_id][payload]
//! ```
//!
//! `total_length` counts everything after the length field itself, so it is
//! always `6 + payload.len()`.
//!
//! Unreliable (datagram) packets, big-endian, fixed 12-byte header:
//!
//! ```text
//! [1B packet_type][1B flags][4B session_id][2B sequence][4B timestamp][payload]
//! ```
//!
//! The payload length of a datagram is implied by the datagram size.

use crate::error::{Result, ServerError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Packet type code used for routing.
pub type PacketType = u8;

/// Server-assigned session identifier.
pub type SessionId = u32;

/// Size of the reliable length prefix.
pub const RELIABLE_LENGTH_PREFIX: usize = 2;

/// Bytes counted by `total_length` before the payload starts.
pub const RELIABLE_HEADER_BODY: usize = 6;

/// Smallest decodable reliable frame (prefix plus header, empty payload).
pub const RELIABLE_MIN_FRAME: usize = RELIABLE_LENGTH_PREFIX + RELIABLE_HEADER_BODY;

/// Largest payload a reliable frame can carry.
pub const RELIABLE_MAX_PAYLOAD: usize = u16::MAX as usize - RELIABLE_HEADER_BODY;

/// Fixed header size of an unreliable packet.
pub const UNRELIABLE_HEADER: usize = 12;

/// Fields shared by both wire formats.
pub trait Packet {
    fn packet_type(&self) -> PacketType;

    /// Reserved for future use; carried through untouched.
    fn flags(&self) -> u8;

    fn session_id(&self) -> SessionId;

    fn payload(&self) -> &[u8];

    /// Views the payload as UTF-8 text.
    fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(self.payload())
            .map_err(|e| ServerError::MalformedPacket(format!("payload is not UTF-8: {e}")))
    }
}

/// A packet carried on the reliable, ordered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliablePacket {
    pub packet_type: PacketType,
    pub flags: u8,
    pub session_id: SessionId,
    pub payload: Bytes,
}

impl ReliablePacket {
    pub fn new(packet_type: PacketType, session_id: SessionId, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            flags: 0,
            session_id,
            payload: payload.into(),
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Value written into the length prefix.
    pub fn total_length(&self) -> usize {
        RELIABLE_HEADER_BODY + self.payload.len()
    }

    /// Appends the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > RELIABLE_MAX_PAYLOAD {
            return Err(ServerError::PayloadTooLarge(self.payload.len()));
        }

        dst.reserve(RELIABLE_LENGTH_PREFIX + self.total_length());
        dst.put_u16(self.total_length() as u16);
        dst.put_u8(self.packet_type);
        dst.put_u8(self.flags);
        dst.put_u32(self.session_id);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encodes the frame into a standalone buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(RELIABLE_LENGTH_PREFIX + self.total_length());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes one frame from the start of `buf`.
    ///
    /// Trailing bytes beyond the frame are ignored; use
    /// [`FrameBuffer`](super::FrameBuffer) to split a byte stream into frames.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RELIABLE_MIN_FRAME {
            return Err(ServerError::MalformedPacket(format!(
                "reliable frame needs at least {RELIABLE_MIN_FRAME} bytes, got {}",
                buf.len()
            )));
        }

        let total_length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if total_length < RELIABLE_HEADER_BODY {
            return Err(ServerError::MalformedPacket(format!(
                "length prefix {total_length} is shorter than the {RELIABLE_HEADER_BODY}-byte header"
            )));
        }
        if buf.len() < RELIABLE_LENGTH_PREFIX + total_length {
            return Err(ServerError::MalformedPacket(format!(
                "length prefix announces {total_length} bytes, only {} available",
                buf.len() - RELIABLE_LENGTH_PREFIX
            )));
        }

        let mut header = &buf[RELIABLE_LENGTH_PREFIX..RELIABLE_MIN_FRAME];
        let packet_type = header.get_u8();
        let flags = header.get_u8();
        let session_id = header.get_u32();
        let payload =
            Bytes::copy_from_slice(&buf[RELIABLE_MIN_FRAME..RELIABLE_LENGTH_PREFIX + total_length]);

        Ok(Self {
            packet_type,
            flags,
            session_id,
            payload,
        })
    }
}

impl Packet for ReliablePacket {
    fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    fn flags(&self) -> u8 {
        self.flags
    }

    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A packet carried in a single datagram.
///
/// `sequence` and `timestamp` are advisory. The core never reorders or
/// deduplicates on them; handlers interpret them if they want to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreliablePacket {
    pub packet_type: PacketType,
    pub flags: u8,
    pub session_id: SessionId,
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl UnreliablePacket {
    pub fn new(packet_type: PacketType, session_id: SessionId, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            flags: 0,
            session_id,
            sequence: 0,
            timestamp: 0,
            payload: payload.into(),
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(UNRELIABLE_HEADER + self.payload.len());
        dst.put_u8(self.packet_type);
        dst.put_u8(self.flags);
        dst.put_u32(self.session_id);
        dst.put_u16(self.sequence);
        dst.put_u32(self.timestamp);
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(UNRELIABLE_HEADER + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a whole datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < UNRELIABLE_HEADER {
            return Err(ServerError::MalformedPacket(format!(
                "datagram needs at least {UNRELIABLE_HEADER} bytes, got {}",
                datagram.len()
            )));
        }

        let mut header = &datagram[..UNRELIABLE_HEADER];
        Ok(Self {
            packet_type: header.get_u8(),
            flags: header.get_u8(),
            session_id: header.get_u32(),
            sequence: header.get_u16(),
            timestamp: header.get_u32(),
            payload: Bytes::copy_from_slice(&datagram[UNRELIABLE_HEADER..]),
        })
    }
}

impl Packet for UnreliablePacket {
    fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    fn flags(&self) -> u8 {
        self.flags
    }

    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A decoded packet from either transport, as handed to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket {
    Reliable(ReliablePacket),
    Unreliable(UnreliablePacket),
}

impl InboundPacket {
    pub fn is_reliable(&self) -> bool {
        matches!(self, InboundPacket::Reliable(_))
    }

    fn inner(&self) -> &dyn Packet {
        match self {
            InboundPacket::Reliable(p) => p,
            InboundPacket::Unreliable(p) => p,
        }
    }
}

impl Packet for InboundPacket {
    fn packet_type(&self) -> PacketType {
        self.inner().packet_type()
    }

    fn flags(&self) -> u8 {
        self.inner().flags()
    }

    fn session_id(&self) -> SessionId {
        self.inner().session_id()
    }

    fn payload(&self) -> &[u8] {
        self.inner().payload()
    }
}

impl From<ReliablePacket> for InboundPacket {
    fn from(packet: ReliablePacket) -> Self {
        InboundPacket::Reliable(packet)
    }
}

impl From<UnreliablePacket> for InboundPacket {
    fn from(packet: UnreliablePacket) -> Self {
        InboundPacket::Unreliable(packet)
    }
}
