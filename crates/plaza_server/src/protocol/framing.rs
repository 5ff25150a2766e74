//! Accumulate-then-extract framing for the reliable stream.
//!
//! A stream read may return part of a frame, exactly one frame, or several
//! frames glued together. [`FrameBuffer`] keeps every byte it is given and
//! only hands out a frame once its full `2 + total_length` bytes are present.

use super::packet::{
    ReliablePacket, RELIABLE_HEADER_BODY, RELIABLE_LENGTH_PREFIX,
};
use crate::error::{Result, ServerError};
use bytes::{Buf, BytesMut};

/// Per-connection receive buffer.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends bytes received from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next complete frame, if any.
    ///
    /// Returns `None` when the buffered bytes do not yet form a whole frame.
    /// A frame whose length prefix is shorter than the packet header is
    /// consumed and reported as `MalformedPacket`; the bytes after it stay
    /// buffered so the caller can keep extracting.
    pub fn next_frame(&mut self) -> Option<Result<ReliablePacket>> {
        if self.buffer.len() < RELIABLE_LENGTH_PREFIX {
            return None;
        }

        let total_length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        let frame_len = RELIABLE_LENGTH_PREFIX + total_length;
        if self.buffer.len() < frame_len {
            return None;
        }

        if total_length < RELIABLE_HEADER_BODY {
            self.buffer.advance(frame_len);
            return Some(Err(ServerError::MalformedPacket(format!(
                "length prefix {total_length} is shorter than the {RELIABLE_HEADER_BODY}-byte header"
            ))));
        }

        let frame = self.buffer.split_to(frame_len);
        Some(ReliablePacket::decode(&frame))
    }

    /// Drains every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Vec<Result<ReliablePacket>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}
