//! Frame header encoding/decoding
//!
//! Every frame on an established session starts with a 5-byte header:
//! - frame_type: 1 byte (u8)
//! - stream_id: 2 bytes (u16, big-endian)
//! - payload_length: 2 bytes (u16, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::stream_id::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (limited by the 16-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame types of the stream protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Signed request to open a stream
    Open = 0x01,
    /// Signed acceptance of an OPEN
    Accept = 0x02,
    /// Refusal of an OPEN, carrying an error code
    Reject = 0x03,
    /// Stream payload
    Data = 0x04,
    /// Flow-control credit update
    Ack = 0x05,
    /// Half-close of the sender's direction
    Close = 0x06,
}

impl FrameType {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Accept),
            0x03 => Some(Self::Reject),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Ack),
            0x06 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub stream_id: StreamId,
    pub payload_length: u16,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, stream_id: StreamId, payload_length: u16) -> Self {
        Self {
            frame_type,
            stream_id,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u16(self.stream_id.as_u16());
        dst.put_u16(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the frame type is unknown.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let type_byte = src[0];
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(ProtocolError::UnknownFrameType(type_byte))?;

        src.advance(1);
        let stream_id = StreamId::new(src.get_u16());
        let payload_length = src.get_u16();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload_length,
        }))
    }
}
