//! Tokio codec for session frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, FrameType, MAX_PAYLOAD_SIZE};
use crate::request::{DialRequest, DialResponse};
use crate::stream_id::StreamId;

/// A complete frame with header fields and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    pub fn open(stream_id: StreamId, req: &DialRequest) -> Self {
        Self::new(FrameType::Open, stream_id, req.encode())
    }

    pub fn accept(stream_id: StreamId, resp: &DialResponse) -> Self {
        Self::new(FrameType::Accept, stream_id, resp.encode())
    }

    pub fn reject(stream_id: StreamId, code: u16) -> Self {
        Self::new(
            FrameType::Reject,
            stream_id,
            Bytes::copy_from_slice(&code.to_be_bytes()),
        )
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    pub fn ack(stream_id: StreamId, credit: u32) -> Self {
        Self::new(
            FrameType::Ack,
            stream_id,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    /// Same frame addressed to another stream ID
    pub fn with_stream_id(mut self, stream_id: StreamId) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Error code carried by a REJECT
    pub fn reject_code(&self) -> Result<u16, ProtocolError> {
        self.fixed_u("reject code", 2).map(|mut p| p.get_u16())
    }

    /// Credit carried by an ACK
    pub fn ack_credit(&self) -> Result<u32, ProtocolError> {
        self.fixed_u("ack credit", 4).map(|mut p| p.get_u32())
    }

    fn fixed_u(&self, what: &'static str, len: usize) -> Result<&[u8], ProtocolError> {
        if self.payload.len() != len {
            return Err(ProtocolError::Malformed {
                what,
                expected: len,
                actual: self.payload.len(),
            });
        }
        Ok(&self.payload[..])
    }
}

/// Codec for encoding/decoding session frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            frame_type: header.frame_type,
            stream_id: header.stream_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(frame.frame_type, frame.stream_id, payload_len as u16).encode(dst);
        dst.put_slice(&frame.payload);

        Ok(())
    }
}
