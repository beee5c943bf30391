//! Frame splitting on top of the fixed binary header
//!
//! `DcpCodec` plugs into `tokio_util::codec::{FramedRead, FramedWrite}`;
//! one decoded [`Frame`] is one complete protocol message. The body is
//! kept as a single `Bytes` and sliced lazily by the section accessors,
//! so payload bytes are never copied after the read buffer split.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::header::{FrameHeader, HEADER_SIZE};

/// Frames larger than this are treated as protocol corruption (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One complete wire message: header plus undivided body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    /// Build a frame from header skeleton and body sections
    ///
    /// Section lengths are written into the header; callers only supply
    /// magic, opcode, vbucket/status, opaque and cas.
    pub fn build(mut header: FrameHeader, extras: &[u8], key: &[u8], value: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(extras.len() + key.len() + value.len());
        body.extend_from_slice(extras);
        body.extend_from_slice(key);
        body.extend_from_slice(value);
        header.framing_extras_length = 0;
        header.extras_length = extras.len() as u8;
        header.key_length = key.len() as u16;
        header.total_body_length = body.len() as u32;
        Self {
            header,
            body: body.freeze(),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    /// Total size on the wire, header included
    ///
    /// This is the unit of flow-control accounting.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn extras(&self) -> Bytes {
        let start = usize::from(self.header.framing_extras_length);
        let end = start + usize::from(self.header.extras_length);
        self.body.slice(start..end.min(self.body.len()))
    }

    pub fn key(&self) -> Bytes {
        let start = usize::from(self.header.framing_extras_length)
            + usize::from(self.header.extras_length);
        let end = start + usize::from(self.header.key_length);
        self.body.slice(start.min(self.body.len())..end.min(self.body.len()))
    }

    pub fn value(&self) -> Bytes {
        let start = usize::from(self.header.framing_extras_length)
            + usize::from(self.header.extras_length)
            + usize::from(self.header.key_length);
        self.body.slice(start.min(self.body.len())..)
    }
}

/// Length-prefixed splitter for the binary protocol
#[derive(Debug, Clone)]
pub struct DcpCodec {
    max_frame_size: usize,
}

impl DcpCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for DcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DcpCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::decode(&src[..HEADER_SIZE])?;
        let body_len = header.total_body_length as usize;
        if body_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                limit: self.max_frame_size,
            });
        }
        if src.len() < HEADER_SIZE + body_len {
            src.reserve(HEADER_SIZE + body_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Frame { header, body }))
    }
}

impl Encoder<Frame> for DcpCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(frame.wire_len());
        frame.header.encode(dst);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod tests;
