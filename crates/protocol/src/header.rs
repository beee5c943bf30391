//! The fixed 24-byte memcached binary header

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Request magic byte
pub const MAGIC_REQ: u8 = 0x80;
/// Response magic byte
pub const MAGIC_RES: u8 = 0x81;
/// Request magic with flexible framing extras
pub const MAGIC_REQ_FLEX: u8 = 0x08;
/// Response magic with flexible framing extras
pub const MAGIC_RES_FLEX: u8 = 0x18;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 24;

/// Decoded form of the fixed binary header
///
/// For flexible-framing magics the second header byte pair is
/// `(framing extras len, key len)` instead of a 16-bit key length;
/// both layouts normalise into this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u8,
    pub opcode: u8,
    pub framing_extras_length: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    /// vbucket id on requests, status code on responses
    pub vbucket_or_status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl FrameHeader {
    /// Build a request header with no framing extras
    pub fn request(opcode: u8, vbucket: u16) -> Self {
        Self {
            magic: MAGIC_REQ,
            opcode,
            framing_extras_length: 0,
            key_length: 0,
            extras_length: 0,
            data_type: 0,
            vbucket_or_status: vbucket,
            total_body_length: 0,
            opaque: 0,
            cas: 0,
        }
    }

    /// Build a response header with the given status
    pub fn response(opcode: u8, status: u16) -> Self {
        Self {
            magic: MAGIC_RES,
            ..Self::request(opcode, status)
        }
    }

    pub fn is_request(&self) -> bool {
        self.magic == MAGIC_REQ || self.magic == MAGIC_REQ_FLEX
    }

    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RES || self.magic == MAGIC_RES_FLEX
    }

    /// Status code of a response frame
    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    /// vbucket id of a request frame
    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated { what: "header" });
        }
        let magic = buf.get_u8();
        let opcode = buf.get_u8();
        let (framing_extras_length, key_length) = match magic {
            MAGIC_REQ | MAGIC_RES => (0, buf.get_u16()),
            MAGIC_REQ_FLEX | MAGIC_RES_FLEX => {
                let framing = buf.get_u8();
                (framing, u16::from(buf.get_u8()))
            }
            other => return Err(ProtocolError::InvalidMagic(other)),
        };
        let extras_length = buf.get_u8();
        let data_type = buf.get_u8();
        let vbucket_or_status = buf.get_u16();
        let total_body_length = buf.get_u32();
        let opaque = buf.get_u32();
        let cas = buf.get_u64();

        let sections =
            u32::from(framing_extras_length) + u32::from(key_length) + u32::from(extras_length);
        if sections > total_body_length {
            return Err(ProtocolError::InvalidHeader {
                reason: "section lengths exceed total body length",
            });
        }

        Ok(Self {
            magic,
            opcode,
            framing_extras_length,
            key_length,
            extras_length,
            data_type,
            vbucket_or_status,
            total_body_length,
            opaque,
            cas,
        })
    }

    /// Encode the header into `dst`
    ///
    /// Flexible framing is never produced by this client, so `magic` is
    /// always one of the plain variants on the encode path.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.magic);
        dst.put_u8(self.opcode);
        dst.put_u16(self.key_length);
        dst.put_u8(self.extras_length);
        dst.put_u8(self.data_type);
        dst.put_u16(self.vbucket_or_status);
        dst.put_u32(self.total_body_length);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
    }
}

#[cfg(test)]
#[path = "header_test.rs"]
mod tests;
