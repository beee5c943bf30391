//! Tests for header encode/decode

use bytes::BytesMut;

use super::*;
use crate::error::ProtocolError;

fn roundtrip(header: FrameHeader) -> FrameHeader {
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    assert_eq!(buf.len(), HEADER_SIZE);
    FrameHeader::decode(&buf).unwrap()
}

#[test]
fn test_request_roundtrip() {
    let mut header = FrameHeader::request(0x53, 12);
    header.extras_length = 48;
    header.total_body_length = 48;
    header.opaque = 12;
    header.cas = 0xdead_beef;
    assert_eq!(roundtrip(header), header);
}

#[test]
fn test_response_roundtrip() {
    let mut header = FrameHeader::response(0x53, 0x0023);
    header.total_body_length = 8;
    assert_eq!(roundtrip(header), header);
    assert!(header.is_response());
    assert_eq!(header.status(), 0x0023);
}

#[test]
fn test_flex_magic_key_length() {
    // flex layout: byte 2 = framing extras len, byte 3 = key len
    let mut raw = [0u8; HEADER_SIZE];
    raw[0] = MAGIC_RES_FLEX;
    raw[1] = 0x57;
    raw[2] = 3; // framing extras
    raw[3] = 5; // key
    raw[4] = 16; // extras
    raw[11] = 24; // total body
    let header = FrameHeader::decode(&raw).unwrap();
    assert_eq!(header.framing_extras_length, 3);
    assert_eq!(header.key_length, 5);
    assert_eq!(header.extras_length, 16);
    assert_eq!(header.total_body_length, 24);
    assert!(header.is_response());
}

#[test]
fn test_bad_magic_rejected() {
    let mut raw = [0u8; HEADER_SIZE];
    raw[0] = 0x42;
    assert!(matches!(
        FrameHeader::decode(&raw),
        Err(ProtocolError::InvalidMagic(0x42))
    ));
}

#[test]
fn test_sections_exceeding_body_rejected() {
    let mut raw = [0u8; HEADER_SIZE];
    raw[0] = MAGIC_REQ;
    raw[3] = 10; // key length low byte
    raw[4] = 4; // extras
    raw[11] = 8; // total body smaller than key + extras
    assert!(matches!(
        FrameHeader::decode(&raw),
        Err(ProtocolError::InvalidHeader { .. })
    ));
}

#[test]
fn test_short_buffer_rejected() {
    assert!(matches!(
        FrameHeader::decode(&[0x80, 0x53]),
        Err(ProtocolError::Truncated { .. })
    ));
}
