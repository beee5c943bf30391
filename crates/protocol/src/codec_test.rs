//! Tests for the frame splitter

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::*;
use crate::error::ProtocolError;
use crate::header::FrameHeader;

fn sample_frame() -> Frame {
    let mut header = FrameHeader::request(0x57, 7);
    header.cas = 99;
    Frame::build(header, &[1, 2, 3, 4], b"key", b"value-bytes")
}

#[test]
fn test_encode_decode_roundtrip() {
    let frame = sample_frame();
    let mut codec = DcpCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(frame.clone(), &mut buf).unwrap();
    assert_eq!(buf.len(), frame.wire_len());

    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, frame);
    assert!(buf.is_empty());
}

#[test]
fn test_partial_frames_wait_for_more() {
    let frame = sample_frame();
    let mut codec = DcpCodec::new();
    let mut wire = BytesMut::new();
    codec.encode(frame.clone(), &mut wire).unwrap();

    // feed byte by byte; nothing decodes until the full frame is in
    let mut buf = BytesMut::new();
    let total = wire.len();
    for (i, byte) in wire.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let result = codec.decode(&mut buf).unwrap();
        if i + 1 < total {
            assert!(result.is_none(), "decoded early at byte {i}");
        } else {
            assert_eq!(result.unwrap(), frame);
        }
    }
}

#[test]
fn test_two_frames_in_one_read() {
    let a = sample_frame();
    let b = Frame::build(FrameHeader::request(0x56, 3), &[9; 20], &[], &[]);
    let mut codec = DcpCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(a.clone(), &mut buf).unwrap();
    codec.encode(b.clone(), &mut buf).unwrap();

    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_oversized_frame_rejected() {
    let mut codec = DcpCodec::with_max_frame_size(64);
    let frame = Frame::build(FrameHeader::request(0x57, 0), &[], &[], &[0u8; 128]);
    let mut buf = BytesMut::new();
    DcpCodec::new().encode(frame, &mut buf).unwrap();
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ProtocolError::FrameTooLarge { size: 128, limit: 64 })
    ));
}

#[test]
fn test_section_accessors() {
    let frame = sample_frame();
    assert_eq!(&frame.extras()[..], &[1, 2, 3, 4]);
    assert_eq!(&frame.key()[..], b"key");
    assert_eq!(&frame.value()[..], b"value-bytes");
}
