//! Typed request encoders
//!
//! Each function produces a complete [`Frame`] ready for the writer. The
//! conventions mirror what Couchbase Server expects: stream-scoped
//! requests carry the vbucket id in both the header vbucket field and the
//! opaque, so responses route back to the partition without a pending-map.

use bytes::{BufMut, BytesMut};

use crate::codec::Frame;
use crate::header::FrameHeader;
use crate::opcode::Opcode;

/// DCP_OPEN flag requesting a producer-side connection
pub const OPEN_FLAG_PRODUCER: u32 = 0x01;

/// vbucket-state filter for GET_ALL_VB_SEQNOS: active vbuckets only
pub const VBUCKET_STATE_ACTIVE: u32 = 0x01;

pub fn sasl_list_mechs() -> Frame {
    Frame::build(
        FrameHeader::request(Opcode::SaslListMechs.into(), 0),
        &[],
        &[],
        &[],
    )
}

/// SASL AUTH with the PLAIN mechanism: `\0user\0password`
pub fn sasl_auth_plain(username: &str, password: &str) -> Frame {
    let mut value = BytesMut::with_capacity(2 + username.len() + password.len());
    value.put_u8(0);
    value.put_slice(username.as_bytes());
    value.put_u8(0);
    value.put_slice(password.as_bytes());
    Frame::build(
        FrameHeader::request(Opcode::SaslAuth.into(), 0),
        &[],
        b"PLAIN",
        &value,
    )
}

/// DCP_OPEN naming the connection; extras are `(seqno, flags)`
pub fn dcp_open(connection_name: &str, flags: u32) -> Frame {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(0);
    extras.put_u32(flags);
    Frame::build(
        FrameHeader::request(Opcode::DcpOpen.into(), 0),
        &extras,
        connection_name.as_bytes(),
        &[],
    )
}

/// DCP_CONTROL key/value negotiation
pub fn dcp_control(key: &str, value: &str) -> Frame {
    Frame::build(
        FrameHeader::request(Opcode::DcpControl.into(), 0),
        &[],
        key.as_bytes(),
        value.as_bytes(),
    )
}

/// DCP_STREAM_REQ with the 48-byte extras layout
///
/// `filter` is the optional JSON stream filter (collections / stream id)
/// carried in the value section.
#[allow(clippy::too_many_arguments)]
pub fn stream_request(
    vbid: u16,
    start_seqno: u64,
    end_seqno: u64,
    vbuuid: u64,
    snapshot_start_seqno: u64,
    snapshot_end_seqno: u64,
    filter: Option<&str>,
) -> Frame {
    let mut extras = BytesMut::with_capacity(48);
    extras.put_u32(0); // flags
    extras.put_u32(0); // reserved
    extras.put_u64(start_seqno);
    extras.put_u64(end_seqno);
    extras.put_u64(vbuuid);
    extras.put_u64(snapshot_start_seqno);
    extras.put_u64(snapshot_end_seqno);
    let mut header = FrameHeader::request(Opcode::DcpStreamReq.into(), vbid);
    header.opaque = u32::from(vbid);
    Frame::build(
        header,
        &extras,
        &[],
        filter.map(str::as_bytes).unwrap_or_default(),
    )
}

pub fn close_stream(vbid: u16) -> Frame {
    let mut header = FrameHeader::request(Opcode::DcpCloseStream.into(), vbid);
    header.opaque = u32::from(vbid);
    Frame::build(header, &[], &[], &[])
}

pub fn get_failover_log(vbid: u16) -> Frame {
    let mut header = FrameHeader::request(Opcode::DcpGetFailoverLog.into(), vbid);
    header.opaque = u32::from(vbid);
    Frame::build(header, &[], &[], &[])
}

/// GET_ALL_VB_SEQNOS filtered to the given vbucket state
pub fn get_seqnos(vbucket_state: u32) -> Frame {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(vbucket_state);
    Frame::build(
        FrameHeader::request(Opcode::GetAllVbSeqnos.into(), 0),
        &extras,
        &[],
        &[],
    )
}

/// DCP_BUFFER_ACK crediting `bytes` back to the producer window
pub fn buffer_ack(bytes: u32) -> Frame {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(bytes);
    Frame::build(
        FrameHeader::request(Opcode::DcpBufferAck.into(), 0),
        &extras,
        &[],
        &[],
    )
}

pub fn get_collections_manifest() -> Frame {
    Frame::build(
        FrameHeader::request(Opcode::GetCollectionsManifest.into(), 0),
        &[],
        &[],
        &[],
    )
}

/// Success reply to a server-initiated DCP_NOOP
pub fn noop_reply(opaque: u32) -> Frame {
    let mut header = FrameHeader::response(Opcode::DcpNoop.into(), 0);
    header.opaque = opaque;
    Frame::build(header, &[], &[], &[])
}

#[cfg(test)]
#[path = "request_test.rs"]
mod tests;
