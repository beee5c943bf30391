//! Typed views over received frames
//!
//! Parsing is strict about the sections the state machine depends on
//! (seqnos, snapshot bounds, event ids) and deliberately loose about
//! trailing extras added by newer server versions, which are ignored.

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::codec::Frame;
use crate::error::ProtocolError;
use crate::stream_end::StreamEndReason;

/// One `(uuid, seqno)` pair of a partition's failover history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// Which kind of document change a data frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Mutation,
    Deletion,
    Expiration,
}

/// A mutation, deletion or expiration handed to the data callback
///
/// The document body is opaque to the client and passed through untouched.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub kind: DataKind,
    pub vbid: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    /// Mutation-only; zero for deletions and expirations
    pub flags: u32,
    /// Mutation-only; zero for deletions and expirations
    pub expiry: u32,
    pub key: Bytes,
    pub content: Bytes,
}

/// Snapshot window announcement preceding its mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub vbid: u16,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

/// Boundary of an out-of-order snapshot window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsoSnapshot {
    pub vbid: u16,
    /// true for window start, false for window end
    pub start: bool,
}

/// Collection/scope topology changes delivered in-stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEventKind {
    CollectionCreated {
        scope_id: u32,
        collection_id: u32,
        name: Bytes,
        /// Absent in version-0 events
        max_ttl: Option<u32>,
    },
    CollectionDropped {
        scope_id: u32,
        collection_id: u32,
    },
    CollectionFlushed {
        scope_id: u32,
        collection_id: u32,
    },
    ScopeCreated {
        scope_id: u32,
        name: Bytes,
    },
    ScopeDropped {
        scope_id: u32,
    },
    CollectionChanged {
        scope_id: u32,
        collection_id: u32,
        max_ttl: u32,
    },
}

/// A parsed DCP_SYSTEM_EVENT frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEventMessage {
    pub vbid: u16,
    pub seqno: u64,
    pub version: u8,
    pub manifest_uid: u64,
    pub kind: SystemEventKind,
}

fn need(buf: &Bytes, len: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated { what });
    }
    Ok(())
}

/// Parse a DCP_MUTATION / DCP_DELETION / DCP_EXPIRATION frame
pub fn parse_data_event(frame: &Frame, kind: DataKind) -> Result<DataEvent, ProtocolError> {
    let mut extras = frame.extras();
    need(&extras, 16, "data event extras")?;
    let by_seqno = extras.get_u64();
    let rev_seqno = extras.get_u64();
    // flags/expiry only exist on the 31-byte mutation layout
    let (flags, expiry) = if kind == DataKind::Mutation && extras.remaining() >= 8 {
        (extras.get_u32(), extras.get_u32())
    } else {
        (0, 0)
    };
    Ok(DataEvent {
        kind,
        vbid: frame.header.vbucket(),
        by_seqno,
        rev_seqno,
        cas: frame.header.cas,
        flags,
        expiry,
        key: frame.key(),
        content: frame.value(),
    })
}

/// Parse a DCP_SNAPSHOT_MARKER frame (v1 extras: start, end, flags)
pub fn parse_snapshot_marker(frame: &Frame) -> Result<SnapshotMarker, ProtocolError> {
    let mut extras = frame.extras();
    need(&extras, 20, "snapshot marker extras")?;
    Ok(SnapshotMarker {
        vbid: frame.header.vbucket(),
        start_seqno: extras.get_u64(),
        end_seqno: extras.get_u64(),
        flags: extras.get_u32(),
    })
}

/// Parse a DCP_STREAM_END frame; extras carry the reason flags
pub fn parse_stream_end(frame: &Frame) -> Result<(u16, StreamEndReason), ProtocolError> {
    let mut extras = frame.extras();
    need(&extras, 4, "stream end extras")?;
    Ok((
        frame.header.vbucket(),
        StreamEndReason::from_wire(extras.get_u32()),
    ))
}

/// Parse a DCP_OSO_SNAPSHOT frame; extras flag 0x01 = start, 0x02 = end
pub fn parse_oso_snapshot(frame: &Frame) -> Result<OsoSnapshot, ProtocolError> {
    let mut extras = frame.extras();
    need(&extras, 4, "OSO snapshot extras")?;
    let flags = extras.get_u32();
    let start = flags & 0x01 != 0;
    if !start && flags & 0x02 == 0 {
        return Err(ProtocolError::InvalidHeader {
            reason: "OSO snapshot without start or end flag",
        });
    }
    Ok(OsoSnapshot {
        vbid: frame.header.vbucket(),
        start,
    })
}

/// Parse a failover-log body into oldest→newest order
///
/// The wire carries the most recent entry first; storage order is
/// reversed so the newest entry is always last.
pub fn parse_failover_log(value: &Bytes) -> Result<Vec<FailoverEntry>, ProtocolError> {
    if value.len() % 16 != 0 {
        return Err(ProtocolError::Truncated {
            what: "failover log entry",
        });
    }
    let mut buf = value.clone();
    let mut entries = Vec::with_capacity(buf.len() / 16);
    while buf.remaining() >= 16 {
        entries.push(FailoverEntry {
            uuid: buf.get_u64(),
            seqno: buf.get_u64(),
        });
    }
    entries.reverse();
    Ok(entries)
}

/// Parse a GET_ALL_VB_SEQNOS body into `(vbid, seqno)` pairs
pub fn parse_seqnos(value: &Bytes) -> Result<Vec<(u16, u64)>, ProtocolError> {
    if value.len() % 10 != 0 {
        return Err(ProtocolError::Truncated {
            what: "vbucket seqno pair",
        });
    }
    let mut buf = value.clone();
    let mut pairs = Vec::with_capacity(buf.len() / 10);
    while buf.remaining() >= 10 {
        pairs.push((buf.get_u16(), buf.get_u64()));
    }
    Ok(pairs)
}

/// Rollback point carried in a STREAM_REQ response with status ROLLBACK
pub fn parse_rollback_seqno(frame: &Frame) -> Result<u64, ProtocolError> {
    let mut value = frame.value();
    need(&value, 8, "rollback seqno")?;
    Ok(value.get_u64())
}

/// Seqno carried by a DCP_SEQNO_ADVANCED frame
pub fn parse_seqno_advanced(frame: &Frame) -> Result<(u16, u64), ProtocolError> {
    let mut extras = frame.extras();
    need(&extras, 8, "seqno advanced extras")?;
    Ok((frame.header.vbucket(), extras.get_u64()))
}

/// Parse a DCP_SYSTEM_EVENT frame
///
/// Extras are `(seqno, event id, version)`; the value layout depends on
/// the event id and matches what Couchbase Server emits for collection
/// and scope changes.
pub fn parse_system_event(frame: &Frame) -> Result<SystemEventMessage, ProtocolError> {
    let mut extras = frame.extras();
    need(&extras, 13, "system event extras")?;
    let seqno = extras.get_u64();
    let event_id = extras.get_u32();
    let version = extras.get_u8();

    let mut value = frame.value();
    need(&value, 8, "system event manifest uid")?;
    let manifest_uid = value.get_u64();

    let kind = match event_id {
        0 => {
            need(&value, 8, "collection created payload")?;
            let scope_id = value.get_u32();
            let collection_id = value.get_u32();
            let max_ttl = (value.remaining() >= 4).then(|| value.get_u32());
            SystemEventKind::CollectionCreated {
                scope_id,
                collection_id,
                name: frame.key(),
                max_ttl,
            }
        }
        1 => {
            need(&value, 8, "collection dropped payload")?;
            SystemEventKind::CollectionDropped {
                scope_id: value.get_u32(),
                collection_id: value.get_u32(),
            }
        }
        2 => {
            need(&value, 8, "collection flushed payload")?;
            SystemEventKind::CollectionFlushed {
                scope_id: value.get_u32(),
                collection_id: value.get_u32(),
            }
        }
        3 => {
            need(&value, 4, "scope created payload")?;
            SystemEventKind::ScopeCreated {
                scope_id: value.get_u32(),
                name: frame.key(),
            }
        }
        4 => {
            need(&value, 4, "scope dropped payload")?;
            SystemEventKind::ScopeDropped {
                scope_id: value.get_u32(),
            }
        }
        5 => {
            need(&value, 12, "collection changed payload")?;
            SystemEventKind::CollectionChanged {
                scope_id: value.get_u32(),
                collection_id: value.get_u32(),
                max_ttl: value.get_u32(),
            }
        }
        _ => {
            return Err(ProtocolError::InvalidHeader {
                reason: "unknown system event id",
            });
        }
    };

    Ok(SystemEventMessage {
        vbid: frame.header.vbucket(),
        seqno,
        version,
        manifest_uid,
        kind,
    })
}

#[cfg(test)]
#[path = "view_test.rs"]
mod tests;
