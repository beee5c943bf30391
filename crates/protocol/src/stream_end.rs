//! Stream-end reasons

use std::fmt;

/// Why the producer (or this client) closed a stream
///
/// `ChannelDropped` and `Unknown` are never put on the wire by a server:
/// the first is synthesised locally when a connection dies with streams
/// open, the second preserves unmapped wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEndReason {
    /// The stream has finished without error
    Ok,
    /// The close-stream command forced this stream shut
    Closed,
    /// The vbucket moved to a state the consumer does not receive
    StateChanged,
    /// The producer is disconnecting; a channel drop follows
    Disconnected,
    /// The consumer could not keep up with the producer
    TooSlow,
    /// The stream closed early due to a backfill failure
    BackfillFail,
    /// The vbucket is rolling back; the stream must be reopened
    Rollback,
    /// Every collection the stream filtered on has been dropped
    FilterEmpty,
    /// The connection lost the privileges required for the stream
    LostPrivileges,
    /// The stream ended because its channel was dropped abruptly
    ChannelDropped,
    /// A wire value this client does not map
    Unknown(u32),
}

impl StreamEndReason {
    pub fn from_wire(value: u32) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::Closed,
            0x02 => Self::StateChanged,
            0x03 => Self::Disconnected,
            0x04 => Self::TooSlow,
            0x05 => Self::BackfillFail,
            0x06 => Self::Rollback,
            0x07 => Self::FilterEmpty,
            0x08 => Self::LostPrivileges,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for StreamEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(value) => write!(f, "Unknown(0x{value:02x})"),
            other => write!(f, "{other:?}"),
        }
    }
}
